use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use walkdir::WalkDir;

use imgdoc::document::{DocumentEvent, DocumentFactory, ImplKind, LoaderContext, LoadingState};
use imgdoc::geometry::RectF;
use imgdoc::scaler::{ChunkCache, ImageScaler, TransformationMode};
use imgdoc::transport::DocumentUrl;
use imgdoc::LoaderConfig;

/// Extensions picked up when a directory is given.
const EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff", "svg", "mp4", "m4v", "mov", "mkv",
    "webm", "avi",
];

/// Inverted zoom of the preview requested before the full image.
const PREVIEW_INVERTED_ZOOM: u32 = 4;

const LOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct CliArgs {
    pub inputs: Vec<PathBuf>,
    pub zoom: f64,
    pub fast: bool,
}

pub fn usage() -> &'static str {
    "Usage: imgdoc <path|dir>... [--zoom Z] [--fast]"
}

pub fn parse_args<I>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = String>,
{
    let mut inputs = Vec::new();
    let mut zoom = 1.0;
    let mut fast = false;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--zoom" => {
                let value = args.next().context("Missing value for --zoom")?;
                zoom = value
                    .parse::<f64>()
                    .with_context(|| format!("Failed to parse --zoom value {:?}", value))?;
            }
            "--fast" => fast = true,
            other if other.starts_with('-') => bail!("Unknown option {}\n{}", other, usage()),
            _ => inputs.push(PathBuf::from(arg)),
        }
    }

    if inputs.is_empty() {
        bail!("{}", usage());
    }
    if !(zoom > 0.0 && zoom.is_finite()) {
        bail!("--zoom must be a positive number");
    }
    Ok(CliArgs { inputs, zoom, fast })
}

fn has_known_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Expand directories into the image files below them, sorted by path.
pub fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(input)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file() && has_known_extension(e.path()))
                .map(|e| e.into_path())
                .collect();
            found.sort();
            files.extend(found);
        } else if input.exists() {
            files.push(input.clone());
        } else {
            bail!("Path does not exist: {}", input.display());
        }
    }
    Ok(files)
}

#[derive(Debug, Default)]
struct Summary {
    loaded: usize,
    failed: usize,
}

pub fn run(args: CliArgs) -> Result<i32> {
    let config = LoaderConfig::global();
    let files = collect_inputs(&args.inputs)?;
    info!(files = files.len(), zoom = args.zoom, "Loading documents");

    let context = LoaderContext::from_config(config);
    let mut factory = DocumentFactory::new(context.clone());
    let cache = Arc::new(ChunkCache::new(config.chunk_cache_bytes));
    let mode = if args.fast {
        TransformationMode::Fast
    } else {
        TransformationMode::Smooth
    };
    let mut summary = Summary::default();

    for path in &files {
        let path = path
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", path.display()))?;
        let url = DocumentUrl::from_path(&path);
        let started = Instant::now();

        let doc = factory.load(&url);
        let mut doc = doc.borrow_mut();
        // The full request goes in once metadata is known, so it queues behind
        // the preview instead of replacing it.
        doc.request_image(PREVIEW_INVERTED_ZOOM);
        let mut events = doc.wait_until(LOAD_TIMEOUT, |doc| {
            doc.loading_state() != LoadingState::Loading
        });
        doc.request_image(1);
        events.extend(doc.wait_until(LOAD_TIMEOUT, |doc| {
            matches!(
                doc.loading_state(),
                LoadingState::FullyLoaded | LoadingState::LoadingFailed
            )
        }));
        let preview = events
            .iter()
            .find_map(|event| match event {
                DocumentEvent::PreviewReady { image, .. } => Some(image.dimensions()),
                _ => None,
            });

        match doc.loading_state() {
            LoadingState::FullyLoaded => summary.loaded += 1,
            state => {
                summary.failed += 1;
                warn!(
                    url = %url,
                    ?state,
                    error = doc.error().unwrap_or("timed out"),
                    "Document did not load"
                );
                println!("{}\tfailed\t{}", url.file_name(), doc.error().unwrap_or("timed out"));
                continue;
            }
        }

        let format = doc.format().map(|f| f.name()).unwrap_or("?");
        let (width, height) = doc.size().unwrap_or((0, 0));
        let scaled = match doc.kind() {
            ImplKind::Vector => doc
                .render(args.zoom)
                .and_then(|result| result.ok())
                .map(|image| image.dimensions()),
            ImplKind::Raster | ImplKind::Jpeg => doc
                .image()
                .map(|image| scale_image(&context, &cache, Arc::clone(image), args.zoom, mode))
                .transpose()?,
            _ => None,
        };

        println!(
            "{}\t{}\t{}x{}\t{}°\tpreview={}\tscaled={}\t{} ms",
            url.file_name(),
            format,
            width,
            height,
            doc.rotation_angle(),
            preview.map_or("-".to_string(), |(w, h)| format!("{}x{}", w, h)),
            scaled.map_or("-".to_string(), |(w, h)| format!("{}x{}", w, h)),
            started.elapsed().as_millis()
        );
    }

    factory.poll_all();
    info!(
        loaded = summary.loaded,
        failed = summary.failed,
        cached_bytes = cache.memory_usage(),
        "Done"
    );
    Ok(if summary.failed == 0 { 0 } else { 1 })
}

/// Scale the whole image through the chunk pipeline and return the scaled size.
fn scale_image(
    context: &LoaderContext,
    cache: &Arc<ChunkCache>,
    image: Arc<image::RgbaImage>,
    zoom: f64,
    mode: TransformationMode,
) -> Result<(u32, u32)> {
    let (width, height) = image.dimensions();
    let mut scaler = ImageScaler::from_config(Arc::clone(&context.spawner), LoaderConfig::global())
        .with_cache(Arc::clone(cache));
    scaler.set_source(image);
    scaler.set_zoom(zoom);
    scaler.set_transformation_mode(mode);
    scaler.set_region(RectF::new(0.0, 0.0, f64::from(width), f64::from(height)));

    let deadline = Instant::now() + LOAD_TIMEOUT;
    let mut chunks = 0usize;
    while scaler.is_running() {
        if Instant::now() >= deadline {
            bail!("Timed out scaling image");
        }
        chunks += scaler.wait(Duration::from_millis(100)).len();
    }

    let bounds = scaler
        .destination_bounds()
        .context("Image has no scaled area")?;
    tracing::debug!(chunks, cache_hits = scaler.cache_hits(), ?bounds, "Scaled image");
    Ok((bounds.width as u32, bounds.height as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        let parsed = parse_args(args(&["a.jpg", "--zoom", "0.5", "dir", "--fast"])).unwrap();
        assert_eq!(parsed.inputs, vec![PathBuf::from("a.jpg"), PathBuf::from("dir")]);
        assert_eq!(parsed.zoom, 0.5);
        assert!(parsed.fast);
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(parse_args(args(&[])).is_err());
        assert!(parse_args(args(&["a.jpg", "--zoom"])).is_err());
        assert!(parse_args(args(&["a.jpg", "--zoom", "-1"])).is_err());
        assert!(parse_args(args(&["a.jpg", "--bogus"])).is_err());
    }

    #[test]
    fn test_collect_inputs_walks_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("b.PNG"), b"").unwrap();
        fs::write(dir.path().join("nested/a.jpg"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let files = collect_inputs(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(
            files,
            vec![dir.path().join("b.PNG"), dir.path().join("nested/a.jpg")]
        );
        assert!(collect_inputs(&[dir.path().join("missing")]).is_err());
    }

    #[test]
    fn test_run_loads_directory() {
        let dir = tempfile::tempdir().unwrap();
        image::RgbImage::from_pixel(64, 48, image::Rgb([200, 40, 90]))
            .save(dir.path().join("photo.jpg"))
            .unwrap();
        image::RgbaImage::new(10, 6)
            .save(dir.path().join("icon.png"))
            .unwrap();

        let code = run(CliArgs {
            inputs: vec![dir.path().to_path_buf()],
            zoom: 0.5,
            fast: false,
        })
        .unwrap();
        assert_eq!(code, 0);

        fs::write(dir.path().join("broken.png"), b"not really a png").unwrap();
        let code = run(CliArgs {
            inputs: vec![dir.path().to_path_buf()],
            zoom: 1.0,
            fast: true,
        })
        .unwrap();
        assert_eq!(code, 1);
    }
}
