//! SVG sniffing, sizing and rasterization via resvg.

use image::RgbaImage;
use resvg::tiny_skia;
use resvg::usvg;

use crate::error::LoadError;

/// How far into the stream to look for the `<svg` root element.
const SNIFF_WINDOW: usize = 4096;

/// Largest raster produced by `render`, per side.
const MAX_RENDER_DIMENSION: u32 = 16384;

pub fn looks_like_svg(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(SNIFF_WINDOW)];
    let text = String::from_utf8_lossy(window);
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    if trimmed.starts_with("<svg") {
        return true;
    }
    (trimmed.starts_with("<?xml") || trimmed.starts_with("<!DOCTYPE") || trimmed.starts_with("<!--"))
        && trimmed.contains("<svg")
}

pub fn parse_tree(bytes: &[u8]) -> Result<usvg::Tree, LoadError> {
    usvg::Tree::from_data(bytes, &usvg::Options::default())
        .map_err(|e| LoadError::Decode(format!("Invalid SVG: {}", e)))
}

/// Size the document declares through its width/height/viewBox.
pub fn intrinsic_size(bytes: &[u8]) -> Result<(u32, u32), LoadError> {
    let size = parse_tree(bytes)?.size().to_int_size();
    Ok((size.width(), size.height()))
}

/// Rasterize `tree` at `zoom` times its intrinsic size.
pub fn render(tree: &usvg::Tree, zoom: f64) -> Result<RgbaImage, LoadError> {
    let size = tree.size();
    let width = (f64::from(size.width()) * zoom).ceil();
    let height = (f64::from(size.height()) * zoom).ceil();
    if !(width >= 1.0 && height >= 1.0) {
        return Err(LoadError::Decode("SVG has empty dimensions".into()));
    }
    let width = (width as u32).min(MAX_RENDER_DIMENSION);
    let height = (height as u32).min(MAX_RENDER_DIMENSION);

    let mut pixmap = tiny_skia::Pixmap::new(width, height)
        .ok_or_else(|| LoadError::Decode("Failed to allocate SVG pixmap".into()))?;
    resvg::render(
        tree,
        tiny_skia::Transform::from_scale(zoom as f32, zoom as f32),
        &mut pixmap.as_mut(),
    );

    // tiny-skia stores premultiplied alpha
    let mut out = RgbaImage::new(width, height);
    for (dst, src) in out.pixels_mut().zip(pixmap.pixels()) {
        let c = src.demultiply();
        dst.0 = [c.red(), c.green(), c.blue(), c.alpha()];
    }
    Ok(out)
}
