//! Test doubles and fixtures shared by unit tests.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use image::codecs::bmp::BmpEncoder;
use image::codecs::gif::GifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageEncoder, ImageFormat, Rgba, RgbaImage};
use parking_lot::Mutex;

use crate::codec::{FormatInfo, FormatTag, ImageCodec, ImageRsCodec};
use crate::error::{LoadError, TransferError};
use crate::orientation::Orientation;
use crate::transport::{DocumentUrl, TransferSink, Transport};
use crate::worker::{Task, TaskKind, TaskSpawner};

/// Deterministic test pattern: every pixel differs from its neighbours.
pub fn pattern(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        Rgba([
            (x * 7 % 256) as u8,
            (y * 13 % 256) as u8,
            ((x + y) * 3 % 256) as u8,
            255,
        ])
    })
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut out = Vec::new();
    DynamicImage::ImageRgba8(pattern(width, height))
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let rgb = DynamicImage::ImageRgba8(pattern(width, height)).to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 90)
        .write_image(rgb.as_raw(), width, height, image::ExtendedColorType::Rgb8)
        .unwrap();
    out
}

pub fn gif_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut out);
        encoder
            .encode(
                pattern(width, height).as_raw(),
                width,
                height,
                image::ExtendedColorType::Rgba8,
            )
            .unwrap();
    }
    out
}

pub fn bmp_bytes(width: u32, height: u32) -> Vec<u8> {
    let rgb = DynamicImage::ImageRgba8(pattern(width, height)).to_rgb8();
    let mut out = Vec::new();
    BmpEncoder::new(&mut out)
        .write_image(rgb.as_raw(), width, height, image::ExtendedColorType::Rgb8)
        .unwrap();
    out
}

/// Splice an EXIF APP1 segment carrying only an orientation tag right after
/// the SOI marker of `jpeg`.
pub fn jpeg_with_orientation(jpeg: &[u8], code: u16) -> Vec<u8> {
    let mut tiff = Vec::new();
    tiff.extend_from_slice(b"MM\x00\x2A");
    tiff.extend_from_slice(&8u32.to_be_bytes());
    // IFD0 with a single entry
    tiff.extend_from_slice(&1u16.to_be_bytes());
    tiff.extend_from_slice(&0x0112u16.to_be_bytes());
    tiff.extend_from_slice(&3u16.to_be_bytes()); // SHORT
    tiff.extend_from_slice(&1u32.to_be_bytes());
    tiff.extend_from_slice(&code.to_be_bytes());
    tiff.extend_from_slice(&[0, 0]);
    tiff.extend_from_slice(&0u32.to_be_bytes()); // no next IFD

    let mut payload = b"Exif\x00\x00".to_vec();
    payload.extend_from_slice(&tiff);

    let mut out = Vec::with_capacity(jpeg.len() + payload.len() + 4);
    out.extend_from_slice(&jpeg[..2]);
    out.extend_from_slice(&[0xFF, 0xE1]);
    out.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&jpeg[2..]);
    out
}

/// Spawner that queues tasks until the test runs them.
#[derive(Default)]
pub struct ManualSpawner {
    queue: Mutex<VecDeque<(TaskKind, Task)>>,
    history: Mutex<Vec<TaskKind>>,
}

impl ManualSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of tasks of `kind` ever submitted.
    pub fn spawned(&self, kind: TaskKind) -> usize {
        self.history.lock().iter().filter(|k| **k == kind).count()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn pending_kinds(&self) -> Vec<TaskKind> {
        self.queue.lock().iter().map(|(kind, _)| *kind).collect()
    }

    /// Run the oldest queued task.
    pub fn run_next(&self) -> Option<TaskKind> {
        let (kind, task) = self.queue.lock().pop_front()?;
        task();
        Some(kind)
    }

    /// Run queued tasks until none are left, including ones they spawn.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_next().is_some() {
            ran += 1;
        }
        ran
    }

    /// Take the oldest task without running it.
    pub fn take_next(&self) -> Option<(TaskKind, Task)> {
        self.queue.lock().pop_front()
    }
}

impl TaskSpawner for ManualSpawner {
    fn spawn(&self, kind: TaskKind, task: Task) {
        self.history.lock().push(kind);
        self.queue.lock().push_back((kind, task));
    }
}

/// Transport that replays a fixed script.
pub struct ScriptedTransport {
    pub fast_local: bool,
    pub chunks: Vec<Vec<u8>>,
    pub result: Result<(), TransferError>,
}

impl ScriptedTransport {
    pub fn local(bytes: Vec<u8>) -> Self {
        Self {
            fast_local: true,
            chunks: vec![bytes],
            result: Ok(()),
        }
    }

    pub fn remote(chunks: Vec<Vec<u8>>, result: Result<(), TransferError>) -> Self {
        Self {
            fast_local: false,
            chunks,
            result,
        }
    }
}

impl Transport for ScriptedTransport {
    fn is_fast_local(&self, _url: &DocumentUrl) -> bool {
        self.fast_local
    }

    fn read_all(&self, _url: &DocumentUrl) -> Result<Vec<u8>, TransferError> {
        self.result.clone()?;
        Ok(self.chunks.concat())
    }

    fn fetch(&self, _url: &DocumentUrl, sink: &mut TransferSink) -> Result<(), TransferError> {
        for chunk in &self.chunks {
            if !sink.push(chunk.clone()) {
                return Ok(());
            }
        }
        self.result.clone()
    }
}

/// Codec wrapper that counts decodes and can fake scaled decoding or failures.
#[derive(Default)]
pub struct TestCodec {
    pub scaled: bool,
    pub fail_decode: bool,
    /// Fail only reduced-size decode requests.
    pub fail_scaled_decode: bool,
    /// Panic inside `decode` instead of returning.
    pub panic_decode: bool,
    decodes: AtomicUsize,
}

impl TestCodec {
    pub fn scaling() -> Self {
        Self {
            scaled: true,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_decode: true,
            ..Self::default()
        }
    }

    pub fn failing_scaled() -> Self {
        Self {
            scaled: true,
            fail_scaled_decode: true,
            ..Self::default()
        }
    }

    pub fn panicking() -> Self {
        Self {
            panic_decode: true,
            ..Self::default()
        }
    }

    pub fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }
}

impl ImageCodec for TestCodec {
    fn probe(&self, bytes: &[u8]) -> Result<FormatInfo, LoadError> {
        ImageRsCodec.probe(bytes)
    }

    fn embedded_orientation(&self, bytes: &[u8]) -> Option<Orientation> {
        ImageRsCodec.embedded_orientation(bytes)
    }

    fn supports_scaled_decode(&self, _format: FormatTag) -> bool {
        self.scaled
    }

    fn decode(
        &self,
        bytes: &[u8],
        format: FormatTag,
        target: Option<(u32, u32)>,
    ) -> Result<DynamicImage, LoadError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        if self.panic_decode {
            panic!("corrupt entropy segment");
        }
        if self.fail_decode || (self.fail_scaled_decode && target.is_some()) {
            return Err(LoadError::Decode("injected failure".into()));
        }
        let full = ImageRsCodec.decode(bytes, format, None)?;
        Ok(match target {
            Some((w, h)) => full.resize_exact(w, h, FilterType::Triangle),
            None => full,
        })
    }
}
