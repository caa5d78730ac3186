//! Incremental, chunked image scaling.
//!
//! This module provides:
//! - `ImageScaler` - turns a decoded buffer plus zoom plus requested regions
//!   into a stream of `ScaledChunk`s produced by background tasks
//! - `scale_rect` - the per-chunk pixel routine
//! - `ChunkCache` - an LRU of already scaled chunks, consulted before a cell
//!   is handed to a task
//!
//! Changing the source or the zoom bumps a generation counter. Tasks carry the
//! generation they were submitted under and results from older generations
//! are dropped when they arrive, without ever blocking on the task.

pub mod cache;
pub mod chunk;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, Sender};
use image::RgbaImage;
use tracing::{debug, trace, warn};

use crate::config::LoaderConfig;
use crate::geometry::{Rect, RectF, Region};
use crate::worker::{catch_panic, TaskKind, TaskSpawner};

pub use cache::{ChunkCache, ChunkKey};
pub use chunk::scale_rect;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransformationMode {
    #[default]
    Smooth,
    Fast,
}

/// A scaled piece of the destination image, positioned in destination
/// coordinates.
#[derive(Debug, Clone)]
pub struct ScaledChunk {
    pub x: i32,
    pub y: i32,
    pub image: RgbaImage,
}

impl ScaledChunk {
    pub fn rect(&self) -> Rect {
        Rect::new(
            self.x,
            self.y,
            self.image.width() as i32,
            self.image.height() as i32,
        )
    }
}

struct ChunkResult {
    generation: u64,
    seq: u64,
    mode: TransformationMode,
    /// `None` when the scaling task panicked.
    chunk: Option<ScaledChunk>,
}

pub struct ImageScaler {
    spawner: Arc<dyn TaskSpawner>,
    source: Option<Arc<RgbaImage>>,
    source_id: u64,
    zoom: f64,
    mode: TransformationMode,
    chunk_size: i32,
    max_in_flight: usize,
    cache: Option<Arc<ChunkCache>>,
    cache_hits: u64,

    generation: u64,
    /// Requested area not yet split into cells.
    pending: Region,
    /// Everything handed to the pipeline in this generation.
    scheduled: Region,
    /// Cells waiting for a free task slot, in grid order.
    queue: VecDeque<Rect>,
    /// Submitted cells by sequence number.
    in_flight: BTreeMap<u64, Rect>,
    /// Finished chunks waiting for an earlier sequence number. `None` marks a
    /// cell whose task failed; it is skipped on delivery.
    ready: BTreeMap<u64, Option<ScaledChunk>>,
    next_seq: u64,
    next_emit: u64,

    result_tx: Sender<ChunkResult>,
    result_rx: Receiver<ChunkResult>,
}

impl ImageScaler {
    pub fn new(spawner: Arc<dyn TaskSpawner>, chunk_size: u32, max_in_flight: usize) -> Self {
        let (result_tx, result_rx) = flume::unbounded();
        Self {
            spawner,
            source: None,
            source_id: 0,
            zoom: 1.0,
            mode: TransformationMode::default(),
            chunk_size: chunk_size.clamp(1, i32::MAX as u32) as i32,
            max_in_flight: max_in_flight.max(1),
            cache: None,
            cache_hits: 0,
            generation: 0,
            pending: Region::new(),
            scheduled: Region::new(),
            queue: VecDeque::new(),
            in_flight: BTreeMap::new(),
            ready: BTreeMap::new(),
            next_seq: 0,
            next_emit: 0,
            result_tx,
            result_rx,
        }
    }

    pub fn from_config(spawner: Arc<dyn TaskSpawner>, config: &LoaderConfig) -> Self {
        Self::new(spawner, config.chunk_size, config.scale_in_flight)
    }

    /// Look cells up in `cache` before scaling them, and store what tasks
    /// produce.
    pub fn with_cache(mut self, cache: Arc<ChunkCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the image being scaled. Outstanding work is abandoned.
    pub fn set_source(&mut self, source: Arc<RgbaImage>) {
        self.source_id = NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            source_id = self.source_id,
            width = source.width(),
            height = source.height(),
            "Set scaler source"
        );
        self.source = Some(source);
        self.invalidate();
    }

    /// Change the zoom factor. Outstanding work is abandoned.
    pub fn set_zoom(&mut self, zoom: f64) {
        if zoom == self.zoom {
            return;
        }
        debug!(old = self.zoom, new = zoom, "Set scaler zoom");
        self.zoom = zoom;
        self.invalidate();
    }

    /// Applies to chunks submitted from now on.
    pub fn set_transformation_mode(&mut self, mode: TransformationMode) {
        self.mode = mode;
    }

    /// Request `rect` (source coordinates), replacing whatever was pending.
    pub fn set_region(&mut self, rect: RectF) {
        self.queue.clear();
        self.pending.clear();
        self.scheduled = Region::new();
        for rect in self.in_flight.values() {
            self.scheduled.add(*rect);
        }
        for chunk in self.ready.values().flatten() {
            self.scheduled.add(chunk.rect());
        }
        self.add_region(rect);
    }

    /// Add `rect` (source coordinates) to the requested area.
    pub fn add_region(&mut self, rect: RectF) {
        let Some(bounds) = self.destination_bounds() else {
            return;
        };
        let dest = rect.scaled(self.zoom).containing_rect().intersect(&bounds);
        if dest.is_empty() {
            return;
        }
        let fresh = self.scheduled.add(dest);
        trace!(?dest, pieces = fresh.len(), "Adding scaler region");
        for piece in fresh {
            self.pending.add(piece);
        }
        self.pump();
    }

    /// Whether chunks are still to come for the current requests.
    pub fn is_running(&self) -> bool {
        !self.pending.is_empty()
            || !self.queue.is_empty()
            || !self.in_flight.is_empty()
            || !self.ready.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn source_id(&self) -> u64 {
        self.source_id
    }

    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    /// Cells served from the cache instead of a scaling task.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits
    }

    /// Size of the whole scaled image, if there is anything to scale.
    pub fn destination_bounds(&self) -> Option<Rect> {
        let source = self.source.as_ref()?;
        if source.width() == 0 || source.height() == 0 || !(self.zoom > 0.0) {
            return None;
        }
        let bounds =
            RectF::new(0.0, 0.0, f64::from(source.width()), f64::from(source.height()))
                .scaled(self.zoom)
                .containing_rect();
        (!bounds.is_empty()).then_some(bounds)
    }

    /// Collect finished chunks of the current generation, in grid order.
    pub fn poll(&mut self) -> Vec<ScaledChunk> {
        while let Ok(result) = self.result_rx.try_recv() {
            self.accept(result);
        }
        self.deliver()
    }

    /// Like `poll`, but blocks up to `timeout` for the next chunk while work is
    /// outstanding.
    pub fn wait(&mut self, timeout: Duration) -> Vec<ScaledChunk> {
        if !self.in_flight.is_empty() && !self.ready.contains_key(&self.next_emit) {
            if let Ok(result) = self.result_rx.recv_timeout(timeout) {
                self.accept(result);
            }
        }
        self.poll()
    }

    fn accept(&mut self, result: ChunkResult) {
        if result.generation != self.generation {
            trace!(
                generation = result.generation,
                current = self.generation,
                "Dropping stale chunk"
            );
            return;
        }
        if self.in_flight.remove(&result.seq).is_none() {
            return;
        }
        if let (Some(cache), Some(chunk)) = (&self.cache, &result.chunk) {
            let key = ChunkKey::new(self.source_id, self.zoom, result.mode, chunk.rect());
            cache.insert(key, chunk);
        }
        self.ready.insert(result.seq, result.chunk);
    }

    fn deliver(&mut self) -> Vec<ScaledChunk> {
        let mut out = Vec::new();
        while let Some(entry) = self.ready.remove(&self.next_emit) {
            out.extend(entry);
            self.next_emit += 1;
        }
        self.pump();
        out
    }

    fn invalidate(&mut self) {
        self.generation += 1;
        trace!(generation = self.generation, "Invalidated scaled chunks");
        self.pending.clear();
        self.scheduled.clear();
        self.queue.clear();
        self.in_flight.clear();
        self.ready.clear();
        self.next_emit = self.next_seq;
    }

    /// Keep up to `max_in_flight` tasks submitted, gridding pending area once
    /// the current grid has been handed out.
    fn pump(&mut self) {
        loop {
            while self.in_flight.len() < self.max_in_flight {
                match self.queue.pop_front() {
                    Some(cell) => self.submit(cell),
                    None => break,
                }
            }
            if !self.queue.is_empty() || self.pending.is_empty() {
                return;
            }
            let pending = std::mem::take(&mut self.pending);
            self.queue = grid(&pending, self.chunk_size).into();
            trace!(cells = self.queue.len(), "Gridded pending region");
        }
    }

    fn submit(&mut self, cell: Rect) {
        let Some(source) = self.source.clone() else {
            return;
        };
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(cache) = &self.cache {
            let key = ChunkKey::new(self.source_id, self.zoom, self.mode, cell);
            if let Some(chunk) = cache.get(&key) {
                self.cache_hits += 1;
                self.ready.insert(seq, Some(chunk));
                return;
            }
        }
        self.in_flight.insert(seq, cell);

        let generation = self.generation;
        let zoom = self.zoom;
        let mode = self.mode;
        let tx = self.result_tx.clone();
        self.spawner.spawn(
            TaskKind::Scale,
            Box::new(move || {
                let chunk = match catch_panic(|| scale_rect(&source, zoom, cell, mode)) {
                    Ok(image) => Some(ScaledChunk {
                        x: cell.x,
                        y: cell.y,
                        image,
                    }),
                    Err(message) => {
                        warn!(?cell, error = %message, "Scaling task panicked");
                        None
                    }
                };
                let _ = tx.send(ChunkResult {
                    generation,
                    seq,
                    mode,
                    chunk,
                });
            }),
        );
    }
}

/// Split `region` into cells of `cell` pixels aligned to the origin, ordered
/// row-major from the top-left.
fn grid(region: &Region, cell: i32) -> Vec<Rect> {
    let mut cells = Vec::new();
    for rect in region.rects() {
        let col0 = rect.x.div_euclid(cell);
        let col1 = (rect.right() - 1).div_euclid(cell);
        let row0 = rect.y.div_euclid(cell);
        let row1 = (rect.bottom() - 1).div_euclid(cell);
        for row in row0..=row1 {
            for col in col0..=col1 {
                let piece = Rect::new(col * cell, row * cell, cell, cell).intersect(rect);
                if !piece.is_empty() {
                    cells.push(piece);
                }
            }
        }
    }
    cells.sort_by_key(|r| (r.y.div_euclid(cell), r.x.div_euclid(cell), r.y, r.x));
    cells
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, ManualSpawner};

    fn scaler(chunk_size: u32, max_in_flight: usize) -> (ImageScaler, Arc<ManualSpawner>) {
        let spawner = ManualSpawner::new();
        (
            ImageScaler::new(spawner.clone(), chunk_size, max_in_flight),
            spawner,
        )
    }

    fn run_to_end(scaler: &mut ImageScaler, spawner: &ManualSpawner) -> Vec<ScaledChunk> {
        let mut chunks = scaler.poll();
        while spawner.run_all() > 0 {
            chunks.extend(scaler.poll());
        }
        chunks
    }

    /// Every pixel of `area` covered exactly once, nothing outside it.
    fn assert_exact_cover(chunks: &[ScaledChunk], area: &Region) {
        let covered: u64 = chunks.iter().map(|c| c.rect().area()).sum();
        assert_eq!(covered, area.area(), "covered area");
        for (i, a) in chunks.iter().enumerate() {
            for b in &chunks[i + 1..] {
                assert!(!a.rect().intersects(&b.rect()), "{:?} overlaps {:?}", a.rect(), b.rect());
            }
            assert!(area.uncovered(a.rect()).is_empty(), "{:?} outside request", a.rect());
        }
    }

    fn rect(x: f64, y: f64, w: f64, h: f64) -> RectF {
        RectF::new(x, y, w, h)
    }

    #[test]
    fn test_tiles_exactly_cover_request() {
        let (mut scaler, spawner) = scaler(16, 3);
        scaler.set_source(Arc::new(testing::pattern(50, 40)));
        scaler.set_zoom(1.5);
        scaler.set_region(rect(3.0, 5.0, 31.0, 22.0));
        assert!(scaler.is_running());

        let chunks = run_to_end(&mut scaler, &spawner);
        assert!(!scaler.is_running());
        let expected = Region::from_rect(rect(3.0, 5.0, 31.0, 22.0).scaled(1.5).containing_rect());
        assert_exact_cover(&chunks, &expected);
        assert!(chunks
            .iter()
            .all(|c| c.image.width() <= 16 && c.image.height() <= 16));
    }

    #[test]
    fn test_chunks_arrive_in_grid_order() {
        let (mut scaler, spawner) = scaler(10, 4);
        scaler.set_source(Arc::new(testing::pattern(30, 30)));
        scaler.set_region(rect(0.0, 0.0, 30.0, 20.0));
        assert_eq!(spawner.pending(), 4);

        // Finish the second task first: nothing may be delivered yet.
        let (_, first) = spawner.take_next().unwrap();
        spawner.run_next();
        assert!(scaler.poll().is_empty());
        first();

        let chunks = run_to_end(&mut scaler, &spawner);
        let origins: Vec<(i32, i32)> = chunks.iter().map(|c| (c.x, c.y)).collect();
        assert_eq!(
            origins,
            vec![(0, 0), (10, 0), (20, 0), (0, 10), (10, 10), (20, 10)]
        );
    }

    #[test]
    fn test_in_flight_limit() {
        let (mut scaler, spawner) = scaler(8, 2);
        scaler.set_source(Arc::new(testing::pattern(64, 8)));
        scaler.set_region(rect(0.0, 0.0, 64.0, 8.0));
        assert_eq!(spawner.pending(), 2);
        spawner.run_next();
        scaler.poll();
        assert_eq!(spawner.pending(), 2);
        assert_eq!(spawner.spawned(TaskKind::Scale), 3);
    }

    #[test]
    fn test_set_then_add_region_no_duplicates() {
        let (mut scaler, spawner) = scaler(64, 4);
        scaler.set_source(Arc::new(testing::pattern(300, 200)));
        scaler.set_zoom(1.0);
        scaler.set_region(rect(0.0, 0.0, 100.0, 100.0));
        scaler.add_region(rect(100.0, 0.0, 100.0, 100.0));
        // Overlapping request adds nothing new.
        scaler.add_region(rect(50.0, 50.0, 100.0, 50.0));

        let chunks = run_to_end(&mut scaler, &spawner);
        assert_exact_cover(&chunks, &Region::from_rect(Rect::new(0, 0, 200, 100)));
        assert!(!scaler.is_running());
    }

    #[test]
    fn test_set_region_replaces_queued_cells() {
        let (mut scaler, spawner) = scaler(10, 1);
        scaler.set_source(Arc::new(testing::pattern(100, 100)));
        scaler.set_region(rect(0.0, 0.0, 100.0, 10.0));
        assert_eq!(spawner.pending(), 1);

        // Only the in-flight cell of the first request survives.
        scaler.set_region(rect(0.0, 50.0, 20.0, 10.0));
        let chunks = run_to_end(&mut scaler, &spawner);
        let rects: Vec<Rect> = chunks.iter().map(ScaledChunk::rect).collect();
        assert_eq!(
            rects,
            vec![
                Rect::new(0, 0, 10, 10),
                Rect::new(0, 50, 10, 10),
                Rect::new(10, 50, 10, 10)
            ]
        );
    }

    #[test]
    fn test_region_clipped_to_destination() {
        let (mut scaler, spawner) = scaler(32, 4);
        scaler.set_source(Arc::new(testing::pattern(20, 10)));
        scaler.set_zoom(2.0);
        scaler.set_region(rect(-5.0, -5.0, 100.0, 100.0));
        let chunks = run_to_end(&mut scaler, &spawner);
        assert_exact_cover(&chunks, &Region::from_rect(Rect::new(0, 0, 40, 20)));
    }

    #[test]
    fn test_stale_chunks_dropped_after_zoom_change() {
        let (mut scaler, spawner) = scaler(16, 4);
        scaler.set_source(Arc::new(testing::pattern(32, 32)));
        scaler.set_zoom(1.0);
        scaler.set_region(rect(0.0, 0.0, 32.0, 32.0));
        let stale = spawner.pending();
        assert!(stale > 0);

        scaler.set_zoom(2.0);
        assert!(!scaler.is_running());
        for _ in 0..stale {
            spawner.run_next();
        }
        assert!(scaler.poll().is_empty());

        scaler.set_region(rect(0.0, 0.0, 8.0, 8.0));
        let chunks = run_to_end(&mut scaler, &spawner);
        assert_exact_cover(&chunks, &Region::from_rect(Rect::new(0, 0, 16, 16)));
    }

    #[test]
    fn test_stale_chunks_dropped_after_source_change() {
        let (mut scaler, spawner) = scaler(16, 4);
        scaler.set_source(Arc::new(testing::pattern(32, 32)));
        scaler.set_region(rect(0.0, 0.0, 32.0, 32.0));
        let (_, slow) = spawner.take_next().unwrap();

        let replacement = Arc::new(RgbaImage::from_pixel(8, 8, image::Rgba([9, 9, 9, 255])));
        scaler.set_source(replacement);
        scaler.set_region(rect(0.0, 0.0, 8.0, 8.0));
        slow();

        let chunks = run_to_end(&mut scaler, &spawner);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].rect(), Rect::new(0, 0, 8, 8));
        assert!(chunks[0].image.pixels().all(|p| p.0 == [9, 9, 9, 255]));
    }

    #[test]
    fn test_mode_change_keeps_generation() {
        let (mut scaler, _spawner) = scaler(16, 4);
        scaler.set_source(Arc::new(testing::pattern(8, 8)));
        let generation = scaler.generation();
        scaler.set_transformation_mode(TransformationMode::Fast);
        assert_eq!(scaler.generation(), generation);
        scaler.set_zoom(3.0);
        assert_eq!(scaler.generation(), generation + 1);
    }

    #[test]
    fn test_degenerate_sources_produce_nothing() {
        let (mut scaler, spawner) = scaler(16, 4);
        scaler.set_region(rect(0.0, 0.0, 10.0, 10.0));
        assert!(!scaler.is_running());

        scaler.set_source(Arc::new(RgbaImage::new(0, 0)));
        scaler.set_region(rect(0.0, 0.0, 10.0, 10.0));
        assert!(!scaler.is_running());

        scaler.set_source(Arc::new(testing::pattern(8, 8)));
        scaler.set_zoom(0.0);
        scaler.set_region(rect(0.0, 0.0, 10.0, 10.0));
        assert!(!scaler.is_running());
        assert_eq!(spawner.spawned(TaskKind::Scale), 0);
    }

    #[test]
    fn test_chunks_match_whole_image_pass() {
        let (mut scaler, spawner) = scaler(7, 4);
        let source = Arc::new(testing::pattern(19, 13));
        scaler.set_source(Arc::clone(&source));
        scaler.set_zoom(2.3);
        scaler.set_region(rect(0.0, 0.0, 19.0, 13.0));
        let chunks = run_to_end(&mut scaler, &spawner);

        let bounds = scaler.destination_bounds().unwrap();
        let whole = scale_rect(&source, 2.3, bounds, TransformationMode::Smooth);
        for chunk in &chunks {
            for (x, y, pixel) in chunk.image.enumerate_pixels() {
                assert_eq!(
                    pixel,
                    whole.get_pixel(x + chunk.x as u32, y + chunk.y as u32)
                );
            }
        }
    }

    #[test]
    fn test_failed_cell_does_not_stall_delivery() {
        let (mut scaler, spawner) = scaler(10, 4);
        scaler.set_source(Arc::new(testing::pattern(30, 10)));
        scaler.set_region(rect(0.0, 0.0, 30.0, 10.0));

        // The first cell's task dies without producing a chunk.
        let _lost = spawner.take_next().unwrap();
        let failed = ChunkResult {
            generation: scaler.generation(),
            seq: 0,
            mode: TransformationMode::Smooth,
            chunk: None,
        };
        assert!(scaler.result_tx.send(failed).is_ok());

        let chunks = run_to_end(&mut scaler, &spawner);
        let origins: Vec<(i32, i32)> = chunks.iter().map(|c| (c.x, c.y)).collect();
        assert_eq!(origins, vec![(10, 0), (20, 0)]);
        assert!(!scaler.is_running());
    }

    #[test]
    fn test_cache_serves_cells_after_zooming_back() {
        let cache = Arc::new(ChunkCache::new(1024 * 1024));
        let spawner = ManualSpawner::new();
        let mut scaler = ImageScaler::new(spawner.clone(), 16, 4).with_cache(Arc::clone(&cache));
        scaler.set_source(Arc::new(testing::pattern(40, 40)));
        scaler.set_region(rect(0.0, 0.0, 40.0, 40.0));
        let first = run_to_end(&mut scaler, &spawner);
        let scaled = spawner.spawned(TaskKind::Scale);
        assert_eq!(first.len(), 9);
        assert_eq!(cache.len(), 9);
        assert_eq!(scaler.cache_hits(), 0);

        scaler.set_zoom(2.0);
        scaler.set_zoom(1.0);
        scaler.set_region(rect(0.0, 0.0, 40.0, 40.0));
        assert_eq!(spawner.pending(), 0);
        let second = run_to_end(&mut scaler, &spawner);

        assert_eq!(spawner.spawned(TaskKind::Scale), scaled);
        assert_eq!(scaler.cache_hits(), 9);
        assert!(!scaler.is_running());
        assert_exact_cover(&second, &Region::from_rect(Rect::new(0, 0, 40, 40)));
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.rect(), b.rect());
            assert_eq!(a.image, b.image);
        }
    }

    #[test]
    fn test_cache_is_keyed_by_mode() {
        let cache = Arc::new(ChunkCache::new(1024 * 1024));
        let spawner = ManualSpawner::new();
        let mut scaler = ImageScaler::new(spawner.clone(), 16, 4).with_cache(cache);
        scaler.set_source(Arc::new(testing::pattern(16, 16)));
        scaler.set_zoom(1.5);
        scaler.set_region(rect(0.0, 0.0, 8.0, 8.0));
        run_to_end(&mut scaler, &spawner);

        scaler.set_transformation_mode(TransformationMode::Fast);
        scaler.set_zoom(1.0);
        scaler.set_zoom(1.5);
        scaler.set_region(rect(0.0, 0.0, 8.0, 8.0));
        assert_eq!(spawner.pending(), 1);
        assert_eq!(scaler.cache_hits(), 0);
    }

    #[test]
    fn test_grid_is_origin_aligned() {
        let cells = grid(&Region::from_rect(Rect::new(5, 5, 20, 10)), 10);
        assert_eq!(
            cells,
            vec![
                Rect::new(5, 5, 5, 5),
                Rect::new(10, 5, 10, 5),
                Rect::new(20, 5, 5, 5),
                Rect::new(5, 10, 5, 5),
                Rect::new(10, 10, 10, 5),
                Rect::new(20, 10, 5, 5),
            ]
        );
    }

    #[test]
    fn test_worker_pool_end_to_end() {
        let pool = Arc::new(crate::worker::WorkerPool::new(2));
        let mut scaler = ImageScaler::new(pool, 32, 4);
        scaler.set_source(Arc::new(testing::pattern(100, 60)));
        scaler.set_zoom(0.5);
        scaler.set_region(rect(0.0, 0.0, 100.0, 60.0));

        let mut chunks = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while scaler.is_running() && std::time::Instant::now() < deadline {
            chunks.extend(scaler.wait(Duration::from_millis(100)));
        }
        assert_exact_cover(&chunks, &Region::from_rect(Rect::new(0, 0, 50, 30)));
    }
}
