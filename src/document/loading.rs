//! The `Loading` implementation: fetch, probe, optional decodes.
//!
//! A session owns its own result channels. Background tasks hold only the
//! sending halves, so once the session is dropped (document dropped, restarted
//! or specialized) their late results have nowhere to go. The cancel flag
//! additionally stops streaming transfers and skips tasks that have not
//! started yet.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use image::RgbaImage;
use tracing::{debug, trace, warn};

use super::loaded::specialize;
use super::{DocumentEvent, DocumentImpl, LoaderContext, LoadingState, Preview, Published};
use crate::codec::{decode_pixels, probe_metadata, FormatKind, ProbeResult};
use crate::error::{LoadError, TransferError};
use crate::transport::{DocumentUrl, TransferEvent, TransferSink};
use crate::worker::{catch_panic, TaskKind};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// What the owning document should do after the session handled input.
pub(crate) enum Step {
    Stay,
    Fail(LoadError),
    Switch(DocumentImpl),
}

enum TaskResult {
    MetaData(Result<ProbeResult, LoadError>),
    Image {
        inverted_zoom: u32,
        result: Result<RgbaImage, LoadError>,
    },
}

struct TaskMessage {
    session: u64,
    result: TaskResult,
}

fn panicked(message: String) -> LoadError {
    LoadError::Decode(format!("Decoder panicked: {}", message))
}

enum Incoming {
    Transfer(TransferEvent),
    TransferLost,
    Task(TaskMessage),
}

pub struct LoadingSession {
    id: u64,
    url: DocumentUrl,
    context: LoaderContext,
    cancelled: Arc<AtomicBool>,

    /// Bytes received so far. Frozen into `data` once the transfer finishes.
    received: Vec<u8>,
    data: Option<Arc<[u8]>>,
    transfer_rx: Option<Receiver<TransferEvent>>,

    result_tx: Sender<TaskMessage>,
    result_rx: Receiver<TaskMessage>,

    metadata_running: bool,
    metadata: Option<ProbeResult>,

    /// Factor of the decode task in flight.
    decoding: Option<u32>,
    /// Last factor asked for, 0 when none.
    requested_zoom: u32,
    /// Request that arrived while another factor was decoding.
    queued_zoom: Option<u32>,
    /// Factor of the preview already published.
    preview_zoom: Option<u32>,
}

impl LoadingSession {
    pub(crate) fn new(url: DocumentUrl, context: LoaderContext) -> Self {
        let (result_tx, result_rx) = flume::unbounded();
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            url,
            context,
            cancelled: Arc::new(AtomicBool::new(false)),
            received: Vec::new(),
            data: None,
            transfer_rx: None,
            result_tx,
            result_rx,
            metadata_running: false,
            metadata: None,
            decoding: None,
            requested_zoom: 0,
            queued_zoom: None,
            preview_zoom: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_metadata_loaded(&self) -> bool {
        self.metadata.is_some()
    }

    /// Whether any background task of this session is still expected to report.
    pub fn is_busy(&self) -> bool {
        self.transfer_rx.is_some() || self.metadata_running || self.decoding.is_some()
    }

    /// Bytes received so far, including a completed transfer.
    pub fn received_bytes(&self) -> usize {
        self.data.as_ref().map_or(self.received.len(), |data| data.len())
    }

    /// Kick off the fetch. Fast-local resources are read right here.
    pub(crate) fn begin(&mut self) -> Step {
        let transport = Arc::clone(&self.context.transport);

        if transport.is_fast_local(&self.url) {
            debug!(url = %self.url, session = self.id, "Reading fast-local document");
            return match transport.read_all(&self.url) {
                Ok(bytes) => {
                    self.received = bytes;
                    self.start_metadata();
                    Step::Stay
                }
                Err(e) => Step::Fail(e.into()),
            };
        }

        debug!(url = %self.url, session = self.id, "Starting transfer");
        let (tx, rx) = flume::unbounded();
        let mut sink = TransferSink::new(tx, Arc::clone(&self.cancelled));
        let url = self.url.clone();
        self.transfer_rx = Some(rx);
        self.context.spawner.spawn(
            TaskKind::Transfer,
            Box::new(move || {
                let result = transport.fetch(&url, &mut sink);
                sink.finish(result);
            }),
        );
        Step::Stay
    }

    /// Apply every result that already arrived.
    pub(crate) fn poll(&mut self, out: &mut Published) -> Step {
        while let Some(incoming) = self.try_next() {
            match self.handle(incoming, out) {
                Step::Stay => {}
                step => return step,
            }
        }
        Step::Stay
    }

    /// Block up to `timeout` for the next result, then apply everything pending.
    pub(crate) fn wait(&mut self, timeout: Duration, out: &mut Published) -> Step {
        if let Some(incoming) = self.next_before(Instant::now() + timeout) {
            if let step @ (Step::Fail(_) | Step::Switch(_)) = self.handle(incoming, out) {
                return step;
            }
        }
        self.poll(out)
    }

    fn try_next(&mut self) -> Option<Incoming> {
        if let Some(rx) = &self.transfer_rx {
            match rx.try_recv() {
                Ok(event) => return Some(Incoming::Transfer(event)),
                Err(TryRecvError::Disconnected) => return Some(Incoming::TransferLost),
                Err(TryRecvError::Empty) => {}
            }
        }
        self.result_rx.try_recv().ok().map(Incoming::Task)
    }

    fn next_before(&mut self, deadline: Instant) -> Option<Incoming> {
        // Only one source is live at a time: tasks start after the transfer ends.
        if let Some(rx) = &self.transfer_rx {
            return match rx.recv_deadline(deadline) {
                Ok(event) => Some(Incoming::Transfer(event)),
                Err(RecvTimeoutError::Disconnected) => Some(Incoming::TransferLost),
                Err(RecvTimeoutError::Timeout) => None,
            };
        }
        if !self.is_busy() {
            return None;
        }
        self.result_rx.recv_deadline(deadline).ok().map(Incoming::Task)
    }

    fn handle(&mut self, incoming: Incoming, out: &mut Published) -> Step {
        match incoming {
            Incoming::Transfer(TransferEvent::Data(chunk)) => {
                trace!(session = self.id, bytes = chunk.len(), "Received data");
                self.received.extend_from_slice(&chunk);
                Step::Stay
            }
            Incoming::Transfer(TransferEvent::Finished(Ok(()))) => {
                self.transfer_rx = None;
                debug!(
                    url = %self.url,
                    bytes = self.received.len(),
                    "Transfer finished"
                );
                self.start_metadata();
                Step::Stay
            }
            Incoming::Transfer(TransferEvent::Finished(Err(e))) => {
                self.transfer_rx = None;
                Step::Fail(e.into())
            }
            Incoming::TransferLost => {
                self.transfer_rx = None;
                Step::Fail(TransferError::new("Transfer aborted").into())
            }
            Incoming::Task(message) if message.session != self.id => {
                trace!(session = message.session, "Dropping result of another session");
                Step::Stay
            }
            Incoming::Task(message) => match message.result {
                TaskResult::MetaData(result) => self.finish_metadata(result, out),
                TaskResult::Image {
                    inverted_zoom,
                    result,
                } => self.finish_image(inverted_zoom, result, out),
            },
        }
    }

    fn start_metadata(&mut self) {
        let data: Arc<[u8]> = std::mem::take(&mut self.received).into();
        self.data = Some(Arc::clone(&data));
        self.metadata_running = true;

        let codec = Arc::clone(&self.context.codec);
        let cancelled = Arc::clone(&self.cancelled);
        let tx = self.result_tx.clone();
        let session = self.id;
        self.context.spawner.spawn(
            TaskKind::MetaData,
            Box::new(move || {
                if cancelled.load(Ordering::Acquire) {
                    return;
                }
                let result = catch_panic(|| probe_metadata(codec.as_ref(), &data))
                    .unwrap_or_else(|msg| Err(panicked(msg)));
                let _ = tx.send(TaskMessage {
                    session,
                    result: TaskResult::MetaData(result),
                });
            }),
        );
    }

    fn finish_metadata(
        &mut self,
        result: Result<ProbeResult, LoadError>,
        out: &mut Published,
    ) -> Step {
        self.metadata_running = false;
        let probe = match result {
            Ok(probe) => probe,
            Err(e) => return Step::Fail(e),
        };

        out.format = Some(probe.format);
        out.size = Some(probe.size);
        out.orientation = probe.orientation;
        out.emit(DocumentEvent::MetadataReady {
            format: probe.format,
            size: probe.size,
            orientation: probe.orientation,
        });
        out.emit(DocumentEvent::StateChanged(LoadingState::MetaDataLoaded));
        debug!(url = %self.url, format = %probe.format, size = ?probe.size, "Metadata loaded");

        let kind = probe.format.kind();
        self.metadata = Some(probe);

        if kind != FormatKind::Raster {
            // Nothing to decode: specialize right away.
            out.emit(DocumentEvent::Loaded { image: None });
            return self.specialize();
        }

        if self.requested_zoom != 0 {
            self.start_decode(self.requested_zoom);
        }
        Step::Stay
    }

    /// Ask for pixels at 1/`inverted_zoom` of the natural size.
    pub(crate) fn request_image(&mut self, inverted_zoom: u32) {
        if inverted_zoom == 0 {
            return;
        }

        match self.decoding {
            Some(current) if current == inverted_zoom => {
                trace!(inverted_zoom, "Decode already in flight");
            }
            Some(current) => {
                debug!(current, queued = inverted_zoom, "Queueing decode request");
                self.queued_zoom = Some(inverted_zoom);
            }
            None if self.metadata.is_none() => {
                trace!(inverted_zoom, "Remembering request until metadata is known");
                self.requested_zoom = inverted_zoom;
            }
            None if self.preview_zoom == Some(inverted_zoom) => {
                trace!(inverted_zoom, "Preview already available");
            }
            None => self.start_decode(inverted_zoom),
        }
    }

    fn start_decode(&mut self, inverted_zoom: u32) {
        let Some(data) = self.data.clone() else {
            return;
        };
        let Some((format, raw_size, orientation)) = self
            .metadata
            .as_ref()
            .map(|probe| (probe.format, probe.raw_size, probe.orientation))
        else {
            return;
        };
        debug!(url = %self.url, inverted_zoom, "Starting decode");
        self.requested_zoom = inverted_zoom;
        self.decoding = Some(inverted_zoom);

        let codec = Arc::clone(&self.context.codec);
        let cancelled = Arc::clone(&self.cancelled);
        let tx = self.result_tx.clone();
        let session = self.id;
        self.context.spawner.spawn(
            TaskKind::Decode,
            Box::new(move || {
                if cancelled.load(Ordering::Acquire) {
                    return;
                }
                let result = catch_panic(|| {
                    decode_pixels(
                        codec.as_ref(),
                        &data,
                        format,
                        raw_size,
                        orientation,
                        inverted_zoom,
                    )
                })
                .unwrap_or_else(|msg| Err(panicked(msg)));
                let _ = tx.send(TaskMessage {
                    session,
                    result: TaskResult::Image {
                        inverted_zoom,
                        result,
                    },
                });
            }),
        );
    }

    fn finish_image(
        &mut self,
        inverted_zoom: u32,
        result: Result<RgbaImage, LoadError>,
        out: &mut Published,
    ) -> Step {
        self.decoding = None;
        let natural = self.metadata.as_ref().map(|probe| probe.size);

        match result {
            Ok(image) if inverted_zoom != 1 && Some(image.dimensions()) != natural => {
                debug!(
                    inverted_zoom,
                    size = ?image.dimensions(),
                    "Down-sampled preview ready"
                );
                let image = Arc::new(image);
                out.preview = Some(Preview {
                    inverted_zoom,
                    image: Arc::clone(&image),
                });
                out.emit(DocumentEvent::PreviewReady {
                    inverted_zoom,
                    image,
                });
                self.preview_zoom = Some(inverted_zoom);
            }
            Ok(image) => {
                let image = Arc::new(image);
                out.image = Some(Arc::clone(&image));
                out.emit(DocumentEvent::Loaded { image: Some(image) });
                return self.specialize();
            }
            Err(e) if inverted_zoom != 1 => {
                debug!(inverted_zoom, error = %e, "Ignoring failed preview decode");
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "Failed to decode image");
                let message = e.to_string();
                out.error = Some(message.clone());
                out.emit(DocumentEvent::LoadingFailed(message));
                self.requested_zoom = 0;
            }
        }

        if let Some(next) = self.queued_zoom.take() {
            if self.preview_zoom != Some(next) {
                self.start_decode(next);
            }
        }
        Step::Stay
    }

    fn specialize(&mut self) -> Step {
        let (Some(data), Some(probe)) = (self.data.take(), self.metadata.take()) else {
            return Step::Stay;
        };
        match specialize(probe.format, data, probe.jpeg) {
            Ok(imp) => Step::Switch(imp),
            Err(e) => Step::Fail(e),
        }
    }
}

impl Drop for LoadingSession {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        if self.is_busy() {
            trace!(url = %self.url, session = self.id, "Cancelled loading session");
        }
    }
}
