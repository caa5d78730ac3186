//! Documents: one resource, loaded in the background and observed through
//! events.
//!
//! This module provides:
//! - `Document` - owns exactly one `DocumentImpl` and the published attributes
//! - `LoadingSession` - the `Loading` implementation driving fetch, probe and decode
//! - `RasterLoaded` / `JpegLoaded` / `VectorLoaded` / `OpaqueLoaded` - what a
//!   document becomes once loaded
//! - `DocumentFactory` - one live document per URL
//!
//! A document lives on the interactive thread. Background tasks post results
//! to the current implementation's channels; `poll` and `wait` apply them and
//! hand the resulting `DocumentEvent`s to the caller.

pub mod factory;
pub mod loaded;
pub mod loading;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbaImage;
use tracing::{debug, warn};

use crate::codec::{FormatTag, ImageCodec, ImageRsCodec, JpegContent};
use crate::config::LoaderConfig;
use crate::error::LoadError;
use crate::orientation::Orientation;
use crate::transport::{DocumentUrl, LocalTransport, Transport};
use crate::worker::{TaskSpawner, WorkerPool};

pub use factory::DocumentFactory;
pub use loaded::{JpegLoaded, OpaqueLoaded, RasterLoaded, VectorLoaded};
pub use loading::LoadingSession;

use loading::Step;

/// Decoded pixels shared between the document, views and scale tasks.
pub type SharedImage = Arc<RgbaImage>;

/// Collaborators a document loads through.
#[derive(Clone)]
pub struct LoaderContext {
    pub spawner: Arc<dyn TaskSpawner>,
    pub transport: Arc<dyn Transport>,
    pub codec: Arc<dyn ImageCodec>,
}

impl LoaderContext {
    pub fn new(
        spawner: Arc<dyn TaskSpawner>,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn ImageCodec>,
    ) -> Self {
        Self {
            spawner,
            transport,
            codec,
        }
    }

    /// Worker pool, local file transport and the `image`-based codec.
    pub fn from_config(config: &LoaderConfig) -> Self {
        Self::new(
            Arc::new(WorkerPool::from_config(config)),
            Arc::new(LocalTransport::new(
                config.fast_local_max_bytes,
                config.transfer_chunk_bytes,
            )),
            Arc::new(ImageRsCodec),
        )
    }
}

/// Observable loading state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingState {
    Empty,
    Loading,
    MetaDataLoaded,
    FullyLoaded,
    LoadingFailed,
}

/// A reduced-resolution rendition published before the full image.
#[derive(Debug, Clone)]
pub struct Preview {
    pub inverted_zoom: u32,
    pub image: SharedImage,
}

#[derive(Debug, Clone)]
pub enum DocumentEvent {
    StateChanged(LoadingState),
    MetadataReady {
        format: FormatTag,
        size: (u32, u32),
        orientation: Orientation,
    },
    PreviewReady {
        inverted_zoom: u32,
        image: SharedImage,
    },
    /// Loading finished. `image` is `None` for documents without pixels.
    Loaded { image: Option<SharedImage> },
    LoadingFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImplKind {
    Empty,
    Loading,
    Raster,
    Jpeg,
    Vector,
    Opaque,
    Failed,
}

/// The single active implementation of a document.
pub enum DocumentImpl {
    Empty,
    Loading(LoadingSession),
    Raster(RasterLoaded),
    Jpeg(JpegLoaded),
    Vector(VectorLoaded),
    Opaque(OpaqueLoaded),
    Failed,
}

impl DocumentImpl {
    pub fn kind(&self) -> ImplKind {
        match self {
            DocumentImpl::Empty => ImplKind::Empty,
            DocumentImpl::Loading(_) => ImplKind::Loading,
            DocumentImpl::Raster(_) => ImplKind::Raster,
            DocumentImpl::Jpeg(_) => ImplKind::Jpeg,
            DocumentImpl::Vector(_) => ImplKind::Vector,
            DocumentImpl::Opaque(_) => ImplKind::Opaque,
            DocumentImpl::Failed => ImplKind::Failed,
        }
    }

    fn loading_state(&self) -> LoadingState {
        match self {
            DocumentImpl::Empty => LoadingState::Empty,
            DocumentImpl::Loading(session) if session.is_metadata_loaded() => {
                LoadingState::MetaDataLoaded
            }
            DocumentImpl::Loading(_) => LoadingState::Loading,
            DocumentImpl::Failed => LoadingState::LoadingFailed,
            _ => LoadingState::FullyLoaded,
        }
    }
}

impl fmt::Debug for DocumentImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentImpl::Loading(session) => write!(f, "Loading(session {})", session.id()),
            other => write!(f, "{:?}", other.kind()),
        }
    }
}

/// Attributes a document exposes, plus events not yet handed out.
#[derive(Debug, Default)]
pub(crate) struct Published {
    pub format: Option<FormatTag>,
    pub size: Option<(u32, u32)>,
    pub orientation: Orientation,
    pub image: Option<SharedImage>,
    pub preview: Option<Preview>,
    pub modified: bool,
    pub error: Option<String>,
    events: Vec<DocumentEvent>,
}

impl Published {
    pub fn emit(&mut self, event: DocumentEvent) {
        self.events.push(event);
    }
}

pub struct Document {
    url: DocumentUrl,
    context: LoaderContext,
    imp: DocumentImpl,
    published: Published,
}

impl Document {
    pub fn new(url: DocumentUrl, context: LoaderContext) -> Self {
        Self {
            url,
            context,
            imp: DocumentImpl::Empty,
            published: Published::default(),
        }
    }

    /// Begin (or restart) loading. Any previous implementation is dropped,
    /// which cancels its background work.
    pub fn start(&mut self) {
        debug!(url = %self.url, "Starting load");
        self.published = Published {
            events: std::mem::take(&mut self.published.events),
            ..Published::default()
        };
        let mut session = LoadingSession::new(self.url.clone(), self.context.clone());
        let step = session.begin();
        self.switch_to(DocumentImpl::Loading(session));
        self.apply(step);
    }

    /// Ask for pixels at 1/`inverted_zoom` of the natural size. Only meaningful
    /// while loading; loaded documents already hold their image.
    pub fn request_image(&mut self, inverted_zoom: u32) {
        if let DocumentImpl::Loading(session) = &mut self.imp {
            session.request_image(inverted_zoom);
        }
    }

    /// Apply background results that already arrived and return the events
    /// they produced.
    pub fn poll(&mut self) -> Vec<DocumentEvent> {
        if let DocumentImpl::Loading(session) = &mut self.imp {
            let step = session.poll(&mut self.published);
            self.apply(step);
        }
        self.take_events()
    }

    /// Like `poll`, but blocks up to `timeout` for the next result when none is
    /// pending.
    pub fn wait(&mut self, timeout: Duration) -> Vec<DocumentEvent> {
        if self.published.events.is_empty() {
            if let DocumentImpl::Loading(session) = &mut self.imp {
                let step = session.wait(timeout, &mut self.published);
                self.apply(step);
            }
        }
        self.take_events()
    }

    /// Keep applying results until `done` holds for the state or `timeout`
    /// elapses. Returns every event seen on the way.
    pub fn wait_until<F>(&mut self, timeout: Duration, done: F) -> Vec<DocumentEvent>
    where
        F: Fn(&Document) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut events = self.poll();
        while !done(self) {
            let now = Instant::now();
            if now >= deadline || !self.is_busy() {
                break;
            }
            events.extend(self.wait(deadline - now));
        }
        events
    }

    fn take_events(&mut self) -> Vec<DocumentEvent> {
        std::mem::take(&mut self.published.events)
    }

    fn apply(&mut self, step: Step) {
        match step {
            Step::Stay => {}
            Step::Fail(e) => self.fail(e),
            Step::Switch(imp) => self.switch_to(imp),
        }
    }

    fn fail(&mut self, error: LoadError) {
        warn!(url = %self.url, error = %error, "Loading failed");
        let message = error.to_string();
        self.published.error = Some(message.clone());
        self.published.emit(DocumentEvent::LoadingFailed(message));
        self.switch_to(DocumentImpl::Failed);
    }

    fn switch_to(&mut self, imp: DocumentImpl) {
        let before = self.imp.loading_state();
        debug!(url = %self.url, from = ?self.imp, to = ?imp, "Switching implementation");
        // The old implementation (and its session) drops here.
        self.imp = imp;
        let after = self.imp.loading_state();
        if before != after {
            self.published.emit(DocumentEvent::StateChanged(after));
        }
    }

    pub fn url(&self) -> &DocumentUrl {
        &self.url
    }

    pub fn loading_state(&self) -> LoadingState {
        self.imp.loading_state()
    }

    pub fn kind(&self) -> ImplKind {
        self.imp.kind()
    }

    pub fn implementation(&self) -> &DocumentImpl {
        &self.imp
    }

    /// Whether background work for this document is still outstanding.
    pub fn is_busy(&self) -> bool {
        matches!(&self.imp, DocumentImpl::Loading(session) if session.is_busy())
    }

    pub fn format(&self) -> Option<FormatTag> {
        self.published.format
    }

    /// Natural size, known from `MetaDataLoaded` on.
    pub fn size(&self) -> Option<(u32, u32)> {
        self.published.size
    }

    pub fn orientation(&self) -> Orientation {
        self.published.orientation
    }

    /// Rotation in degrees for views that can only rotate. Mirrored
    /// orientations report 0.
    pub fn rotation_angle(&self) -> u16 {
        self.published.orientation.rotation_angle_or_zero()
    }

    pub fn image(&self) -> Option<&SharedImage> {
        self.published.image.as_ref()
    }

    pub fn preview(&self) -> Option<&Preview> {
        self.published.preview.as_ref()
    }

    pub fn is_modified(&self) -> bool {
        self.published.modified
    }

    pub fn error(&self) -> Option<&str> {
        self.published.error.as_deref()
    }

    pub fn jpeg_content(&self) -> Option<&JpegContent> {
        match &self.imp {
            DocumentImpl::Jpeg(jpeg) => Some(jpeg.content()),
            _ => None,
        }
    }

    /// Rasterize a vector document. `None` for every other kind.
    pub fn render(&self, zoom: f64) -> Option<Result<RgbaImage, LoadError>> {
        match &self.imp {
            DocumentImpl::Vector(vector) => Some(vector.render(zoom)),
            _ => None,
        }
    }

    /// Rotate or flip a loaded raster document. Returns false when there are
    /// no pixels to transform yet.
    pub fn apply_transform(&mut self, change: Orientation) -> bool {
        let Some(image) = self.published.image.clone() else {
            return false;
        };
        let transformed = match &mut self.imp {
            DocumentImpl::Raster(raster) => raster.apply_transform(&image, change),
            DocumentImpl::Jpeg(jpeg) => jpeg.apply_transform(&image, change),
            _ => return false,
        };

        debug!(url = %self.url, ?change, "Applied transform");
        self.published.size = Some(transformed.image.dimensions());
        if let Some(orientation) = transformed.orientation {
            self.published.orientation = orientation;
        }
        self.published.modified = transformed.modified;
        self.published.image = Some(Arc::new(transformed.image));
        true
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("url", &self.url)
            .field("imp", &self.imp)
            .field("size", &self.published.size)
            .finish()
    }
}
