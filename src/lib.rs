//! Asynchronous image document loading and incremental scaling.
//!
//! A `Document` walks `Empty -> Loading -> MetaDataLoaded -> FullyLoaded` (or
//! `LoadingFailed`) while fetch, probe and decode tasks run on a
//! `TaskSpawner`. An `ImageScaler` then turns the decoded buffer into scaled
//! chunks for whatever part of the image a view needs.

pub mod codec;
pub mod config;
pub mod document;
pub mod error;
pub mod geometry;
pub mod orientation;
pub mod scaler;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::LoaderConfig;
pub use document::{Document, DocumentEvent, DocumentFactory, LoaderContext, LoadingState};
pub use error::{LoadError, OrientationError, TransferError};
pub use orientation::Orientation;
pub use scaler::{ImageScaler, ScaledChunk, TransformationMode};
pub use worker::{TaskKind, TaskSpawner, WorkerPool};
