//! easyID: face-recognition attendance pipeline.
//!
//! Frames flow from a capture device to a remote recognition service; matched
//! subjects are bucketed per minute and exported once each minute closes.
//!
//! ```text
//! FrameSource -> capture -> [frame cell] -> dispatcher -> [results cell] -> presenter
//!                                                  \
//!                                                   -> [sighting queue] -> collector -> buckets -> flusher -> Exporter
//! ```
//!
//! Every stage runs on its own thread with its own stop signal. The latest
//! frame and latest results are single-slot cells (last write wins); sightings
//! travel over an unbounded FIFO queue so none are dropped.

pub mod aggregator;
pub mod capture;
pub mod cell;
pub mod clock;
pub mod config;
pub mod detection;
pub mod dispatcher;
pub mod enroll;
pub mod error;
pub mod export;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod presenter;
pub mod recognition;
pub mod subject;
pub mod ui;
pub mod worker;

pub use aggregator::{Aggregator, AggregatorReport, AggregatorSettings, SightingEvent};
pub use cell::SnapshotCell;
pub use clock::{Clock, ManualClock, SystemClock};
pub use detection::{AgeRange, BoundingBox, Detection, SimilarityThreshold};
pub use dispatcher::{Dispatcher, DispatcherSettings, DispatcherStats, RecognitionSnapshot};
pub use error::{DetectionError, ExportError, IntegrityError, RecognitionError, SubjectError};
pub use export::{ExportBatch, ExportFormat, Exporter, JsonLinesExporter, SpreadsheetExporter};
pub use frame::Frame;
pub use ingest::{open_source, FrameSource, SourceConfig};
pub use pipeline::{ExitReason, Pipeline, PipelineSettings, ShutdownReport};
pub use recognition::{open_client, CompreFaceClient, RecognitionClient, ScriptedRecognizer, ServiceSettings};
pub use subject::{Grade, SubjectIdentity};
pub use worker::{StopSignal, WorkerHandle};
