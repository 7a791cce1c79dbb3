//! Incremental ingestion.
//!
//! * [`change_detector`] — diffs fresh sitemap entries against the stored
//!   corpus to decide what needs work.
//! * [`pipeline`] — drives fetch → hash comparison → chunk → embed → store
//!   per URL, with partial-failure isolation.

pub mod change_detector;
pub mod pipeline;

pub use change_detector::{ChangeDetector, ChangeReport};
pub use pipeline::{IngestOptions, IngestionPipeline, IngestionResult, IngestionStats};
