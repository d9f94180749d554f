//! Chamber Inspect
//!
//! Counts present and missing fasteners in an inspection chamber image and
//! keeps a queryable record of every result.
//!
//! # Pipeline
//!
//! Both front ends (the `chamber_inspect` CLI and the `inspectd` HTTP daemon)
//! drive the same steps through a [`SessionController`]:
//!
//! 1. identify the chamber (blank ids are rejected before anything runs)
//! 2. acquire one image from an [`ingest::ImageSource`]
//! 3. run a [`detect::DetectorBackend`] through the [`InferenceAdapter`]
//! 4. tally detections per category with the [`ResultAggregator`]
//! 5. persist a [`DetectionRecord`] into a [`DetectionStore`]
//!
//! Records are written in one of two modes: `upsert` keeps a single current
//! record per chamber, `append` keeps the full history. Either way the store
//! orders records by a monotonic write sequence, newest first.
//!
//! # Module Structure
//!
//! - `detect`: detection types, backends (stub, tract) and the inference adapter
//! - `aggregate`: class id to category counts
//! - `storage`: SQLite and in-memory record stores
//! - `query`: search, listing and CSV export
//! - `session`: the per-submission state machine and [`Pipeline`]
//! - `ingest`, `artifacts`: image sources and on-disk image files
//! - `api`, `worker`: HTTP server and its thread pool
//! - `config`: file + environment configuration

pub mod aggregate;
pub mod api;
pub mod artifacts;
pub mod config;
pub mod detect;
pub mod error;
pub mod ingest;
pub mod query;
pub mod record;
pub mod session;
pub mod storage;
pub mod worker;

pub use aggregate::{Category, Counts, ResultAggregator, UnknownClassPolicy};
pub use config::InspectConfig;
pub use detect::{BoundingBox, Detection, InferenceAdapter};
pub use error::{InspectError, Result};
pub use query::{export, parse_export, ExportRow, QueryService};
pub use record::{ChamberId, DetectionRecord, NewRecord};
pub use session::{
    InspectionOutcome, Pipeline, SessionController, SessionStage, SessionState, SessionSummary,
};
pub use storage::{
    ChamberRecords, DetectionStore, InMemoryDetectionStore, RecordFilter, RecordKey,
    SqliteDetectionStore, WriteMode,
};
