//! Per-submission workflow.
//!
//! A session walks `Idle → ChamberIdentified → ImageAcquired → Inferred →
//! Persisted → Displayed`. Each transition either completes or leaves the
//! state exactly where it was, so a failed step can be re-triggered without
//! redoing the earlier ones (a failed write is retried without re-running
//! inference). Calling a transition from the wrong state is a validation
//! error.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregate::{Counts, ResultAggregator};
use crate::artifacts::{annotate, ArtifactRefs, ArtifactStore};
use crate::config::InspectConfig;
use crate::detect::{Detection, InferenceAdapter};
use crate::error::{InspectError, Result};
use crate::ingest::{AcquiredImage, ImageSource};
use crate::query::QueryService;
use crate::record::{ChamberId, DetectionRecord, NewRecord};
use crate::storage::{DetectionStore, SqliteDetectionStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStage {
    Idle,
    ChamberIdentified,
    ImageAcquired,
    Inferred,
    Persisted,
    Displayed,
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionStage::Idle => "idle",
            SessionStage::ChamberIdentified => "chamber_identified",
            SessionStage::ImageAcquired => "image_acquired",
            SessionStage::Inferred => "inferred",
            SessionStage::Persisted => "persisted",
            SessionStage::Displayed => "displayed",
        })
    }
}

/// Everything computed by inference, held until the write succeeds.
#[derive(Clone, Debug)]
pub struct InferredSession {
    pub chamber: ChamberId,
    pub image: AcquiredImage,
    pub detections: Vec<Detection>,
    pub counts: Counts,
    /// PNG with boxes drawn; only produced when artifacts are kept.
    pub annotated: Option<Vec<u8>>,
    /// Set once the files are on disk so a write retry does not save them twice.
    pub artifacts: Option<ArtifactRefs>,
}

#[derive(Clone, Debug, Default)]
pub enum SessionState {
    #[default]
    Idle,
    ChamberIdentified {
        chamber: ChamberId,
    },
    ImageAcquired {
        chamber: ChamberId,
        image: AcquiredImage,
    },
    Inferred(InferredSession),
    Persisted {
        record: DetectionRecord,
    },
    Displayed {
        record: DetectionRecord,
        summary: SessionSummary,
    },
}

impl SessionState {
    pub fn stage(&self) -> SessionStage {
        match self {
            SessionState::Idle => SessionStage::Idle,
            SessionState::ChamberIdentified { .. } => SessionStage::ChamberIdentified,
            SessionState::ImageAcquired { .. } => SessionStage::ImageAcquired,
            SessionState::Inferred(_) => SessionStage::Inferred,
            SessionState::Persisted { .. } => SessionStage::Persisted,
            SessionState::Displayed { .. } => SessionStage::Displayed,
        }
    }
}

/// What the result screen shows for a finished session.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionSummary {
    pub record_id: i64,
    pub chamber_id: String,
    pub missing: u64,
    pub good: u64,
    pub other: u64,
    pub result_image_ref: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SessionSummary {
    pub fn from_record(record: &DetectionRecord) -> Self {
        Self {
            record_id: record.id,
            chamber_id: record.chamber_id.clone(),
            missing: record.counts.missing,
            good: record.counts.good,
            other: record.counts.other,
            result_image_ref: record.result_image_ref.clone(),
            timestamp: record.timestamp,
        }
    }
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chamber {} (record #{}): missing={} good={} other={}",
            self.chamber_id, self.record_id, self.missing, self.good, self.other
        )?;
        if let Some(path) = &self.result_image_ref {
            write!(f, " result={path}")?;
        }
        Ok(())
    }
}

/// Outcome of a full run: the stored record and its presentation.
#[derive(Clone, Debug, PartialEq)]
pub struct InspectionOutcome {
    pub record: DetectionRecord,
    pub summary: SessionSummary,
}

pub struct SessionController {
    inference: Arc<InferenceAdapter>,
    aggregator: ResultAggregator,
    store: Arc<dyn DetectionStore>,
    artifacts: Option<Arc<ArtifactStore>>,
    state: SessionState,
}

impl SessionController {
    pub fn new(inference: Arc<InferenceAdapter>, store: Arc<dyn DetectionStore>) -> Self {
        Self {
            inference,
            aggregator: ResultAggregator::default(),
            store,
            artifacts: None,
            state: SessionState::Idle,
        }
    }

    pub fn with_aggregator(mut self, aggregator: ResultAggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn with_artifacts(mut self, artifacts: Arc<ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn stage(&self) -> SessionStage {
        self.state.stage()
    }

    /// Start a new session from any state.
    pub fn reset(&mut self) {
        if self.stage() != SessionStage::Idle {
            log::debug!("session reset from {}", self.stage());
        }
        self.state = SessionState::Idle;
    }

    /// `Idle → ChamberIdentified`. A blank id is rejected and the session stays idle.
    pub fn identify(&mut self, raw_chamber: &str) -> Result<()> {
        if self.stage() != SessionStage::Idle {
            return Err(out_of_order("identify a chamber", self.stage()));
        }
        let chamber = ChamberId::parse(raw_chamber)?;
        log::debug!("session: chamber {} identified", chamber);
        self.state = SessionState::ChamberIdentified { chamber };
        Ok(())
    }

    /// `ChamberIdentified → ImageAcquired`.
    pub fn acquire(&mut self, source: &mut dyn ImageSource) -> Result<()> {
        let SessionState::ChamberIdentified { chamber } = &self.state else {
            return Err(out_of_order("acquire an image", self.stage()));
        };
        let image = source.acquire().map_err(|e| {
            log::warn!("acquisition from {} failed: {}", source.describe(), e);
            e
        })?;
        log::debug!(
            "session: chamber {} acquired {} bytes from {}",
            chamber,
            image.len(),
            image.origin()
        );
        let chamber = chamber.clone();
        self.state = SessionState::ImageAcquired { chamber, image };
        Ok(())
    }

    /// `ImageAcquired → Inferred`. Runs detection and aggregation; nothing is
    /// written to the store here.
    pub fn infer(&mut self) -> Result<Counts> {
        let (chamber, image) = match std::mem::take(&mut self.state) {
            SessionState::ImageAcquired { chamber, image } => (chamber, image),
            other => return self.reject(other, "run inference"),
        };
        match self.run_inference(&image) {
            Ok((detections, counts, annotated)) => {
                log::info!(
                    "chamber {}: {} detections (missing={} good={} other={})",
                    chamber,
                    detections.len(),
                    counts.missing,
                    counts.good,
                    counts.other
                );
                self.state = SessionState::Inferred(InferredSession {
                    chamber,
                    image,
                    detections,
                    counts,
                    annotated,
                    artifacts: None,
                });
                Ok(counts)
            }
            Err(err) => {
                self.state = SessionState::ImageAcquired { chamber, image };
                Err(err)
            }
        }
    }

    /// `Inferred → Persisted`. On failure the inferred result is kept for a retry.
    pub fn persist(&mut self) -> Result<DetectionRecord> {
        let mut inferred = match std::mem::take(&mut self.state) {
            SessionState::Inferred(inferred) => inferred,
            other => return self.reject(other, "persist"),
        };

        if inferred.artifacts.is_none() {
            if let Some(store) = &self.artifacts {
                match store.save(
                    &inferred.chamber,
                    &inferred.image,
                    inferred.annotated.as_deref(),
                    Utc::now(),
                ) {
                    Ok(refs) => inferred.artifacts = Some(refs),
                    Err(err) => {
                        log::error!("chamber {}: saving images failed: {}", inferred.chamber, err);
                        self.state = SessionState::Inferred(inferred);
                        return Err(err);
                    }
                }
            }
        }

        let (image_ref, result_image_ref) = match &inferred.artifacts {
            Some(refs) => (Some(refs.image_ref.clone()), refs.result_image_ref.clone()),
            None => (None, None),
        };
        let new_record = NewRecord::new(
            inferred.chamber.clone(),
            inferred.counts,
            inferred.detections.clone(),
        )
        .with_images(image_ref, result_image_ref);

        match self.store.write(new_record, self.store.mode()) {
            Ok(record) => {
                log::info!(
                    "chamber {}: stored record #{} ({})",
                    record.chamber_id,
                    record.id,
                    self.store.mode()
                );
                self.state = SessionState::Persisted {
                    record: record.clone(),
                };
                Ok(record)
            }
            Err(err) => {
                log::error!("chamber {}: write failed: {}", inferred.chamber, err);
                self.state = SessionState::Inferred(inferred);
                Err(err)
            }
        }
    }

    /// `Persisted → Displayed`.
    pub fn display(&mut self) -> Result<SessionSummary> {
        let record = match std::mem::take(&mut self.state) {
            SessionState::Persisted { record } => record,
            other => return self.reject(other, "display"),
        };
        let summary = SessionSummary::from_record(&record);
        self.state = SessionState::Displayed {
            record,
            summary: summary.clone(),
        };
        Ok(summary)
    }

    /// Run every step for one submission, starting from a fresh session.
    pub fn run(&mut self, chamber: &str, source: &mut dyn ImageSource) -> Result<InspectionOutcome> {
        self.reset();
        self.identify(chamber)?;
        self.acquire(source)?;
        self.infer()?;
        let record = self.persist()?;
        let summary = self.display()?;
        Ok(InspectionOutcome { record, summary })
    }

    fn run_inference(
        &self,
        image: &AcquiredImage,
    ) -> Result<(Vec<Detection>, Counts, Option<Vec<u8>>)> {
        let started = Instant::now();
        let detections = self.inference.detect(image.bytes())?;
        let counts = self.aggregator.aggregate(&detections);
        let annotated = match self.artifacts {
            Some(_) => Some(annotate(image.bytes(), &detections)?),
            None => None,
        };
        log::debug!("inference took {}ms", started.elapsed().as_millis());
        Ok((detections, counts, annotated))
    }

    /// Put back a state taken out with `mem::take` and report the misuse.
    fn reject<T>(&mut self, state: SessionState, action: &str) -> Result<T> {
        self.state = state;
        Err(out_of_order(action, self.stage()))
    }
}

fn out_of_order(action: &str, stage: SessionStage) -> InspectError {
    InspectError::Validation(format!("cannot {action} while the session is {stage}"))
}

/// Shared collaborators for building sessions.
#[derive(Clone)]
pub struct Pipeline {
    inference: Arc<InferenceAdapter>,
    aggregator: ResultAggregator,
    store: Arc<dyn DetectionStore>,
    artifacts: Option<Arc<ArtifactStore>>,
}

impl Pipeline {
    pub fn new(inference: Arc<InferenceAdapter>, store: Arc<dyn DetectionStore>) -> Self {
        Self {
            inference,
            aggregator: ResultAggregator::default(),
            store,
            artifacts: None,
        }
    }

    /// SQLite store, configured detector and artifact directories.
    pub fn from_config(config: &InspectConfig) -> Result<Self> {
        let store = SqliteDetectionStore::open(&config.db_path, config.store_mode)?;
        let inference = InferenceAdapter::from_settings(&config.detector)?;
        let artifacts = ArtifactStore::from_settings(&config.artifacts);
        artifacts.ensure_dirs()?;
        log::info!(
            "pipeline ready (detector={}, mode={}, unknown classes={})",
            inference.backend_name(),
            config.store_mode,
            config.unknown_classes
        );
        Ok(Self::new(Arc::new(inference), Arc::new(store))
            .with_aggregator(ResultAggregator::new(config.unknown_classes))
            .with_artifacts(artifacts))
    }

    pub fn with_aggregator(mut self, aggregator: ResultAggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(Arc::new(artifacts));
        self
    }

    pub fn store(&self) -> &Arc<dyn DetectionStore> {
        &self.store
    }

    pub fn query(&self) -> QueryService {
        QueryService::new(self.store.clone())
    }

    pub fn controller(&self) -> SessionController {
        let controller = SessionController::new(self.inference.clone(), self.store.clone())
            .with_aggregator(self.aggregator);
        match &self.artifacts {
            Some(artifacts) => controller.with_artifacts(artifacts.clone()),
            None => controller,
        }
    }

    pub fn run(&self, chamber: &str, source: &mut dyn ImageSource) -> Result<InspectionOutcome> {
        self.controller().run(chamber, source)
    }
}
