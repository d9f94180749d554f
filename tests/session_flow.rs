use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tempfile::tempdir;

use chamber_inspect::artifacts::ArtifactStore;
use chamber_inspect::detect::DetectorBackend;
use chamber_inspect::ingest::{FileImageSource, UploadSource};
use chamber_inspect::{
    BoundingBox, ChamberRecords, Counts, Detection, DetectionRecord, DetectionStore,
    InMemoryDetectionStore, InferenceAdapter, InspectError, NewRecord, RecordFilter, RecordKey,
    ResultAggregator, SessionController, SessionStage, UnknownClassPolicy, WriteMode,
};

fn png_bytes() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(16, 16, image::Rgb([100, 100, 100]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

/// Backend that counts calls and can be told to fail.
struct CountingBackend {
    calls: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    classes: Vec<u32>,
}

impl DetectorBackend for CountingBackend {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn detect(
        &mut self,
        _pixels: &[u8],
        _width: u32,
        _height: u32,
    ) -> chamber_inspect::Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(InspectError::ModelUnavailable("model crashed".into()));
        }
        Ok(self
            .classes
            .iter()
            .map(|&class_id| Detection::new(class_id, 0.9, BoundingBox::new(1.0, 1.0, 5.0, 5.0)))
            .collect())
    }
}

/// Store whose writes fail until switched on.
struct FlakyStore {
    inner: InMemoryDetectionStore,
    broken: AtomicBool,
}

impl DetectionStore for FlakyStore {
    fn mode(&self) -> WriteMode {
        self.inner.mode()
    }

    fn write(&self, record: NewRecord, mode: WriteMode) -> chamber_inspect::Result<DetectionRecord> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(InspectError::Persistence("disk full".into()));
        }
        self.inner.write(record, mode)
    }

    fn get(&self, chamber_id: &str) -> chamber_inspect::Result<ChamberRecords> {
        self.inner.get(chamber_id)
    }

    fn get_by_id(&self, id: i64) -> chamber_inspect::Result<DetectionRecord> {
        self.inner.get_by_id(id)
    }

    fn list(&self, filter: &RecordFilter) -> chamber_inspect::Result<Vec<DetectionRecord>> {
        self.inner.list(filter)
    }

    fn delete(&self, key: &RecordKey) -> chamber_inspect::Result<DetectionRecord> {
        self.inner.delete(key)
    }

    fn count(&self) -> chamber_inspect::Result<usize> {
        self.inner.count()
    }
}

struct Harness {
    calls: Arc<AtomicUsize>,
    fail_inference: Arc<AtomicBool>,
    store: Arc<FlakyStore>,
    controller: SessionController,
}

fn harness(classes: Vec<u32>) -> Harness {
    let calls = Arc::new(AtomicUsize::new(0));
    let fail_inference = Arc::new(AtomicBool::new(false));
    let backend = CountingBackend {
        calls: calls.clone(),
        fail: fail_inference.clone(),
        classes,
    };
    let store = Arc::new(FlakyStore {
        inner: InMemoryDetectionStore::new(WriteMode::Append),
        broken: AtomicBool::new(false),
    });
    let controller = SessionController::new(Arc::new(InferenceAdapter::new(backend)), store.clone());
    Harness {
        calls,
        fail_inference,
        store,
        controller,
    }
}

#[test]
fn blank_chamber_never_reaches_inference() {
    let mut h = harness(vec![0, 1]);
    for blank in ["", "   ", "\t"] {
        let mut source = UploadSource::new(png_bytes(), "test");
        let err = h.controller.run(blank, &mut source).unwrap_err();
        assert!(matches!(err, InspectError::Validation(_)));
        assert_eq!(h.controller.stage(), SessionStage::Idle);
    }
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.store.count().unwrap(), 0);
}

#[test]
fn inference_failure_keeps_image_for_retry() {
    let mut h = harness(vec![0, 1, 1]);
    h.fail_inference.store(true, Ordering::SeqCst);

    h.controller.identify("A1-01").unwrap();
    h.controller
        .acquire(&mut UploadSource::new(png_bytes(), "test"))
        .unwrap();
    assert!(matches!(
        h.controller.infer(),
        Err(InspectError::ModelUnavailable(_))
    ));
    assert_eq!(h.controller.stage(), SessionStage::ImageAcquired);

    h.fail_inference.store(false, Ordering::SeqCst);
    let counts = h.controller.infer().unwrap();
    assert_eq!(counts, Counts::new(1, 2, 0));
    assert_eq!(h.controller.stage(), SessionStage::Inferred);
    assert_eq!(h.store.count().unwrap(), 0);
}

#[test]
fn failed_write_retries_without_rerunning_inference() {
    let mut h = harness(vec![1, 1, 1]);
    h.store.broken.store(true, Ordering::SeqCst);

    h.controller.identify("B2").unwrap();
    h.controller
        .acquire(&mut UploadSource::new(png_bytes(), "test"))
        .unwrap();
    h.controller.infer().unwrap();
    assert!(matches!(
        h.controller.persist(),
        Err(InspectError::Persistence(_))
    ));
    assert_eq!(h.controller.stage(), SessionStage::Inferred);

    h.store.broken.store(false, Ordering::SeqCst);
    let record = h.controller.persist().unwrap();
    assert_eq!(record.counts, Counts::new(0, 3, 0));
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);

    let summary = h.controller.display().unwrap();
    assert_eq!(summary.record_id, record.id);
    assert_eq!(h.controller.stage(), SessionStage::Displayed);

    h.controller.reset();
    assert_eq!(h.controller.stage(), SessionStage::Idle);
}

#[test]
fn unknown_classes_follow_policy() {
    let h = harness(vec![0, 9, 1]);
    let mut controller = h
        .controller
        .with_aggregator(ResultAggregator::new(UnknownClassPolicy::Ignore));
    let outcome = controller
        .run("C3", &mut UploadSource::new(png_bytes(), "test"))
        .unwrap();
    assert_eq!(outcome.record.counts, Counts::new(1, 1, 0));
    assert_eq!(outcome.record.raw_detections.len(), 3);
}

#[test]
fn file_source_run_writes_artifacts() -> Result<()> {
    let dir = tempdir()?;
    let image_path = dir.path().join("chamber.png");
    std::fs::write(&image_path, png_bytes())?;

    let h = harness(vec![0, 1]);
    let artifacts = Arc::new(ArtifactStore::new(
        dir.path().join("uploads"),
        dir.path().join("results"),
    ));
    let mut controller = h.controller.with_artifacts(artifacts);
    let mut source = FileImageSource::new(&image_path.to_string_lossy())?;
    let outcome = controller.run("A1/01", &mut source)?;

    let image_ref = outcome.record.image_ref.clone().expect("image ref");
    let result_ref = outcome.record.result_image_ref.clone().expect("result ref");
    assert!(image_ref.contains("capture_A1_01_"));
    assert!(result_ref.contains("result_A1_01_"));
    assert_eq!(std::fs::read(&image_ref)?, png_bytes());
    let annotated = image::open(&result_ref)?.to_rgb8();
    assert_eq!(annotated.dimensions(), (16, 16));
    assert_eq!(outcome.summary.result_image_ref.as_deref(), Some(result_ref.as_str()));
    Ok(())
}
