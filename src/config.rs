use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::aggregate::UnknownClassPolicy;
use crate::storage::WriteMode;

const DEFAULT_DB_PATH: &str = "chamber_inspect.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_API_WORKERS: usize = 4;
const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_RESULT_DIR: &str = "results";
const DEFAULT_DETECTOR: &str = "stub";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_IOU: f32 = 0.45;

#[derive(Debug, Deserialize, Default)]
struct InspectConfigFile {
    db_path: Option<String>,
    store: Option<StoreConfigFile>,
    aggregation: Option<AggregationConfigFile>,
    api: Option<ApiConfigFile>,
    artifacts: Option<ArtifactConfigFile>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StoreConfigFile {
    mode: Option<WriteMode>,
}

#[derive(Debug, Deserialize, Default)]
struct AggregationConfigFile {
    unknown_classes: Option<UnknownClassPolicy>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    workers: Option<usize>,
    max_body_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ArtifactConfigFile {
    upload_dir: Option<PathBuf>,
    result_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct InspectConfig {
    pub db_path: String,
    pub store_mode: WriteMode,
    pub unknown_classes: UnknownClassPolicy,
    pub api: ApiSettings,
    pub artifacts: ArtifactSettings,
    pub detector: DetectorSettings,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub addr: String,
    pub workers: usize,
    pub max_body_bytes: usize,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            addr: DEFAULT_API_ADDR.to_string(),
            workers: DEFAULT_API_WORKERS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactSettings {
    pub upload_dir: PathBuf,
    pub result_dir: PathBuf,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            result_dir: PathBuf::from(DEFAULT_RESULT_DIR),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Registered backend name (`stub` or `tract`).
    pub backend: String,
    pub model_path: Option<PathBuf>,
    /// Square model input edge, in pixels.
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Upper bound on a single inference call; unbounded when `None`.
    pub timeout: Option<Duration>,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DETECTOR.to_string(),
            model_path: None,
            input_size: DEFAULT_INPUT_SIZE,
            confidence_threshold: DEFAULT_CONFIDENCE,
            iou_threshold: DEFAULT_IOU,
            timeout: None,
        }
    }
}

impl InspectConfig {
    /// Optional JSON file named by `CHAMBER_CONFIG`, then `CHAMBER_*`
    /// environment overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CHAMBER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: InspectConfigFile) -> Self {
        let api_defaults = ApiSettings::default();
        let artifact_defaults = ArtifactSettings::default();
        let detector_defaults = DetectorSettings::default();

        let api = file.api.unwrap_or_default();
        let artifacts = file.artifacts.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();

        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            store_mode: file.store.and_then(|store| store.mode).unwrap_or_default(),
            unknown_classes: file
                .aggregation
                .and_then(|agg| agg.unknown_classes)
                .unwrap_or_default(),
            api: ApiSettings {
                addr: api.addr.unwrap_or(api_defaults.addr),
                workers: api.workers.unwrap_or(api_defaults.workers),
                max_body_bytes: api.max_body_bytes.unwrap_or(api_defaults.max_body_bytes),
            },
            artifacts: ArtifactSettings {
                upload_dir: artifacts.upload_dir.unwrap_or(artifact_defaults.upload_dir),
                result_dir: artifacts.result_dir.unwrap_or(artifact_defaults.result_dir),
            },
            detector: DetectorSettings {
                backend: detector.backend.unwrap_or(detector_defaults.backend),
                model_path: detector.model_path,
                input_size: detector.input_size.unwrap_or(detector_defaults.input_size),
                confidence_threshold: detector
                    .confidence_threshold
                    .unwrap_or(detector_defaults.confidence_threshold),
                iou_threshold: detector
                    .iou_threshold
                    .unwrap_or(detector_defaults.iou_threshold),
                timeout: detector.timeout_ms.map(Duration::from_millis),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_value("CHAMBER_DB_PATH") {
            self.db_path = path;
        }
        if let Some(mode) = env_value("CHAMBER_STORE_MODE") {
            self.store_mode = mode
                .parse()
                .map_err(|e| anyhow!("CHAMBER_STORE_MODE: {}", e))?;
        }
        if let Some(policy) = env_value("CHAMBER_UNKNOWN_CLASSES") {
            self.unknown_classes = policy
                .parse()
                .map_err(|e| anyhow!("CHAMBER_UNKNOWN_CLASSES: {}", e))?;
        }
        if let Some(addr) = env_value("CHAMBER_API_ADDR") {
            self.api.addr = addr;
        }
        if let Some(workers) = env_value("CHAMBER_API_WORKERS") {
            self.api.workers = workers
                .parse()
                .map_err(|_| anyhow!("CHAMBER_API_WORKERS must be a positive integer"))?;
        }
        if let Some(dir) = env_value("CHAMBER_UPLOAD_DIR") {
            self.artifacts.upload_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_value("CHAMBER_RESULT_DIR") {
            self.artifacts.result_dir = PathBuf::from(dir);
        }
        if let Some(backend) = env_value("CHAMBER_DETECTOR") {
            self.detector.backend = backend.to_ascii_lowercase();
        }
        if let Some(path) = env_value("CHAMBER_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(timeout) = env_value("CHAMBER_INFERENCE_TIMEOUT_MS") {
            let millis: u64 = timeout.parse().map_err(|_| {
                anyhow!("CHAMBER_INFERENCE_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.detector.timeout = Some(Duration::from_millis(millis));
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.api.workers == 0 {
            return Err(anyhow!("api.workers must be greater than zero"));
        }
        if self.api.max_body_bytes == 0 {
            return Err(anyhow!("api.max_body_bytes must be greater than zero"));
        }
        if self.detector.input_size == 0 {
            return Err(anyhow!("detector.input_size must be greater than zero"));
        }
        for (name, value) in [
            ("confidence_threshold", self.detector.confidence_threshold),
            ("iou_threshold", self.detector.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("detector.{} must be within [0, 1], got {}", name, value));
            }
        }
        if self.detector.timeout == Some(Duration::ZERO) {
            return Err(anyhow!("detector.timeout_ms must be greater than zero"));
        }
        match self.detector.backend.as_str() {
            "stub" => {}
            "tract" => {
                if self.detector.model_path.is_none() {
                    return Err(anyhow!("the tract detector requires detector.model_path"));
                }
            }
            other => return Err(anyhow!("unknown detector backend '{}'", other)),
        }
        Ok(())
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_config_file(path: &Path) -> Result<InspectConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
