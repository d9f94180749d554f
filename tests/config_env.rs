use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use chamber_inspect::config::InspectConfig;
use chamber_inspect::{UnknownClassPolicy, WriteMode};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CHAMBER_CONFIG",
        "CHAMBER_DB_PATH",
        "CHAMBER_STORE_MODE",
        "CHAMBER_UNKNOWN_CLASSES",
        "CHAMBER_API_ADDR",
        "CHAMBER_API_WORKERS",
        "CHAMBER_UPLOAD_DIR",
        "CHAMBER_RESULT_DIR",
        "CHAMBER_DETECTOR",
        "CHAMBER_MODEL_PATH",
        "CHAMBER_INFERENCE_TIMEOUT_MS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = InspectConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "chamber_inspect.db");
    assert_eq!(cfg.store_mode, WriteMode::Append);
    assert_eq!(cfg.unknown_classes, UnknownClassPolicy::Other);
    assert_eq!(cfg.api.addr, "127.0.0.1:8000");
    assert_eq!(cfg.api.workers, 4);
    assert_eq!(cfg.artifacts.upload_dir.to_str(), Some("uploads"));
    assert_eq!(cfg.artifacts.result_dir.to_str(), Some("results"));
    assert_eq!(cfg.detector.backend, "stub");
    assert_eq!(cfg.detector.input_size, 640);
    assert!(cfg.detector.timeout.is_none());
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "db_path": "plant_a.db",
            "store": { "mode": "upsert" },
            "aggregation": { "unknown_classes": "ignore" },
            "api": { "addr": "0.0.0.0:9000", "workers": 8 },
            "artifacts": { "upload_dir": "/srv/in", "result_dir": "/srv/out" },
            "detector": {
                "backend": "stub",
                "input_size": 320,
                "confidence_threshold": 0.4,
                "iou_threshold": 0.5,
                "timeout_ms": 1500
            }
        }"#,
    );

    std::env::set_var("CHAMBER_CONFIG", file.path());
    std::env::set_var("CHAMBER_STORE_MODE", "append");
    std::env::set_var("CHAMBER_INFERENCE_TIMEOUT_MS", "250");

    let cfg = InspectConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "plant_a.db");
    assert_eq!(cfg.store_mode, WriteMode::Append);
    assert_eq!(cfg.unknown_classes, UnknownClassPolicy::Ignore);
    assert_eq!(cfg.api.addr, "0.0.0.0:9000");
    assert_eq!(cfg.api.workers, 8);
    assert_eq!(cfg.artifacts.upload_dir.to_str(), Some("/srv/in"));
    assert_eq!(cfg.artifacts.result_dir.to_str(), Some("/srv/out"));
    assert_eq!(cfg.detector.input_size, 320);
    assert_eq!(cfg.detector.confidence_threshold, 0.4);
    assert_eq!(cfg.detector.timeout, Some(Duration::from_millis(250)));

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CHAMBER_STORE_MODE", "replace");
    assert!(InspectConfig::load().is_err());
    clear_env();

    std::env::set_var("CHAMBER_INFERENCE_TIMEOUT_MS", "soon");
    assert!(InspectConfig::load().is_err());
    clear_env();

    std::env::set_var("CHAMBER_DETECTOR", "tract");
    let err = InspectConfig::load().unwrap_err();
    assert!(err.to_string().contains("model_path"));
    clear_env();

    let file = write_config(r#"{ "detector": { "confidence_threshold": 1.5 } }"#);
    std::env::set_var("CHAMBER_CONFIG", file.path());
    assert!(InspectConfig::load().is_err());
    clear_env();

    let file = write_config(r#"{ "api": { "workers": 0 } }"#);
    std::env::set_var("CHAMBER_CONFIG", file.path());
    assert!(InspectConfig::load().is_err());
    clear_env();
}

#[test]
fn unreadable_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CHAMBER_CONFIG", "/nonexistent/chamber.json");
    let err = InspectConfig::load().unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));

    let file = write_config("{ not json");
    std::env::set_var("CHAMBER_CONFIG", file.path());
    let err = InspectConfig::load().unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}
