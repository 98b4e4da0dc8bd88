use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use spotwatch::config::SpotwatchConfig;
use spotwatch::OverlapMetric;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SPOTWATCH_CONFIG",
        "SPOTWATCH_API_ADDR",
        "SPOTWATCH_RESERVATION_HOLD_SECS",
        "SPOTWATCH_RELEASE_DELAY_SECS",
        "SPOTWATCH_ANALYSIS_INTERVAL_MS",
        "SPOTWATCH_STREAM_INTERVAL_MS",
        "SPOTWATCH_OVERLAP_METRIC",
        "SPOTWATCH_IOU_THRESHOLD",
        "SPOTWATCH_DETECTOR",
        "SPOTWATCH_MODEL_PATH",
        "SPOTWATCH_MIN_CONFIDENCE",
        "SPOTWATCH_CLASSES",
    ] {
        std::env::remove_var(key);
    }
}

fn write_json(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = SpotwatchConfig::load().expect("load config");
    assert_eq!(cfg.api_addr, "127.0.0.1:5000");
    assert_eq!(cfg.reservation_hold, Duration::from_secs(300));
    assert_eq!(cfg.release_delay, Duration::from_secs(3));
    assert_eq!(cfg.analysis_interval, Duration::from_secs(1));
    assert_eq!(cfg.stream.interval, Duration::from_millis(100));
    assert_eq!(cfg.stream.jpeg_quality, 80);
    assert_eq!(cfg.metric, OverlapMetric::AnyOverlap);
    assert_eq!(cfg.detector.backend, "scripted");
    assert_eq!(cfg.detector.allowed_classes, vec![2, 5, 7]);
    assert!(cfg.setup.is_none());
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_json(
        r#"{
            "api": { "addr": "0.0.0.0:9000" },
            "reservations": { "hold_secs": 120, "tick_ms": 250 },
            "occupancy": {
                "release_delay_secs": 5,
                "interval_ms": 500,
                "metric": "box_iou",
                "iou_threshold": 0.4
            },
            "stream": { "interval_ms": 50, "jpeg_quality": 70 },
            "detector": {
                "backend": "scripted",
                "min_confidence": 0.6,
                "classes": [7, 2, 2],
                "script": [[{"bbox": {"x1": 1, "y1": 2, "x2": 3, "y2": 4}, "class_id": 2, "confidence": 0.9}]]
            },
            "setup": {
                "video": "stub://lot",
                "lines": [{"x1": 10, "y1": 10, "x2": 50, "y2": 40}]
            }
        }"#,
    );

    std::env::set_var("SPOTWATCH_CONFIG", file.path());
    std::env::set_var("SPOTWATCH_RELEASE_DELAY_SECS", "8");
    std::env::set_var("SPOTWATCH_CLASSES", "5, 7");

    let cfg = SpotwatchConfig::load().expect("load config");

    assert_eq!(cfg.api_addr, "0.0.0.0:9000");
    assert_eq!(cfg.reservation_hold, Duration::from_secs(120));
    assert_eq!(cfg.reservation_tick, Duration::from_millis(250));
    assert_eq!(cfg.release_delay, Duration::from_secs(8));
    assert_eq!(cfg.analysis_interval, Duration::from_millis(500));
    assert_eq!(cfg.metric, OverlapMetric::BoxIou { threshold: 0.4 });
    assert_eq!(cfg.stream.interval, Duration::from_millis(50));
    assert_eq!(cfg.stream.jpeg_quality, 70);
    assert_eq!(cfg.detector.min_confidence, 0.6);
    assert_eq!(cfg.detector.allowed_classes, vec![5, 7]);
    assert_eq!(cfg.detector.script.len(), 1);
    let setup = cfg.setup.as_ref().expect("setup section");
    assert_eq!(setup.video, "stub://lot");
    assert_eq!(setup.lines.len(), 1);

    let settings = cfg.engine_settings();
    assert_eq!(settings.interval, Duration::from_millis(500));
    assert_eq!(settings.filter.allowed_classes, vec![5, 7]);

    clear_env();
}

#[test]
fn file_classes_are_sorted_and_deduplicated() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_json(r#"{ "detector": { "classes": [7, 2, 7, 5] } }"#);
    let cfg = SpotwatchConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.detector.allowed_classes, vec![2, 5, 7]);
}

#[test]
fn loads_toml_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("spotwatch.toml");
    std::fs::write(
        &path,
        r#"
[api]
addr = "127.0.0.1:7000"

[occupancy]
metric = "mask_iou"
iou_threshold = 0.3
render_inspection = false

[setup]
video = "stub://toml"
lines = [{ x1 = 0, y1 = 0, x2 = 20, y2 = 20 }, { x1 = 30, y1 = 0, x2 = 50, y2 = 20 }]
"#,
    )
    .expect("write toml");

    let cfg = SpotwatchConfig::load_from(Some(&path)).expect("load toml");
    assert_eq!(cfg.api_addr, "127.0.0.1:7000");
    assert_eq!(cfg.metric, OverlapMetric::MaskIou { threshold: 0.3 });
    assert!(!cfg.render_inspection);
    assert_eq!(cfg.setup.expect("setup").lines.len(), 2);
}

#[test]
fn env_metric_override_uses_threshold() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SPOTWATCH_OVERLAP_METRIC", "box_iou");
    std::env::set_var("SPOTWATCH_IOU_THRESHOLD", "0.7");
    let cfg = SpotwatchConfig::load().expect("load config");
    assert_eq!(cfg.metric, OverlapMetric::BoxIou { threshold: 0.7 });

    std::env::set_var("SPOTWATCH_OVERLAP_METRIC", "nearest");
    assert!(SpotwatchConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cases = [
        r#"{ "api": { "addr": "not an address" } }"#,
        r#"{ "reservations": { "hold_secs": 0 } }"#,
        r#"{ "occupancy": { "interval_ms": 0 } }"#,
        r#"{ "stream": { "jpeg_quality": 0 } }"#,
        r#"{ "occupancy": { "metric": "box_iou", "iou_threshold": 1.5 } }"#,
        r#"{ "detector": { "min_confidence": 1.0 } }"#,
        r#"{ "detector": { "classes": [] } }"#,
        r#"{ "setup": { "video": "stub://lot", "lines": [] } }"#,
        r#"{ "api": { "addr": 5000 } }"#,
    ];
    for json in cases {
        let file = write_json(json);
        assert!(
            SpotwatchConfig::load_from(Some(file.path())).is_err(),
            "accepted {json}"
        );
    }

    std::env::set_var("SPOTWATCH_RESERVATION_HOLD_SECS", "soon");
    assert!(SpotwatchConfig::load().is_err());
    clear_env();

    std::env::set_var("SPOTWATCH_CLASSES", "car");
    assert!(SpotwatchConfig::load().is_err());
    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().expect("temp dir");
    let err = SpotwatchConfig::load_from(Some(&dir.path().join("absent.json")))
        .expect_err("missing file");
    assert!(err.to_string().contains("absent.json"));
}
