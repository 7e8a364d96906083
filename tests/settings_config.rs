use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use redaction_kernel::config::PipelineSettings;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "REDACTD_CONFIG",
        "REDACTD_CAPTURE_DEVICE",
        "REDACTD_POLICY",
        "REDACTD_MUX_WIDTH",
        "REDACTD_MUX_HEIGHT",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_settings_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "capture": { "device": "/dev/video2", "caps": "video/x-raw, framerate=15/1" },
        "mux": { "width": 1920, "height": 1080, "batched_push_timeout_us": 33000 },
        "encoder_bitrate": 4000000,
        "class_labels": ["face", "plate"],
        "factories": { "display_sink": "fakesink" }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("REDACTD_CONFIG", file.path());
    std::env::set_var("REDACTD_CAPTURE_DEVICE", "/dev/video4");
    std::env::set_var("REDACTD_MUX_HEIGHT", "1088");

    let settings = PipelineSettings::load().expect("load settings");
    assert_eq!(settings.capture_device, "/dev/video4");
    assert_eq!(settings.capture_caps, "video/x-raw, framerate=15/1");
    assert_eq!(settings.mux.width, 1920);
    assert_eq!(settings.mux.height, 1088);
    assert_eq!(settings.mux.batch_size, 1);
    assert_eq!(settings.mux.batched_push_timeout_us, 33000);
    assert_eq!(settings.encoder_bitrate, 4_000_000);
    assert_eq!(settings.class_labels, vec!["face", "plate"]);
    assert_eq!(settings.factories.display_sink, "fakesink");
    assert_eq!(settings.factories.detector, "nvinfer");

    clear_env();
}

#[test]
fn defaults_apply_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let settings = PipelineSettings::load().expect("load settings");
    assert_eq!(settings.capture_device, "/dev/video0");
    assert_eq!(settings.mux.width, 1280);
    assert_eq!(settings.mux.height, 720);
    assert_eq!(settings.osd_font_size, 15);
    assert!(settings.policy_path.is_none());
}

#[test]
fn invalid_env_dimension_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("REDACTD_MUX_WIDTH", "wide");
    assert!(PipelineSettings::load().is_err());

    std::env::set_var("REDACTD_MUX_WIDTH", "0");
    assert!(PipelineSettings::load().is_err());

    clear_env();
}

#[test]
fn malformed_config_file_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(b"{ not json").expect("write config");
    std::env::set_var("REDACTD_CONFIG", file.path());

    assert!(PipelineSettings::load().is_err());
    clear_env();
}

#[test]
fn policy_env_selects_policy_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut policy = NamedTempFile::new().expect("temp policy");
    policy
        .write_all(
            br#"
[[class]]
id = 3
treatment = "suppress"
fill = [0.0, 0.0, 1.0, 1.0]
"#,
        )
        .expect("write policy");
    std::env::set_var("REDACTD_POLICY", policy.path());

    let settings = PipelineSettings::load().expect("load settings");
    assert_eq!(settings.policy_path, Some(PathBuf::from(policy.path())));
    let loaded = settings.load_policy().expect("load policy");
    assert_eq!(loaded.suppressed_classes(), vec![3]);

    clear_env();
}
