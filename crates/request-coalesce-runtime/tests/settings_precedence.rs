use std::fs;
use std::path::{Path, PathBuf};

use request_coalesce_runtime::{
    CoalesceLayer, ConfigSource, LogFormat, SettingsLayer, SettingsResolver, TelemetryLayer,
};
use tempfile::tempdir;

fn write_file(path: &Path, contents: &str) -> PathBuf {
    fs::create_dir_all(path.parent().expect("parent dir")).unwrap();
    fs::write(path, contents).unwrap();
    path.to_path_buf()
}

#[test]
fn cli_overrides_env_file_precedence() {
    let tmp = tempdir().unwrap();
    let config = write_file(
        &tmp.path().join("config/coalesce.toml"),
        r#"
[coalesce]
max_key_depth = 8
drain_capacity = 2

[telemetry]
filter = "warn"
format = "json"
"#,
    );

    let cli = SettingsLayer {
        coalesce: Some(CoalesceLayer {
            max_key_depth: Some(4),
            drain_capacity: None,
        }),
        telemetry: None,
    };

    let resolved = SettingsResolver::new()
        .with_config_file(&config)
        .with_env([
            ("REQUEST_COALESCE_MAX_KEY_DEPTH", "6"),
            ("REQUEST_COALESCE_LOG", "debug"),
        ])
        .with_cli_overrides(cli)
        .load()
        .expect("resolve settings");

    let settings = &resolved.settings;
    assert_eq!(settings.coalesce.max_key_depth, 4, "CLI override should win");
    assert_eq!(
        resolved.source_of("coalesce.max_key_depth"),
        Some(&ConfigSource::Cli)
    );

    assert_eq!(
        settings.telemetry.filter, "debug",
        "env should win when CLI layer does not set field"
    );
    assert_eq!(
        resolved.source_of("telemetry.filter"),
        Some(&ConfigSource::Environment)
    );

    assert_eq!(settings.coalesce.drain_capacity, 2);
    assert_eq!(settings.telemetry.format, LogFormat::Json);
    assert_eq!(
        resolved.source_of("telemetry.format"),
        Some(&ConfigSource::File(config.clone()))
    );

    assert!(settings.telemetry.enabled);
    assert_eq!(
        resolved.source_of("telemetry.enabled"),
        Some(&ConfigSource::Default)
    );
}

#[test]
fn json_config_files_are_accepted() {
    let tmp = tempdir().unwrap();
    let config = write_file(
        &tmp.path().join("coalesce.json"),
        r#"{ "telemetry": { "enabled": false } }"#,
    );

    let resolved = SettingsResolver::new()
        .with_config_file(&config)
        .with_env(Vec::<(String, String)>::new())
        .load()
        .expect("resolve settings");

    assert!(!resolved.settings.telemetry.enabled);
    assert_eq!(resolved.settings.coalesce.max_key_depth, 64);
}

#[test]
fn unknown_fields_are_rejected() {
    let tmp = tempdir().unwrap();
    let config = write_file(
        &tmp.path().join("coalesce.toml"),
        "[coalesce]\nmax_depth = 3\n",
    );

    let err = SettingsResolver::new()
        .with_config_file(&config)
        .with_env(Vec::<(String, String)>::new())
        .load()
        .unwrap_err();
    assert!(format!("{err:#}").contains("not valid settings toml"));
}

#[test]
fn invalid_values_fail_validation() {
    let cli = SettingsLayer {
        coalesce: Some(CoalesceLayer {
            max_key_depth: None,
            drain_capacity: Some(0),
        }),
        telemetry: Some(TelemetryLayer {
            enabled: None,
            filter: Some("request_coalesce=loud".into()),
            format: None,
        }),
    };

    let err = SettingsResolver::new()
        .with_env(Vec::<(String, String)>::new())
        .with_cli_overrides(cli)
        .load()
        .unwrap_err();
    let rendered = format!("{err:#}");
    assert!(rendered.contains("drain_capacity"), "{rendered}");
    assert!(rendered.contains("telemetry.filter"), "{rendered}");
}
