use super::*;
use crate::job::payload::MIB;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_empty_document_uses_defaults() {
    let config = ConfigLoader::from_str("").unwrap();
    assert_eq!(config.queue.default_attempts, 3);
    assert_eq!(config.queue.backoff().delay_for(1), Duration::from_secs(5));
    assert_eq!(config.queue.resource_delay(), Duration::from_secs(10));
    assert!(config.queue.state_file.is_none());
    assert_eq!(config.queue.finished_retention, 1000);
    assert_eq!(config.resources.cpu_utilization_target, 0.75);
    assert_eq!(config.resources.sample_interval(), Duration::from_secs(5));
    assert_eq!(config.resources.sample_every_checks, 20);
    assert_eq!(config.sandbox.max_timeout_ms, 180_000);
    assert_eq!(config.sandbox.max_output_bytes, 1024 * 1024);
    assert_eq!(config.sandbox.container_prefix, "runbox");
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_memory_fields_accept_strings() {
    let yaml = r#"
resources:
  max_containers: 2
  per_container_memory_estimate: "1GB"
  reserved_memory_floor: 268435456
sandbox:
  default_memory_limit: "256MB"
"#;
    let config = ConfigLoader::from_str(yaml).unwrap();
    assert_eq!(config.resources.max_containers, 2);
    assert_eq!(config.resources.per_container_memory_estimate, 1024 * MIB);
    assert_eq!(config.resources.reserved_memory_floor, 256 * MIB);
    assert_eq!(config.sandbox.default_memory_limit, 256 * MIB);
}

#[test]
fn test_invalid_memory_string_is_a_parse_error() {
    let err = ConfigLoader::from_str("sandbox:\n  default_memory_limit: lots\n").unwrap_err();
    assert!(matches!(err, crate::errors::ConfigError::Parse(_)));
}

#[test]
fn test_validation_rejects_bad_values() {
    for yaml in [
        "queue:\n  default_attempts: 0\n",
        "resources:\n  max_containers: 0\n",
        "resources:\n  cpu_utilization_target: 1.5\n",
        "sandbox:\n  default_timeout_ms: 200000\n",
        "sandbox:\n  container_prefix: \"bad prefix\"\n",
        "sandbox:\n  default_memory_limit: \"64MB\"\n",
        "outcome:\n  event_buffer: 0\n",
    ] {
        let err = ConfigLoader::from_str(yaml).unwrap_err();
        assert!(
            matches!(err, crate::errors::ConfigError::Invalid(_)),
            "{} should fail validation",
            yaml
        );
    }
}

#[test]
fn test_submission_limits_follow_sandbox_section() {
    let yaml = "sandbox:\n  max_timeout_ms: 60000\n  default_timeout_ms: 30000\n  default_cpu_quota: 1.0\nqueue:\n  default_attempts: 5\n";
    let limits = ConfigLoader::from_str(yaml).unwrap().submission_limits();
    assert_eq!(limits.max_timeout_ms, 60_000);
    assert_eq!(limits.default_timeout_ms, 30_000);
    assert_eq!(limits.default_cpu_quota, 1.0);
    assert_eq!(limits.default_attempts, 5);
}

#[tokio::test]
async fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "queue:\n  state_file: /tmp/runbox/queue.json\noutcome:\n  dead_letter_file: /tmp/runbox/dead.jsonl\nlogging:\n  level: debug"
    )
    .unwrap();

    let config = load_config(file.path()).await.unwrap();
    assert_eq!(
        config.queue.state_file.as_deref(),
        Some(std::path::Path::new("/tmp/runbox/queue.json"))
    );
    assert_eq!(config.logging.level, "debug");
}

#[tokio::test]
async fn test_missing_file_reports_path() {
    let err = load_config("/definitely/not/here.yaml").await.unwrap_err();
    match err {
        crate::errors::ConfigError::Read { path, .. } => assert!(path.contains("here.yaml")),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_bundled_sample_config_is_valid() {
    let config = ConfigLoader::from_str(include_str!("../../../../runbox.yaml")).unwrap();
    assert_eq!(config.resources.reserved_memory_floor, 2048 * MIB);
    assert_eq!(config.sandbox.default_memory_limit, 512 * MIB);
    assert!(config.queue.state_file.is_some());
}
