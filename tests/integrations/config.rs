use clap::Parser;
use procmon::cli::Cli;
use procmon::config::{Config, ListerKind, ReportEncoding};
use procmon::monitor::DurationAveraging;
use serial_test::serial;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Runs `test_fn` with a temporary config file holding `toml_content`.
fn with_config_file<F>(toml_content: &str, test_fn: F)
where
    F: FnOnce(&str),
{
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{}", toml_content).unwrap();
    test_fn(file.path().to_str().unwrap());
}

/// Sets environment variables for the duration of `test_fn`.
fn with_env<F>(vars: &[(&str, &str)], test_fn: F)
where
    F: FnOnce(),
{
    for (key, value) in vars {
        std::env::set_var(key, value);
    }
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(test_fn));
    for (key, _) in vars {
        std::env::remove_var(key);
    }
    if let Err(panic) = result {
        std::panic::resume_unwind(panic);
    }
}

fn cli(args: &[&str]) -> Cli {
    let mut argv = vec!["procmon"];
    argv.extend_from_slice(args);
    Cli::try_parse_from(argv).unwrap()
}

#[test]
#[serial]
fn test_load_full_valid_config() {
    let toml_content = r#"
        log_level = "debug"
        host = "graphite-01"

        [monitor]
        process_names = ["carbon-cache.py", "carbon-relay.py"]
        refresh_interval_seconds = 300
        sample_interval_seconds = 5
        queue_capacity = 10
        duration_averaging = "pairwise"
        lister = "procfs"
        proc_root = "/host/proc"
        page_size_bytes = 16384

        [taskstats]
        receive_timeout_ms = 250

        [report]
        collector_url = "http://collector:8080/metrics"
        timeout_ms = 1500
        encoding = "form"

        [metrics]
        enabled = true
        listen_address = "0.0.0.0:9200"
        system_metrics_enabled = false
    "#;

    with_config_file(toml_content, |path| {
        let config = Config::load(&cli(&["--config", path])).unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.host.as_deref(), Some("graphite-01"));
        assert_eq!(config.monitor.process_names, vec!["carbon-cache.py", "carbon-relay.py"]);
        assert_eq!(config.monitor.refresh_interval(), Duration::from_secs(300));
        assert_eq!(config.monitor.sample_interval(), Duration::from_secs(5));
        assert_eq!(config.monitor.queue_capacity, 10);
        assert_eq!(config.monitor.duration_averaging, DurationAveraging::Pairwise);
        assert_eq!(config.monitor.lister, ListerKind::Procfs);
        assert_eq!(config.monitor.proc_root, PathBuf::from("/host/proc"));
        assert_eq!(config.monitor.page_size_bytes, Some(16384));
        assert_eq!(config.taskstats.receive_timeout(), Duration::from_millis(250));
        assert_eq!(
            config.report.collector_url.as_deref(),
            Some("http://collector:8080/metrics")
        );
        assert_eq!(config.report.timeout(), Duration::from_millis(1500));
        assert_eq!(config.report.encoding, ReportEncoding::Form);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.listen_address.port(), 9200);
        assert!(!config.metrics.system_metrics_enabled);
    });
}

#[test]
#[serial]
fn test_defaults_apply_when_file_is_partial() {
    with_config_file("[monitor]\nprocess_names = [\"svc\"]\n", |path| {
        let config = Config::load(&cli(&["--config", path])).unwrap();
        let mut expected = Config::default();
        expected.monitor.process_names = vec!["svc".to_string()];
        assert_eq!(config, expected);
    });
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let toml_content = "[monitor]\nprocess_names = [\"svc\"]\nsample_interval_seconds = 30\n";
    with_config_file(toml_content, |path| {
        with_env(
            &[
                ("PROCMON_MONITOR__SAMPLE_INTERVAL_SECONDS", "15"),
                ("PROCMON_REPORT__ENCODING", "form"),
            ],
            || {
                let config = Config::load(&cli(&["--config", path])).unwrap();
                assert_eq!(config.monitor.sample_interval_seconds, 15);
                assert_eq!(config.report.encoding, ReportEncoding::Form);
            },
        );
    });
}

#[test]
#[serial]
fn test_cli_overrides_everything() {
    let toml_content = "host = \"from-file\"\n[monitor]\nprocess_names = [\"svc\"]\n";
    with_config_file(toml_content, |path| {
        with_env(&[("PROCMON_MONITOR__SAMPLE_INTERVAL_SECONDS", "15")], || {
            let config = Config::load(&cli(&[
                "--config",
                path,
                "--sample-interval",
                "3",
                "--refresh-interval",
                "60",
                "--host",
                "from-cli",
                "--collector-url",
                "http://127.0.0.1:9/collect",
                "db",
                "cache",
            ]))
            .unwrap();

            assert_eq!(config.monitor.sample_interval_seconds, 3);
            assert_eq!(config.monitor.refresh_interval_seconds, 60);
            assert_eq!(config.host.as_deref(), Some("from-cli"));
            assert_eq!(
                config.report.collector_url.as_deref(),
                Some("http://127.0.0.1:9/collect")
            );
            assert_eq!(config.monitor.process_names, vec!["db", "cache"]);
        });
    });
}

#[test]
#[serial]
fn test_missing_process_names_is_rejected() {
    with_config_file("log_level = \"warn\"\n", |path| {
        let err = Config::load(&cli(&["--config", path])).unwrap_err();
        assert!(err.to_string().contains("no process names"), "unexpected error: {}", err);
    });
}

#[test]
#[serial]
fn test_invalid_enum_value_is_rejected() {
    let toml_content = "[monitor]\nprocess_names = [\"svc\"]\nduration_averaging = \"median\"\n";
    with_config_file(toml_content, |path| {
        assert!(Config::load(&cli(&["--config", path])).is_err());
    });
}
