//! End-to-end tests of the sampling pipeline: discovery, per-thread
//! accounting, per-name aggregation, the report queue and delivery.

use procmon::{
    core::{ProcessMatch, Report},
    internal_metrics::Metrics,
    monitor::{DurationAveraging, MonitorState, Offer, ReportQueue},
    procfs::{
        fixtures::{stat_line, write_process},
        ProcFs,
    },
    taskstats::test_utils::FakeAccountingSource,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[path = "../helpers/mod.rs"]
mod helpers;
use helpers::{
    app::TestAppBuilder,
    fakes::{FailingReporter, RecordingReporter},
};

const TIMEOUT: Duration = Duration::from_secs(15);

fn matched(pairs: &[(u32, &str)]) -> Vec<ProcessMatch> {
    pairs
        .iter()
        .map(|(pid, name)| ProcessMatch {
            pid: *pid,
            name: name.to_string(),
        })
        .collect()
}

#[test]
fn test_same_named_processes_fold_into_one_service() {
    let dir = tempfile::tempdir().unwrap();
    write_process(dir.path(), 100, "svc -a", &[100], &stat_line(100, "svc", 0, 0, 1, 1000, 2));
    write_process(dir.path(), 101, "svc -b", &[101], &stat_line(101, "svc", 0, 0, 1, 3000, 4));
    let source = Arc::new(FakeAccountingSource::new());
    source.set_io(100, 0, 0);
    source.set_io(101, 0, 0);

    let mut state = MonitorState::new(
        vec!["svc".into(), "db".into()],
        ProcFs::new(dir.path(), 4096),
        source.clone(),
        DurationAveraging::Mean,
    );
    let t0 = Instant::now();
    state.apply_matches(matched(&[(100, "svc"), (101, "svc")]), t0);

    // The first pass only establishes baselines and reports nothing.
    let warmup = state.sample_at(t0 + Duration::from_secs(1)).unwrap();
    assert!(warmup.is_empty());

    source.set_io(100, 4096, 0);
    source.set_io(101, 8192, 0);
    let bundles = state.sample_at(t0 + Duration::from_secs(3)).unwrap();

    assert_eq!(bundles.len(), 1, "a name with no pids must not appear");
    let service = bundles[0].to_service_report();
    assert_eq!(service.service, "svc");
    assert_eq!(service.data.read_bytes, 6144);
    assert_eq!(service.data.write_bytes, 0);
    assert_eq!(service.data.num_processes, 2);
    assert_eq!(service.data.num_threads, 2);
    assert_eq!(service.data.vm, 4000);
    assert_eq!(service.data.rss, 6 * 4096);
}

#[test]
fn test_vanished_process_stops_contributing() {
    let dir = tempfile::tempdir().unwrap();
    write_process(dir.path(), 100, "svc", &[100], &stat_line(100, "svc", 0, 0, 1, 0, 0));
    write_process(dir.path(), 101, "svc", &[101], &stat_line(101, "svc", 0, 0, 1, 0, 0));
    let source = Arc::new(FakeAccountingSource::new());
    source.set_io(100, 0, 0);
    source.set_io(101, 0, 0);
    let mut state = MonitorState::new(
        vec!["svc".into()],
        ProcFs::new(dir.path(), 4096),
        source.clone(),
        DurationAveraging::Mean,
    );
    let t0 = Instant::now();
    state.apply_matches(matched(&[(100, "svc"), (101, "svc")]), t0);
    state.sample_at(t0 + Duration::from_secs(2)).unwrap();

    std::fs::remove_dir_all(dir.path().join("101")).unwrap();
    source.remove(101);
    source.set_io(100, 2000, 0);
    let bundles = state.sample_at(t0 + Duration::from_secs(4)).unwrap();

    assert_eq!(bundles[0].num_processes, 1);
    assert_eq!(bundles[0].to_service_report().data.read_bytes, 1000);
}

#[tokio::test]
async fn test_queue_drops_the_overflowing_report_without_blocking() {
    let (queue, rx) = ReportQueue::bounded(1000, Arc::new(Metrics::disabled()));
    for _ in 0..1000 {
        assert_eq!(queue.offer(Report::default()), Offer::Queued);
    }

    let started = Instant::now();
    assert_eq!(queue.offer(Report::default()), Offer::Dropped);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(rx.len(), 1000);
}

#[tokio::test]
async fn test_app_reports_matched_processes() {
    let reporter = Arc::new(RecordingReporter::new());
    let app = TestAppBuilder::new()
        .with_process(100, "svc --worker", &[100, 101])
        .with_process(200, "postgres", &[200])
        .with_reporter(reporter.clone())
        .start()
        .await
        .unwrap();

    // The agent's own pid mentions "svc" too but is never tracked.
    assert_eq!(app.tracked_pids(), vec![100]);
    assert_eq!(procmon::taskstats::delay_accounting_enabled(), Some(false));

    // Counters that already hold history when first seen only set the
    // baseline; the first report covers growth after it.
    let started = Instant::now();
    app.source.set_io(100, 50 << 20, 0);
    app.source.set_io(101, 50 << 20, 0);

    let first = reporter.wait_for_reports(1, TIMEOUT).await;
    assert!(
        started.elapsed() >= Duration::from_secs(3),
        "the baseline pass must not produce a report"
    );
    let data = first[0].service("svc").expect("svc should be reported");
    assert_eq!(first[0].host, "test-host");
    assert_eq!(data.num_processes, 1);
    assert_eq!(data.num_threads, 2);
    assert_eq!(data.read_bytes, 0);
    assert!(first[0].service("postgres").is_none());

    app.source.set_io(100, 51 << 20, 0);
    app.source.set_io(101, 51 << 20, 4096);
    let reports = reporter.wait_for_reports(2, TIMEOUT).await;
    let data = reports[1].service("svc").unwrap();
    assert!(data.read_bytes > 0);
    assert!(data.write_bytes > 0);

    app.shutdown(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn test_unsupported_kernel_stops_the_app() {
    let builder = TestAppBuilder::new().with_process(100, "svc", &[100]);
    builder.source().set_unsupported_version(100, 3);
    let app = builder
        .with_reporter(Arc::new(RecordingReporter::new()))
        .start()
        .await
        .unwrap();

    let err = app.join(TIMEOUT).await.unwrap_err();
    assert!(
        err.to_string().contains("version 3"),
        "unexpected error: {}",
        err
    );
}

#[tokio::test]
async fn test_failed_reports_are_dropped_and_sampling_continues() {
    let reporter = Arc::new(FailingReporter::default());
    let app = TestAppBuilder::new()
        .with_process(100, "svc", &[100])
        .with_reporter(reporter.clone())
        .start()
        .await
        .unwrap();

    reporter.wait_for_attempts(2, TIMEOUT).await;
    assert!(reporter.attempts() >= 2);
    app.shutdown(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn test_collector_receives_json_reports() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/collect"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let url = format!("{}/collect", server.uri());
    let app = TestAppBuilder::new()
        .with_process(100, "svc", &[100])
        .with_config_modifier(|config| config.report.collector_url = Some(url))
        .start()
        .await
        .unwrap();

    let body = tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Some(request) = server.received_requests().await.unwrap_or_default().first() {
                return request.body.clone();
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("collector never received a report");

    let report: Report = serde_json::from_slice(&body).unwrap();
    assert_eq!(report.host, "test-host");
    assert_eq!(report.service("svc").unwrap().num_processes, 1);

    app.shutdown(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn test_metrics_endpoint_serves_prometheus_text() {
    let app = TestAppBuilder::new()
        .with_process(100, "svc", &[100])
        .with_reporter(Arc::new(RecordingReporter::new()))
        .with_config_modifier(|config| {
            config.metrics.enabled = true;
            config.metrics.listen_address = "127.0.0.1:0".parse().unwrap();
            config.metrics.system_metrics_enabled = false;
        })
        .with_configured_metrics()
        .start()
        .await
        .unwrap();

    let url = format!("http://{}/metrics", app.metrics_addr());
    let response = reqwest::get(&url).await.unwrap();
    assert!(response.status().is_success());
    let body = response.text().await.unwrap();
    assert!(body.contains("tracked_processes"), "metrics body: {}", body);

    app.shutdown(TIMEOUT).await.unwrap();
}
