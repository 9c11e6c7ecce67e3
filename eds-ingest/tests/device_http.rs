use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::get, Router};
use eds_ingest::{
    scheduler::AlignedTicker,
    sources::{acquire, EdsDeviceSource, HttpFetcher, RetryPolicy},
    PipelineError, Service,
};
use tokio::sync::mpsc;

const DETAILS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Devices-Detail-Response xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <PollCount>1024</PollCount>
  <DevicesConnected>2</DevicesConnected>
  <owd_DS18B20 Description="Programmable resolution thermometer">
    <Name>DS18B20</Name>
    <Family>28</Family>
    <ROMId>5F0000025A3C8E28</ROMId>
    <Temperature Units="Centigrade">21.5</Temperature>
  </owd_DS18B20>
  <owd_DS2423 Description="RAM with Counter">
    <Name>DS2423</Name>
    <Family>1D</Family>
    <Counter_A>1234</Counter_A>
    <Counter_B>0</Counter_B>
  </owd_DS2423>
</Devices-Detail-Response>
"#;

/// Answers with `status` for the first `failures` requests, then with `body`.
#[derive(Clone)]
struct Device {
    hits: Arc<AtomicUsize>,
    failures: usize,
    status: StatusCode,
    body: &'static str,
}

async fn details(State(device): State<Device>) -> (StatusCode, &'static str) {
    let n = device.hits.fetch_add(1, Ordering::SeqCst);
    if n < device.failures {
        (device.status, "unavailable")
    } else {
        (StatusCode::OK, device.body)
    }
}

async fn serve_device(failures: usize, status: StatusCode, body: &'static str) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let device = Device {
        hits: hits.clone(),
        failures,
        status,
        body,
    };
    let app = Router::new()
        .route("/details.xml", get(details))
        .with_state(device);

    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}/details.xml"), hits)
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        backoff_step: Duration::from_millis(10),
    }
}

#[tokio::test]
async fn reads_temperature_and_counter_from_device() {
    let (url, hits) = serve_device(0, StatusCode::OK, DETAILS).await;
    let fetcher = HttpFetcher::new(&url, Duration::from_secs(5)).unwrap();

    let dp = acquire(&fetcher, &fast_policy()).await.unwrap();

    assert_eq!(dp.temperature, 21.5);
    assert_eq!(dp.watt_hours, 1234);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retries_through_service_unavailable() {
    let (url, hits) = serve_device(2, StatusCode::SERVICE_UNAVAILABLE, DETAILS).await;
    let fetcher = HttpFetcher::new(&url, Duration::from_secs(5)).unwrap();

    let dp = acquire(&fetcher, &fast_policy()).await.unwrap();

    assert_eq!(dp.watt_hours, 1234);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn non_200_success_codes_are_retried() {
    let (url, hits) = serve_device(1, StatusCode::NO_CONTENT, DETAILS).await;
    let fetcher = HttpFetcher::new(&url, Duration::from_secs(5)).unwrap();

    acquire(&fetcher, &fast_policy()).await.unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn gives_up_after_attempt_limit() {
    let (url, hits) = serve_device(usize::MAX, StatusCode::INTERNAL_SERVER_ERROR, DETAILS).await;
    let fetcher = HttpFetcher::new(&url, Duration::from_secs(5)).unwrap();

    let err = acquire(&fetcher, &fast_policy()).await.unwrap_err();

    assert!(matches!(err, PipelineError::Fetch { attempts: 5, .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn unreachable_device_is_a_fetch_error() {
    // Bind then drop to get a port nobody listens on.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let fetcher = HttpFetcher::new(&format!("http://{addr}/details.xml"), Duration::from_secs(1)).unwrap();
    let policy = RetryPolicy {
        max_attempts: 2,
        backoff_step: Duration::from_millis(1),
    };

    let err = acquire(&fetcher, &policy).await.unwrap_err();
    assert!(matches!(err, PipelineError::Fetch { attempts: 2, .. }));
}

#[tokio::test]
async fn garbage_body_is_not_retried() {
    let (url, hits) = serve_device(0, StatusCode::OK, "<html><body>oops").await;
    let fetcher = HttpFetcher::new(&url, Duration::from_secs(5)).unwrap();

    let err = acquire(&fetcher, &fast_policy()).await.unwrap_err();

    assert!(matches!(err, PipelineError::Parse(_)));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn acquirer_delivers_on_each_tick() {
    let (url, _hits) = serve_device(0, StatusCode::OK, DETAILS).await;
    let fetcher = HttpFetcher::new(&url, Duration::from_secs(5)).unwrap();
    let (tx, mut rx) = mpsc::channel(1);
    let source = Arc::new(EdsDeviceSource::new(
        fetcher,
        fast_policy(),
        AlignedTicker::new(Duration::from_millis(50)).unwrap(),
        tx,
    ));

    let handle = tokio::spawn({
        let source = source.clone();
        async move { source.serve().await }
    });

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.temperature, 21.5);
    assert!(second.time >= first.time);

    source.stop();
    let res = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(res.is_ok());
}
