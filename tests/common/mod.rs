//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dossier_realtime::realtime::{
    BackoffStrategy, ChangeEvent, MemoryProvider, RealtimeClient, RealtimeConfig, RealtimeMetrics,
};

/// Fixed 100 ms backoff, no jitter
pub fn quiet_config() -> RealtimeConfig {
    RealtimeConfig::default()
        .with_backoff(BackoffStrategy::Fixed)
        .with_reconnect_delay(Duration::from_millis(100), Duration::from_millis(100))
        .with_jitter(false)
}

pub struct TestClient {
    pub provider: Arc<MemoryProvider>,
    pub metrics: Arc<RealtimeMetrics>,
    pub client: RealtimeClient,
}

pub fn client_with(config: RealtimeConfig) -> TestClient {
    let provider = Arc::new(MemoryProvider::new());
    client_on(provider, config)
}

/// A second client sharing `provider`
pub fn client_on(provider: Arc<MemoryProvider>, config: RealtimeConfig) -> TestClient {
    let metrics = Arc::new(RealtimeMetrics::new());
    let client = RealtimeClient::with_telemetry(provider.clone(), config, metrics.clone())
        .expect("client inside runtime");
    TestClient {
        provider,
        metrics,
        client,
    }
}

pub type Seen = Arc<Mutex<Vec<ChangeEvent>>>;

/// Callback that records every event it receives
pub fn collecting() -> (impl Fn(ChangeEvent) + Send + Sync + 'static, Seen) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (
        move |event: ChangeEvent| sink.lock().unwrap().push(event),
        seen,
    )
}

pub fn count(seen: &Seen) -> usize {
    seen.lock().unwrap().len()
}

/// Let spawned join handshakes run
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool, limit: Duration) -> bool {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
