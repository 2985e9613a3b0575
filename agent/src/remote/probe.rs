//! Reachability probe.
//!
//! Polls `GET {base}/health` and feeds the result into a [`ReachabilitySignal`].
//! Any 2xx answer counts as reachable.

use ferry_engine::ReachabilitySignal;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct Probe {
    client: Client,
    url: String,
    signal: Arc<ReachabilitySignal>,
}

impl Probe {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        signal: Arc<ReachabilitySignal>,
    ) -> reqwest::Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url: format!("{base_url}/health"),
            signal,
        })
    }

    /// Probe once and publish the result. Returns whether the remote answered.
    pub async fn check(&self) -> bool {
        let reachable = match self.client.get(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::trace!(error = %e, "Health probe failed");
                false
            }
        };
        self.signal.set(reachable);
        reachable
    }

    /// Probe every `period` until the returned sender fires or is dropped.
    pub fn spawn(self, period: Duration) -> (oneshot::Sender<()>, JoinHandle<()>) {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        self.check().await;
                    }
                }
            }
            tracing::debug!("Reachability probe stopped");
        });
        (shutdown_tx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use ferry_engine::Reachability;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn spawn_health(up: Arc<AtomicBool>) -> String {
        let app = Router::new().route(
            "/health",
            get(move || {
                let up = up.clone();
                async move {
                    if up.load(Ordering::SeqCst) {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn check_follows_health_endpoint() {
        let up = Arc::new(AtomicBool::new(true));
        let base = spawn_health(up.clone()).await;
        let signal = Arc::new(ReachabilitySignal::new(false));
        let probe = Probe::new(&base, Duration::from_secs(2), signal.clone()).unwrap();

        assert!(probe.check().await);
        assert!(signal.is_reachable());

        up.store(false, Ordering::SeqCst);
        assert!(!probe.check().await);
        assert!(!signal.is_reachable());
    }

    #[tokio::test]
    async fn spawned_probe_publishes_and_stops() {
        let base = spawn_health(Arc::new(AtomicBool::new(true))).await;
        let signal = Arc::new(ReachabilitySignal::new(false));
        let mut rx = signal.subscribe();
        let probe = Probe::new(&base, Duration::from_secs(2), signal.clone()).unwrap();

        let (stop, handle) = probe.spawn(Duration::from_millis(50));
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(*rx.borrow());

        stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
