//! Online/offline signal sources

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Platform reachability signal
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;

    /// Receiver that observes every online/offline transition
    fn watch(&self) -> watch::Receiver<bool>;
}

/// Host-driven signal, flipped explicitly by the embedding application
#[derive(Debug)]
pub struct ManualConnectivity {
    state: watch::Sender<bool>,
}

impl ManualConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            state: watch::Sender::new(online),
        }
    }

    /// Publish a new state; repeated values do not wake watchers
    pub fn set_online(&self, online: bool) {
        publish(&self.state, online);
    }
}

impl Connectivity for ManualConnectivity {
    fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

fn publish(state: &watch::Sender<bool>, online: bool) -> bool {
    state.send_if_modified(|current| {
        if *current == online {
            false
        } else {
            *current = online;
            true
        }
    })
}

/// Periodic HTTP reachability check.
///
/// Any HTTP response counts as online; a connect error or timeout counts as
/// offline. The polling task stops when this value is dropped.
#[derive(Debug)]
pub struct HttpConnectivity {
    state: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HttpConnectivity {
    /// Start polling `url` every `interval`. Must be called inside a tokio runtime.
    pub fn spawn(url: impl Into<String>, interval: Duration, timeout: Duration) -> reqwest::Result<Self> {
        let url = url.into();
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let state = watch::Sender::new(false);
        let publisher = state.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = client.head(&url).send().await.is_ok();
                if publish(&publisher, online) {
                    tracing::info!(
                        "Connectivity changed: {}",
                        if online { "online" } else { "offline" }
                    );
                }
            }
        });

        Ok(Self { state, task })
    }
}

impl Connectivity for HttpConnectivity {
    fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Drop for HttpConnectivity {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;

    #[tokio::test]
    async fn test_manual_connectivity_notifies_transitions_only() {
        let connectivity = ManualConnectivity::new(false);
        let mut rx = connectivity.watch();

        connectivity.set_online(false);
        assert!(!rx.has_changed().unwrap());

        connectivity.set_online(true);
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
        assert!(connectivity.is_online());
    }

    async fn wait_for(connectivity: &HttpConnectivity, online: bool) {
        let mut rx = connectivity.watch();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|state| *state == online))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_http_connectivity_reports_reachable_server() {
        let app = Router::new().route("/", get(|| async { "ok" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let connectivity = HttpConnectivity::spawn(
            format!("http://{addr}/"),
            Duration::from_millis(20),
            Duration::from_secs(1),
        )
        .unwrap();
        wait_for(&connectivity, true).await;
        assert!(connectivity.is_online());
    }

    #[tokio::test]
    async fn test_http_connectivity_reports_unreachable_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connectivity = HttpConnectivity::spawn(
            format!("http://{addr}/"),
            Duration::from_millis(20),
            Duration::from_secs(1),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!connectivity.is_online());
    }
}
