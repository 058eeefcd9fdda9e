//! Periodic background usage refresh
//!
//! Keeps the usage snapshot current between rotations, and is what moves a
//! paused or idle session back to Ready once the quota period rolls over.
//! Failures are logged by the manager and retried on the next tick.

use std::time::Duration;

use tracing::debug;

use crate::manager::ProxySessionManager;

/// Spawn a task that calls `refresh_usage` every `interval`.
///
/// The first tick is skipped; callers decide whether to refresh at
/// startup. Abort the returned handle to stop the task.
pub fn spawn_usage_refresh_task(
    manager: ProxySessionManager,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let state = manager.refresh_usage().await;
            debug!(state = state.label(), "periodic usage refresh done");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ProxyState;
    use guardian::{CredentialService, FetchOptions, MemoryUsageCache, PassResponse, ProxyUsage};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Usage-only service; pass fetches always fail.
    struct UsageOnly {
        remaining: u64,
        calls: AtomicUsize,
    }

    impl CredentialService for UsageOnly {
        fn fetch_proxy_pass<'a>(
            &'a self,
            _options: &'a FetchOptions,
        ) -> Pin<Box<dyn Future<Output = guardian::Result<PassResponse>> + Send + 'a>> {
            Box::pin(async { Err(guardian::Error::Http("not under test".into())) })
        }

        fn fetch_proxy_usage<'a>(
            &'a self,
            _options: &'a FetchOptions,
        ) -> Pin<Box<dyn Future<Output = guardian::Result<ProxyUsage>> + Send + 'a>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let remaining = self.remaining.to_string();
                ProxyUsage::parse("5368709120", &remaining, "3026-02-01T00:00:00Z")
            })
        }
    }

    async fn manager(service: Arc<UsageOnly>) -> ProxySessionManager {
        ProxySessionManager::builder(service, Arc::new(MemoryUsageCache::new()))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_is_skipped() {
        let service = Arc::new(UsageOnly {
            remaining: 10,
            calls: AtomicUsize::new(0),
        });
        let manager = manager(service.clone()).await;
        let handle = spawn_usage_refresh_task(manager, Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_every_interval() {
        let service = Arc::new(UsageOnly {
            remaining: 4_294_967_296,
            calls: AtomicUsize::new(0),
        });
        let manager = manager(service.clone()).await;
        let handle = spawn_usage_refresh_task(manager.clone(), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ProxyState::Ready);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_usage_keeps_session_not_ready() {
        let service = Arc::new(UsageOnly {
            remaining: 0,
            calls: AtomicUsize::new(0),
        });
        let manager = manager(service.clone()).await;
        let handle = spawn_usage_refresh_task(manager.clone(), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(manager.state(), ProxyState::NotReady);
        assert_eq!(manager.usage_info().await.unwrap().remaining, 0);
        handle.abort();
    }
}
