//! Background maintenance: periodic flush and snapshot cleanup, final flush on shutdown.

use std::future::Future;
use std::sync::Arc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::info;

use crate::manager::MemoryManager;

/// Run until `shutdown` resolves, then persist every cached user.
///
/// Startup runs one cleanup pass immediately.
pub async fn run_maintenance<F>(manager: Arc<MemoryManager>, shutdown: F) -> usize
where
    F: Future<Output = ()>,
{
    let config = manager.config().clone();
    let retention = config.retention();

    manager.cleanup_older_than(retention).await;

    let mut flush_tick = interval_at(Instant::now() + config.flush_interval(), config.flush_interval());
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cleanup_tick =
        interval_at(Instant::now() + config.cleanup_interval(), config.cleanup_interval());
    cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "🔄 Maintenance started (flush every {:?}, cleanup every {:?})",
        config.flush_interval(),
        config.cleanup_interval()
    );

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = flush_tick.tick() => {
                manager.flush_all().await;
            }
            _ = cleanup_tick.tick() => {
                manager.cleanup_older_than(retention).await;
            }
        }
    }

    info!("🛑 Shutdown signal received, flushing memory...");
    manager.flush_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::store::{FileSnapshotStore, SnapshotStore};
    use crate::summarizer::MockSummarizer;

    #[tokio::test]
    async fn test_shutdown_flushes_cached_users() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileSnapshotStore::open(dir.path()).unwrap());
        let config = MemoryConfig {
            snapshot_dir: dir.path().to_path_buf(),
            save_interval: 100,
            ..MemoryConfig::default()
        };
        let manager = Arc::new(
            MemoryManager::new(config, store.clone(), Arc::new(MockSummarizer::new())).unwrap(),
        );
        manager.record_interaction(9, "ping", "pong").await;
        assert!(store.load(9).unwrap().is_none());

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(run_maintenance(manager.clone(), async {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();

        assert_eq!(task.await.unwrap(), 1);
        let snapshot = store.load(9).unwrap().unwrap();
        assert_eq!(snapshot.message_count, 2);
    }
}
