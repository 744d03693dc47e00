//! MemoryManager - bounded per-user conversation memory.
//!
//! - RAM: LRU of at most `max_cached_users` users. A victim is persisted before
//!   it leaves RAM; if the write fails it stays cached past capacity and is
//!   retried on the next capacity check.
//! - Disk: one snapshot per user, autosaved every `save_interval` interactions,
//!   flushed on shutdown, reaped by mtime.
//! - Summaries: once summary + turns exceed `token_limit`, everything but the
//!   last `recent_window` turns is folded into the running summary.
//!
//! Locking: the cache-wide lock is a `parking_lot::Mutex` that is never held
//! across an `.await`. Each user has its own async lock for content changes,
//! and a write lock that orders snapshot writes by revision.

use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::{MemoryConfig, Settings};
use crate::error::{Result, StoreError, SummarizerError};
use crate::metrics::Metrics;
use crate::store::{FileSnapshotStore, SnapshotStore};
use crate::summarizer::{LlmSummarizer, Summarizer};
use crate::tokens::{self, TokenEstimator, WordEstimator};
use crate::types::{ConversationState, MemoryStats, Snapshot, Turn, UserId};

/// Rough RAM footprint of one estimated token
const BYTES_PER_TOKEN: u64 = 4;

struct SlotState {
    conv: ConversationState,
    /// False until the snapshot (if any) has been read
    loaded: bool,
    /// Evicted and persisted; holders must re-acquire the user
    detached: bool,
    /// Bumped on every content change
    revision: u64,
    /// Bumped on clear, invalidates in-flight summarizations
    epoch: u64,
}

struct Slot {
    state: Arc<AsyncMutex<SlotState>>,
    /// Highest revision known to be on disk
    written: AsyncMutex<u64>,
    summarizing: AtomicBool,
}

impl Slot {
    fn new(user_id: UserId) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(AsyncMutex::new(SlotState {
                conv: ConversationState::new(user_id),
                loaded: false,
                detached: false,
                revision: 0,
                epoch: 0,
            })),
            written: AsyncMutex::new(0),
            summarizing: AtomicBool::new(false),
        })
    }
}

struct CacheInner {
    lru: LruCache<UserId, Arc<Slot>>,
    /// Victims popped from `lru` whose snapshot is still being written
    evicting: HashMap<UserId, Arc<Slot>>,
}

impl CacheInner {
    /// Pop LRU entries until one more user fits.
    fn take_victims(&mut self, capacity: usize) -> Vec<(UserId, Arc<Slot>)> {
        let mut victims = Vec::new();
        while self.lru.len() >= capacity {
            match self.lru.pop_lru() {
                Some((user_id, slot)) => {
                    self.evicting.insert(user_id, Arc::clone(&slot));
                    victims.push((user_id, slot));
                }
                None => break,
            }
        }
        victims
    }

    /// Put a victim whose eviction did not complete back at the LRU end.
    /// No-op if a caller reclaimed it meanwhile.
    fn restore(&mut self, user_id: UserId, slot: &Arc<Slot>) -> bool {
        let pending = self
            .evicting
            .get(&user_id)
            .is_some_and(|pending| Arc::ptr_eq(pending, slot));
        if pending {
            self.evicting.remove(&user_id);
            self.lru.push(user_id, Arc::clone(slot));
            self.lru.demote(&user_id);
        }
        pending
    }

    fn is_resident(&self, user_id: UserId) -> bool {
        self.lru.contains(&user_id) || self.evicting.contains_key(&user_id)
    }

    fn all_slots(&self) -> Vec<(UserId, Arc<Slot>)> {
        self.lru
            .iter()
            .map(|(user_id, slot)| (*user_id, Arc::clone(slot)))
            .chain(
                self.evicting
                    .iter()
                    .map(|(user_id, slot)| (*user_id, Arc::clone(slot))),
            )
            .collect()
    }
}

/// Victims of one capacity check that still have to be evicted. If the caller
/// is dropped midway, the rest go back into the LRU instead of being stranded
/// in `evicting`.
struct PendingEvictions<'a> {
    cache: &'a Mutex<CacheInner>,
    victims: VecDeque<(UserId, Arc<Slot>)>,
}

impl Drop for PendingEvictions<'_> {
    fn drop(&mut self) {
        if self.victims.is_empty() {
            return;
        }
        let mut cache = self.cache.lock();
        // reverse, so the oldest victim ends up least recently used
        for (user_id, slot) in self.victims.drain(..).rev() {
            if cache.restore(user_id, &slot) {
                warn!("[EVICT] Eviction of user {} interrupted, kept in RAM", user_id);
            }
        }
    }
}

struct PendingWrite {
    revision: u64,
    snapshot: Snapshot,
    /// Rewrite even if this revision is already on disk
    force: bool,
}

impl PendingWrite {
    fn capture(state: &SlotState, force: bool) -> Self {
        Self {
            revision: state.revision,
            snapshot: Snapshot::from(&state.conv),
            force,
        }
    }
}

/// Holds the per-user summarization flag; released on drop, so a cancelled
/// summarization never blocks later ones.
struct SummarizeGuard {
    slot: Arc<Slot>,
}

impl SummarizeGuard {
    fn try_acquire(slot: &Arc<Slot>) -> Option<Self> {
        slot.summarizing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self {
            slot: Arc::clone(slot),
        })
    }
}

impl Drop for SummarizeGuard {
    fn drop(&mut self) {
        self.slot.summarizing.store(false, Ordering::Release);
    }
}

struct Compaction {
    _guard: SummarizeGuard,
    epoch: u64,
    previous: String,
    old: Vec<Turn>,
    tokens: usize,
}

pub struct MemoryManager {
    config: MemoryConfig,
    cache: Mutex<CacheInner>,
    store: Arc<dyn SnapshotStore>,
    summarizer: Arc<dyn Summarizer>,
    estimator: Arc<dyn TokenEstimator>,
    metrics: Metrics,
}

impl MemoryManager {
    /// Build a manager; an invalid configuration is rejected here.
    pub fn new(
        config: MemoryConfig,
        store: Arc<dyn SnapshotStore>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Result<Self> {
        config.validate()?;

        info!("🧠 [INIT] MemoryManager");
        info!("       Token limit: {}", config.token_limit);
        info!("       Max cached users: {}", config.max_cached_users);
        info!("       Save interval: {} interactions", config.save_interval);
        info!("       Recent window: {} turns", config.recent_window);

        Ok(Self {
            estimator: Arc::new(WordEstimator::new(config.tokens_per_word)),
            config,
            cache: Mutex::new(CacheInner {
                lru: LruCache::unbounded(),
                evicting: HashMap::new(),
            }),
            store,
            summarizer,
            metrics: Metrics::new(),
        })
    }

    /// File snapshots under `memory.snapshot_dir`, LLM summaries.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let store = FileSnapshotStore::open(settings.memory.snapshot_dir.clone())?;
        let summarizer = LlmSummarizer::new(settings.summarizer.clone())?;
        Self::new(settings.memory.clone(), Arc::new(store), Arc::new(summarizer))
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Cached users, most recently used first. Does not change recency.
    pub fn cached_users(&self) -> Vec<UserId> {
        self.cache.lock().lru.iter().map(|(user_id, _)| *user_id).collect()
    }

    pub fn is_cached(&self, user_id: UserId) -> bool {
        self.cache.lock().lru.contains(&user_id)
    }

    // ========================================
    // CORE MEMORY OPERATIONS
    // ========================================

    /// Current memory of a user: cached, restored from disk, or empty.
    pub async fn get_or_create(&self, user_id: UserId) -> ConversationState {
        let (_slot, state) = self.resident(user_id).await;
        state.conv.clone()
    }

    /// Append a user/assistant exchange, autosave on cadence, then summarize
    /// if the user's memory is over budget.
    pub async fn record_interaction(&self, user_id: UserId, user_text: &str, assistant_text: &str) {
        let (slot, mut state) = self.resident(user_id).await;
        state.conv.push_exchange(user_text, assistant_text);
        state.revision += 1;

        let count = state.conv.interaction_count;
        let autosave = (count % self.config.save_interval == 0)
            .then(|| PendingWrite::capture(&state, false));
        let compaction = self.plan_compaction(&slot, &state);
        drop(state);

        if let Some(pending) = autosave {
            match self.persist(&slot, pending).await {
                Ok(_) => debug!("[AUTO-SAVE] User {} - {} interactions", user_id, count),
                Err(e) => {
                    self.metrics.inc_persist_failures();
                    error!("[AUTO-SAVE] Failed to save user {}: {}", user_id, e);
                }
            }
        }

        if let Some(job) = compaction {
            self.compact(user_id, &slot, job).await;
        }
    }

    /// Forget everything about a user, in RAM and on disk.
    pub async fn clear(&self, user_id: UserId) {
        let slot = {
            let cache = self.cache.lock();
            cache
                .lru
                .peek(&user_id)
                .or_else(|| cache.evicting.get(&user_id))
                .cloned()
        };

        if let Some(slot) = slot {
            let mut state = Arc::clone(&slot.state).lock_owned().await;
            if !state.detached {
                state.conv = ConversationState::new(user_id);
                state.loaded = true;
                state.revision += 1;
                state.epoch += 1;

                // stale in-flight writes are older than this revision
                let mut written = slot.written.lock().await;
                self.delete_snapshot(user_id).await;
                *written = state.revision;

                info!("[CLEAR] Memory cleared for user {}", user_id);
                return;
            }
        }

        self.delete_snapshot(user_id).await;
    }

    // ========================================
    // ADMINISTRATION
    // ========================================

    pub async fn stats(&self) -> MemoryStats {
        let slots = self.cache.lock().all_slots();

        let mut estimated_tokens = 0;
        for (_, slot) in &slots {
            let state = slot.state.lock().await;
            if state.loaded && !state.detached {
                estimated_tokens += tokens::estimate_state(self.estimator.as_ref(), &state.conv);
            }
        }

        let (total_users_on_disk, disk_bytes) = self
            .blocking(|store| {
                let mut count = 0usize;
                let mut bytes = 0u64;
                for meta in store.list()? {
                    count += 1;
                    bytes += meta.size_bytes;
                }
                Ok((count, bytes))
            })
            .await
            .unwrap_or_else(|e| {
                error!("[STATS] Failed to scan snapshots: {}", e);
                (0, 0)
            });

        MemoryStats {
            users_in_ram: slots.len(),
            total_users_on_disk,
            estimated_tokens,
            estimated_ram_bytes: estimated_tokens as u64 * BYTES_PER_TOKEN,
            disk_bytes,
            summarizations: self.metrics.summarizations(),
            degraded_summarizations: self.metrics.degraded_summarizations(),
            evictions: self.metrics.evictions(),
            persist_failures: self.metrics.persist_failures(),
            cache_hits: self.metrics.hits(),
            cache_misses: self.metrics.misses(),
            max_cached_users: self.config.max_cached_users,
        }
    }

    /// Delete snapshots whose file was last written more than `retention` ago.
    /// RAM is not touched, and snapshots of users currently in RAM are kept:
    /// their next save rewrites them anyway.
    pub async fn cleanup_older_than(&self, retention: Duration) -> usize {
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(UNIX_EPOCH);
        info!("[CLEANUP] Starting cleanup (retention: {:?})...", retention);

        let stale = self
            .blocking(move |store| {
                Ok(store
                    .list()?
                    .filter(|meta| meta.modified < cutoff)
                    .map(|meta| meta.user_id)
                    .collect::<Vec<_>>())
            })
            .await;
        let stale = match stale {
            Ok(stale) => stale,
            Err(e) => {
                error!("[CLEANUP] Failed: {}", e);
                return 0;
            }
        };

        let mut deleted = 0;
        for user_id in stale {
            if self.cache.lock().is_resident(user_id) {
                debug!("[CLEANUP] User {} is in RAM, keeping snapshot", user_id);
                continue;
            }
            // mtime is checked again at delete time: an eviction may have rewritten it
            match self
                .blocking(move |store| store.delete_if_older(user_id, cutoff))
                .await
            {
                Ok(true) => {
                    deleted += 1;
                    debug!("[CLEANUP] Deleted snapshot of user {}", user_id);
                }
                Ok(false) => debug!("[CLEANUP] Snapshot of user {} rewritten, kept", user_id),
                Err(e) => warn!("[CLEANUP] Error deleting user {}: {}", user_id, e),
            }
        }

        info!("[CLEANUP] Completed - Deleted {} old conversations", deleted);
        deleted
    }

    /// Persist every RAM-resident user that has content. Returns how many of
    /// them have an up-to-date snapshot afterwards.
    pub async fn flush_all(&self) -> usize {
        info!("[FORCE-SAVE] Saving all users to disk...");
        let slots = self.cache.lock().all_slots();

        let mut saved = 0;
        for (user_id, slot) in slots {
            let pending = {
                let state = slot.state.lock().await;
                if !state.loaded || state.detached || state.conv.is_empty() {
                    continue;
                }
                PendingWrite::capture(&state, true)
            };

            match self.persist(&slot, pending).await {
                Ok(_) => saved += 1,
                Err(e) => {
                    self.metrics.inc_persist_failures();
                    error!("[FORCE-SAVE] Failed to save user {}: {}", user_id, e);
                }
            }
        }

        info!("[FORCE-SAVE] Saved {} users to disk", saved);
        saved
    }

    // ========================================
    // CACHE & EVICTION
    // ========================================

    /// Lock the user's loaded, cached state.
    async fn resident(&self, user_id: UserId) -> (Arc<Slot>, OwnedMutexGuard<SlotState>) {
        loop {
            let slot = self.acquire(user_id).await;
            let mut state = Arc::clone(&slot.state).lock_owned().await;
            if state.detached {
                debug!("User {} was evicted meanwhile, retrying", user_id);
                continue;
            }
            if !state.loaded {
                self.load_into(&mut state).await;
            }
            state.conv.touch();
            return (slot, state);
        }
    }

    /// Find or insert the user's slot as most recently used, evicting LRU
    /// users first when the cache is full.
    async fn acquire(&self, user_id: UserId) -> Arc<Slot> {
        let (slot, victims) = {
            let mut cache = self.cache.lock();
            if let Some(slot) = cache.lru.get(&user_id) {
                self.metrics.inc_hit();
                (Arc::clone(slot), Vec::new())
            } else {
                let slot = match cache.evicting.remove(&user_id) {
                    Some(slot) => {
                        debug!("User {} reclaimed while being evicted", user_id);
                        slot
                    }
                    None => {
                        self.metrics.inc_miss();
                        Slot::new(user_id)
                    }
                };
                let victims = cache.take_victims(self.config.max_cached_users);
                cache.lru.push(user_id, Arc::clone(&slot));
                (slot, victims)
            }
        };

        let mut pending = PendingEvictions {
            cache: &self.cache,
            victims: victims.into(),
        };
        while let Some((victim_id, victim)) = pending.victims.front().cloned() {
            self.evict(victim_id, victim).await;
            pending.victims.pop_front();
        }
        slot
    }

    async fn evict(&self, user_id: UserId, slot: Arc<Slot>) {
        let mut state = slot.state.lock().await;
        let outcome = if state.loaded && !state.detached {
            let pending = PendingWrite::capture(&state, !state.conv.is_empty());
            self.persist(&slot, pending).await.map(|_| ())
        } else {
            Ok(())
        };

        let mut cache = self.cache.lock();
        let still_evicting = cache
            .evicting
            .get(&user_id)
            .is_some_and(|pending| Arc::ptr_eq(pending, &slot));
        if !still_evicting {
            // reclaimed by a caller while we were writing, stays resident
            return;
        }
        cache.evicting.remove(&user_id);

        match outcome {
            Ok(()) => {
                state.detached = true;
                self.metrics.inc_evictions();
                info!("[EVICT] User {} evicted from RAM (LRU)", user_id);
            }
            Err(e) => {
                self.metrics.inc_persist_failures();
                error!(
                    "[EVICT] Failed to persist user {}, keeping it in RAM: {}",
                    user_id, e
                );
                cache.lru.push(user_id, Arc::clone(&slot));
                cache.lru.demote(&user_id);
            }
        }
    }

    async fn load_into(&self, state: &mut SlotState) {
        let user_id = state.conv.user_id;
        match self.blocking(move |store| store.load(user_id)).await {
            Ok(Some(snapshot)) => {
                state.conv = snapshot.into();
                debug!("[LOAD] Memory restored from disk for user {}", user_id);
            }
            Ok(None) => debug!("[CREATE] New memory for user {}", user_id),
            Err(e) => error!("[LOAD] Failed to load user {}, starting empty: {}", user_id, e),
        }
        state.loaded = true;
    }

    // ========================================
    // PERSISTENCE
    // ========================================

    /// Write a captured state unless a newer (or, unforced, the same) revision
    /// is already on disk. Returns whether a write happened.
    async fn persist(&self, slot: &Slot, pending: PendingWrite) -> Result<bool> {
        let mut written = slot.written.lock().await;
        if pending.revision < *written || (pending.revision == *written && !pending.force) {
            return Ok(false);
        }

        let PendingWrite {
            revision, snapshot, ..
        } = pending;
        self.blocking(move |store| store.save(&snapshot)).await?;
        *written = revision;
        Ok(true)
    }

    async fn delete_snapshot(&self, user_id: UserId) {
        if let Err(e) = self.blocking(move |store| store.delete(user_id)).await {
            error!("[DELETE] Failed to delete snapshot of user {}: {}", user_id, e);
        }
    }

    /// Run a store operation on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SnapshotStore) -> std::result::Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let value = tokio::task::spawn_blocking(move || op(store.as_ref())).await??;
        Ok(value)
    }

    // ========================================
    // SUMMARIZATION
    // ========================================

    fn plan_compaction(&self, slot: &Arc<Slot>, state: &SlotState) -> Option<Compaction> {
        let tokens = tokens::estimate_state(self.estimator.as_ref(), &state.conv);
        if tokens <= self.config.token_limit {
            return None;
        }

        let turns = &state.conv.turns;
        if turns.len() <= self.config.recent_window {
            debug!(
                "User {} over budget ({} tokens) but only recent turns left",
                state.conv.user_id, tokens
            );
            return None;
        }

        let guard = SummarizeGuard::try_acquire(slot)?;
        let split = turns.len() - self.config.recent_window;
        Some(Compaction {
            _guard: guard,
            epoch: state.epoch,
            previous: state.conv.summary.clone(),
            old: turns[..split].to_vec(),
            tokens,
        })
    }

    /// Summarize outside any lock, then swap summary/turns under the user's lock.
    async fn compact(&self, user_id: UserId, slot: &Slot, job: Compaction) {
        let timeout = self.config.summarize_timeout();
        let outcome = match tokio::time::timeout(
            timeout,
            self.summarizer.summarize(&job.previous, &job.old),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SummarizerError::Timeout(timeout)),
        };

        let mut state = slot.state.lock().await;
        if state.detached || state.epoch != job.epoch {
            debug!("[SUMMARIZE] User {} changed meanwhile, discarding result", user_id);
            return;
        }

        // only compaction removes turns from the front, and only one runs per user
        let removed = job.old.len().min(state.conv.turns.len());
        state.conv.turns.drain(..removed);
        state.revision += 1;

        match outcome {
            Ok(summary) => {
                state.conv.summary = summary;
                self.metrics.inc_summarizations();
                info!(
                    "[SUMMARIZE] User {}: {} turns folded into summary ({} tokens before)",
                    user_id, removed, job.tokens
                );
            }
            Err(e) => {
                self.metrics.inc_degraded_summarizations();
                warn!(
                    "[SUMMARIZE] User {}: summarizer failed ({}), dropped {} old turns",
                    user_id, e, removed
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summarizer::MockSummarizer;
    use crate::types::SnapshotMeta;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// File store whose saves can be made to fail.
    struct FlakyStore {
        inner: FileSnapshotStore,
        fail_saves: AtomicBool,
    }

    impl SnapshotStore for FlakyStore {
        fn save(&self, snapshot: &Snapshot) -> std::result::Result<(), StoreError> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
            self.inner.save(snapshot)
        }
        fn load(&self, user_id: UserId) -> std::result::Result<Option<Snapshot>, StoreError> {
            self.inner.load(user_id)
        }
        fn delete(&self, user_id: UserId) -> std::result::Result<(), StoreError> {
            self.inner.delete(user_id)
        }
        fn delete_if_older(
            &self,
            user_id: UserId,
            cutoff: SystemTime,
        ) -> std::result::Result<bool, StoreError> {
            self.inner.delete_if_older(user_id, cutoff)
        }
        fn list(&self) -> std::result::Result<crate::store::SnapshotIter, StoreError> {
            self.inner.list()
        }
    }

    /// Blocks forever while `block` is set, otherwise returns "summary".
    struct GateSummarizer {
        block: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Summarizer for GateSummarizer {
        async fn summarize(&self, _previous: &str, _old: &[Turn]) -> std::result::Result<String, SummarizerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.block.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok("summary".to_string())
        }
    }

    fn test_config(dir: &std::path::Path) -> MemoryConfig {
        MemoryConfig {
            snapshot_dir: dir.to_path_buf(),
            token_limit: 10,
            save_interval: 100,
            max_cached_users: 2,
            recent_window: 2,
            summarize_timeout_ms: 1_000,
            tokens_per_word: 1.0,
            ..MemoryConfig::default()
        }
    }

    fn quiet_summarizer() -> Arc<dyn Summarizer> {
        let mut mock = MockSummarizer::new();
        mock.expect_summarize().never();
        Arc::new(mock)
    }

    #[test]
    fn test_zero_capacity_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig {
            max_cached_users: 0,
            ..test_config(dir.path())
        };
        let store = Arc::new(FileSnapshotStore::open(dir.path()).unwrap());
        assert!(MemoryManager::new(config, store, quiet_summarizer()).is_err());
    }

    #[tokio::test]
    async fn test_summarizer_receives_old_turns_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileSnapshotStore::open(dir.path()).unwrap());
        let mut mock = MockSummarizer::new();
        mock.expect_summarize()
            .times(1)
            .withf(|previous, old| {
                previous.is_empty()
                    && old.len() == 2
                    && old[0] == Turn::user("a b c")
                    && old[1] == Turn::assistant("d e f")
            })
            .returning(|_, _| Ok("short".to_string()));
        let manager = MemoryManager::new(test_config(dir.path()), store, Arc::new(mock)).unwrap();

        manager.record_interaction(1, "a b c", "d e f").await;
        manager.record_interaction(1, "g h i", "j k l").await;

        let state = manager.get_or_create(1).await;
        assert_eq!(state.summary, "short");
        assert_eq!(state.turns, vec![Turn::user("g h i"), Turn::assistant("j k l")]);
        assert_eq!(manager.metrics().summarizations(), 1);
    }

    #[tokio::test]
    async fn test_failed_eviction_keeps_user_in_ram() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore {
            inner: FileSnapshotStore::open(dir.path()).unwrap(),
            fail_saves: AtomicBool::new(false),
        });
        let config = MemoryConfig {
            max_cached_users: 1,
            token_limit: 10_000,
            ..test_config(dir.path())
        };
        let manager = MemoryManager::new(config, store.clone(), quiet_summarizer()).unwrap();

        manager.record_interaction(1, "remember me", "sure").await;
        store.fail_saves.store(true, Ordering::SeqCst);
        manager.get_or_create(2).await;

        // over capacity rather than losing user 1
        let mut cached = manager.cached_users();
        cached.sort_unstable();
        assert_eq!(cached, vec![1, 2]);
        assert_eq!(manager.metrics().persist_failures(), 1);
        assert_eq!(manager.metrics().evictions(), 0);

        store.fail_saves.store(false, Ordering::SeqCst);
        manager.get_or_create(3).await;

        assert_eq!(manager.cached_users(), vec![3]);
        assert_eq!(manager.metrics().evictions(), 2);
        let on_disk = store.load(1).unwrap().unwrap();
        assert_eq!(on_disk.messages, vec![Turn::user("remember me"), Turn::assistant("sure")]);
    }

    #[tokio::test]
    async fn test_stats_does_not_touch_recency() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileSnapshotStore::open(dir.path()).unwrap());
        let manager = MemoryManager::new(test_config(dir.path()), store, quiet_summarizer()).unwrap();

        manager.record_interaction(1, "first", "user").await;
        manager.record_interaction(2, "second", "user").await;
        let stats = manager.stats().await;
        assert_eq!(stats.users_in_ram, 2);
        assert_eq!(stats.estimated_tokens, 4);
        assert_eq!(stats.estimated_ram_bytes, 16);
        assert_eq!(stats.cache_misses, 2);

        manager.get_or_create(3).await;
        assert_eq!(manager.cached_users(), vec![3, 2]);
    }

    #[tokio::test]
    async fn test_cancelled_summarization_leaves_state_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileSnapshotStore::open(dir.path()).unwrap());
        let summarizer = Arc::new(GateSummarizer {
            block: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        });
        let config = MemoryConfig {
            summarize_timeout_ms: 60_000,
            ..test_config(dir.path())
        };
        let manager = MemoryManager::new(config, store, summarizer.clone()).unwrap();

        manager.record_interaction(1, "a b c", "d e f").await;
        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            manager.record_interaction(1, "g h i", "j k l"),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);

        // the append committed, the summary swap never happened
        let state = manager.get_or_create(1).await;
        assert_eq!(state.turns.len(), 4);
        assert!(state.summary.is_empty());

        // the summarization flag was released by the dropped future
        summarizer.block.store(false, Ordering::SeqCst);
        manager.record_interaction(1, "m n o", "p q r").await;
        let state = manager.get_or_create(1).await;
        assert_eq!(state.summary, "summary");
        assert_eq!(state.turns.len(), 2);
    }

    /// Every character counts as one token.
    struct CharEstimator;

    impl TokenEstimator for CharEstimator {
        fn estimate(&self, text: &str) -> usize {
            text.chars().count()
        }
    }

    #[tokio::test]
    async fn test_custom_estimator_drives_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileSnapshotStore::open(dir.path()).unwrap());
        let mut mock = MockSummarizer::new();
        mock.expect_summarize()
            .times(1)
            .returning(|_, _| Ok("s".to_string()));
        let manager = MemoryManager::new(test_config(dir.path()), store, Arc::new(mock))
            .unwrap()
            .with_estimator(Arc::new(CharEstimator));

        // 2 words but 11 characters: only the char estimator is over budget
        manager.record_interaction(1, "abcdef", "ghijk").await;
        manager.record_interaction(1, "x", "y").await;

        let state = manager.get_or_create(1).await;
        assert_eq!(state.summary, "s");
        assert_eq!(state.turns, vec![Turn::user("x"), Turn::assistant("y")]);
        assert_eq!(manager.stats().await.estimated_tokens, 3);
    }

    #[tokio::test]
    async fn test_flush_all_skips_users_without_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileSnapshotStore::open(dir.path()).unwrap());
        let manager = MemoryManager::new(test_config(dir.path()), store.clone(), quiet_summarizer()).unwrap();

        manager.get_or_create(1).await;
        manager.record_interaction(2, "hi", "hello").await;

        assert_eq!(manager.flush_all().await, 1);
        assert!(store.load(1).unwrap().is_none());
        assert!(store.load(2).unwrap().is_some());
        assert_eq!(manager.flush_all().await, 1);
    }

    #[tokio::test]
    async fn test_clear_unknown_user_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileSnapshotStore::open(dir.path()).unwrap());
        let manager = MemoryManager::new(test_config(dir.path()), store.clone(), quiet_summarizer()).unwrap();

        manager.clear(404).await;

        assert!(manager.cached_users().is_empty());
        let listed: Vec<SnapshotMeta> = store.list().unwrap().collect();
        assert!(listed.is_empty());
    }
}
