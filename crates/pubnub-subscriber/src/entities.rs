//! The shared set of subscribed channels and channel groups.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

use crate::types::SubscriptionEntry;

/// Ordered, deduplicated collection of subscription entries, shared between
/// caller threads (writers) and the engine loop (reader).
///
/// Every mutation, including one that leaves the set unchanged, bumps the
/// change version and wakes the engine, so that flag or interval changes
/// take effect on the next poll cycle at latest. Snapshots are taken under
/// the lock and never observe a half-applied batch.
pub(crate) struct EntitySet {
    entries: Mutex<Vec<SubscriptionEntry>>,
    version: AtomicU64,
    /// Bumped on adds only. A stopped engine restarts on a subscribe, not
    /// on an unsubscribe, and the two are told apart by this counter.
    add_version: AtomicU64,
    changed: Notify,
}

impl Default for EntitySet {
    fn default() -> Self {
        Self::new()
    }
}

impl EntitySet {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            version: AtomicU64::new(0),
            add_version: AtomicU64::new(0),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SubscriptionEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add entries. Re-adding an existing `(name, kind)` updates its
    /// presence flag in place; either way the engine is signalled.
    pub fn add(&self, new_entries: impl IntoIterator<Item = SubscriptionEntry>) {
        {
            let mut entries = self.lock();
            for entry in new_entries {
                match entries
                    .iter_mut()
                    .find(|e| e.name == entry.name && e.kind == entry.kind)
                {
                    Some(existing) => existing.with_presence = entry.with_presence,
                    None => entries.push(entry),
                }
            }
            self.version.fetch_add(1, Ordering::AcqRel);
            self.add_version.fetch_add(1, Ordering::AcqRel);
        }
        self.changed.notify_waiters();
    }

    /// Remove entries by `(name, kind)`. Removing an absent entry is a
    /// no-op that still signals the engine.
    pub fn remove(&self, gone: impl IntoIterator<Item = SubscriptionEntry>) {
        {
            let mut entries = self.lock();
            for entry in gone {
                entries.retain(|e| !(e.name == entry.name && e.kind == entry.kind));
            }
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        self.changed.notify_waiters();
    }

    pub fn clear(&self) {
        {
            let mut entries = self.lock();
            entries.clear();
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        self.changed.notify_waiters();
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Atomic snapshot plus the version it corresponds to.
    pub fn snapshot(&self) -> (Vec<SubscriptionEntry>, u64) {
        let entries = self.lock();
        let version = self.version.load(Ordering::Acquire);
        (entries.clone(), version)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn add_version(&self) -> u64 {
        self.add_version.load(Ordering::Acquire)
    }

    /// Resolve once the set has changed relative to `since`. Registers for
    /// notification before re-checking the version, so a concurrent
    /// mutation is never lost.
    pub async fn changed(&self, since: u64) {
        loop {
            let notified = self.changed.notified();
            if self.version.load(Ordering::Acquire) != since {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityKind;

    fn names(set: &EntitySet) -> Vec<String> {
        set.snapshot().0.into_iter().map(|e| e.name).collect()
    }

    #[test]
    fn add_preserves_order_and_dedupes() {
        let set = EntitySet::new();
        set.add([
            SubscriptionEntry::channel("a"),
            SubscriptionEntry::channel("b"),
        ]);
        set.add([
            SubscriptionEntry::channel("a"),
            SubscriptionEntry::channel("c"),
        ]);
        assert_eq!(names(&set), vec!["a", "b", "c"]);
    }

    #[test]
    fn channel_and_group_with_same_name_are_distinct() {
        let set = EntitySet::new();
        set.add([
            SubscriptionEntry::channel("ops"),
            SubscriptionEntry::group("ops"),
        ]);
        let (snapshot, _) = set.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].kind, EntityKind::Channel);
        assert_eq!(snapshot[1].kind, EntityKind::Group);
    }

    #[test]
    fn re_add_updates_presence_flag_in_place() {
        let set = EntitySet::new();
        set.add([SubscriptionEntry::channel("chat")]);
        set.add([SubscriptionEntry::channel("chat").with_presence()]);
        let (snapshot, _) = set.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].with_presence);
    }

    #[test]
    fn noop_mutations_still_bump_version() {
        let set = EntitySet::new();
        set.add([SubscriptionEntry::channel("chat")]);
        let v1 = set.version();
        set.add([SubscriptionEntry::channel("chat")]);
        let v2 = set.version();
        assert_ne!(v1, v2);
        set.remove([SubscriptionEntry::channel("absent")]);
        assert_ne!(v2, set.version());
    }

    #[test]
    fn remove_matches_on_name_and_kind_only() {
        let set = EntitySet::new();
        set.add([SubscriptionEntry::channel("chat").with_presence()]);
        // Remove with a different presence flag still matches.
        set.remove([SubscriptionEntry::channel("chat")]);
        assert!(set.is_empty());
    }

    #[test]
    fn snapshots_never_observe_partial_batches() {
        use std::sync::Arc;

        let set = Arc::new(EntitySet::new());
        let batch: Vec<_> = (0..10)
            .map(|i| SubscriptionEntry::channel(format!("ch-{i}")))
            .collect();

        let writer = {
            let set = set.clone();
            let batch = batch.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    set.add(batch.clone());
                    set.remove(batch.clone());
                }
            })
        };

        for _ in 0..2000 {
            let (snapshot, _) = set.snapshot();
            assert!(
                snapshot.is_empty() || snapshot.len() == batch.len(),
                "observed half-applied batch of {} entries",
                snapshot.len()
            );
        }
        writer.join().unwrap();
    }

    #[tokio::test]
    async fn changed_wakes_on_mutation() {
        use std::sync::Arc;

        let set = Arc::new(EntitySet::new());
        let seen = set.version();
        let waiter = {
            let set = set.clone();
            tokio::spawn(async move { set.changed(seen).await })
        };
        set.add([SubscriptionEntry::channel("chat")]);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("changed() did not wake")
            .unwrap();
    }

    #[tokio::test]
    async fn changed_returns_immediately_when_already_stale() {
        let set = EntitySet::new();
        let seen = set.version();
        set.clear();
        // Mutation happened before the wait started; must not hang.
        tokio::time::timeout(std::time::Duration::from_secs(1), set.changed(seen))
            .await
            .expect("changed() missed a pre-wait mutation");
    }
}
