use dashmap::DashSet;

use crate::story::StoryKey;

/// Global in-flight set keyed by story identity (spec §4.6).
///
/// Backed by [`dashmap::DashSet`] — the same sharded-lock concurrent
/// collection `ferrex-server` reaches for wherever multiple tasks need
/// lock-free-ish shared mutable state (e.g. its connection/session maps).
/// No iteration guarantees are provided, matching the contract.
#[derive(Debug, Default)]
pub struct ActiveSet {
    inner: DashSet<StoryKey>,
}

/// Outcome of [`ActiveSet::try_insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

impl ActiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to mark `key` as in-flight. Returns
    /// [`InsertOutcome::AlreadyPresent`] without mutating state if it already
    /// is.
    pub fn try_insert(&self, key: StoryKey) -> InsertOutcome {
        if self.inner.insert(key) {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::AlreadyPresent
        }
    }

    pub fn contains(&self, key: &StoryKey) -> bool {
        self.inner.contains(key)
    }

    pub fn remove(&self, key: &StoryKey) {
        self.inner.remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::Story;

    fn key(url: &str) -> StoryKey {
        StoryKey::from(&Story::new(url.into(), "site".into()))
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let set = ActiveSet::new();
        assert_eq!(set.try_insert(key("https://a/1")), InsertOutcome::Inserted);
        assert_eq!(
            set.try_insert(key("https://a/1")),
            InsertOutcome::AlreadyPresent
        );
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn remove_allows_reinsertion() {
        let set = ActiveSet::new();
        let k = key("https://a/1");
        set.try_insert(k.clone());
        set.remove(&k);
        assert_eq!(set.try_insert(k), InsertOutcome::Inserted);
    }

    #[test]
    fn concurrent_inserts_see_exactly_one_winner() {
        use std::sync::Arc;
        use std::thread;

        let set = Arc::new(ActiveSet::new());
        let k = key("https://a/1");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let set = set.clone();
                let k = k.clone();
                thread::spawn(move || set.try_insert(k))
            })
            .collect();
        let inserted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| *o == InsertOutcome::Inserted)
            .count();
        assert_eq!(inserted, 1);
    }
}
