use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Handle returned when registering a listener, used to remove it again.
pub type ListenerId = u64;

type Entries<L> = Arc<Vec<(ListenerId, Arc<L>)>>;

/// Copy-on-write list of listeners.
///
/// Notification iterates an immutable snapshot, so listeners may subscribe
/// or unsubscribe (even from inside a callback) without disturbing a
/// notification that is already running. Changes become visible to the next
/// notification.
pub struct ListenerSet<L: ?Sized> {
    next_id: AtomicU64,
    entries: Mutex<Entries<L>>,
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Arc::new(Vec::new())),
        }
    }

    pub fn add(&self, listener: Arc<L>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();
        let mut next = Vec::with_capacity(entries.len() + 1);
        next.extend(entries.iter().cloned());
        next.push((id, listener));
        *entries = Arc::new(next);
        id
    }

    /// Returns whether a listener with this id was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        if !entries.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        let next = entries
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        *entries = Arc::new(next);
        true
    }

    pub fn clear(&self) {
        *self.entries.lock() = Arc::new(Vec::new());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Entries<L> {
        Arc::clone(&self.entries.lock())
    }

    /// Calls `notify` for every listener registered at the time of the call.
    pub fn for_each(&self, mut notify: impl FnMut(&L)) {
        let snapshot = self.snapshot();
        for (_, listener) in snapshot.iter() {
            notify(listener);
        }
    }

    /// Stops at the first listener for which `claim` returns `true` and
    /// reports whether any did.
    pub fn any(&self, mut claim: impl FnMut(&L) -> bool) -> bool {
        let snapshot = self.snapshot();
        snapshot.iter().any(|(_, listener)| claim(listener))
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    trait Counter: Send + Sync {
        fn hit(&self);
    }

    #[derive(Default)]
    struct Hits(AtomicUsize);

    impl Counter for Hits {
        fn hit(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn add_and_remove_by_id() {
        let set: ListenerSet<dyn Counter> = ListenerSet::new();
        let hits = Arc::new(Hits::default());
        let id = set.add(hits.clone());
        set.for_each(|listener| listener.hit());
        assert!(set.remove(id));
        assert!(!set.remove(id));
        set.for_each(|listener| listener.hit());
        assert_eq!(hits.0.load(Ordering::Relaxed), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn changes_during_notification_apply_to_next_cycle() {
        let set: Arc<ListenerSet<dyn Counter>> = Arc::new(ListenerSet::new());
        let first = Arc::new(Hits::default());
        let late = Arc::new(Hits::default());
        set.add(first.clone());
        set.for_each(|listener| {
            listener.hit();
            set.add(late.clone());
        });
        assert_eq!(late.0.load(Ordering::Relaxed), 0);
        assert_eq!(set.len(), 2);
        set.for_each(|listener| listener.hit());
        assert_eq!(late.0.load(Ordering::Relaxed), 1);
        assert_eq!(first.0.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn any_short_circuits() {
        let set: ListenerSet<dyn Counter> = ListenerSet::new();
        let a = Arc::new(Hits::default());
        let b = Arc::new(Hits::default());
        set.add(a.clone());
        set.add(b.clone());
        let claimed = set.any(|listener| {
            listener.hit();
            true
        });
        assert!(claimed);
        assert_eq!(a.0.load(Ordering::Relaxed), 1);
        assert_eq!(b.0.load(Ordering::Relaxed), 0);
    }
}
