//! Ordered listener registration with snapshot traversal.
//!
//! Listeners are compared by identity (the address of the shared value),
//! so the same `Arc` can be attached only once. While a traversal is open,
//! attach, detach and clear are queued and applied when the outermost
//! traversal ends, which lets a listener detach itself mid-dispatch.

use std::sync::Arc;

enum Pending<T: ?Sized> {
    Attach(Arc<T>),
    Detach(Arc<T>),
    Clear,
}

/// FIFO set of shared listeners.
pub struct ListenerSet<T: ?Sized> {
    listeners: Vec<Arc<T>>,
    pending: Vec<Pending<T>>,
    traversing: usize,
}

impl<T: ?Sized> Default for ListenerSet<T> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
            pending: Vec::new(),
            traversing: 0,
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.listeners.len())
            .field("pending", &self.pending.len())
            .field("traversing", &self.traversing)
            .finish()
    }
}

fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl<T: ?Sized> ListenerSet<T> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `listener` unless it is already registered.
    pub fn attach(&mut self, listener: Arc<T>) {
        if self.traversing > 0 {
            self.pending.push(Pending::Attach(listener));
        } else {
            self.attach_now(listener);
        }
    }

    /// Remove `listener` if registered.
    pub fn detach(&mut self, listener: &Arc<T>) {
        if self.traversing > 0 {
            self.pending.push(Pending::Detach(Arc::clone(listener)));
        } else {
            self.detach_now(listener);
        }
    }

    /// Remove all listeners.
    pub fn clear(&mut self) {
        if self.traversing > 0 {
            self.pending.push(Pending::Clear);
        } else {
            self.listeners.clear();
        }
    }

    /// Whether `listener` is currently registered.
    #[must_use]
    pub fn contains(&self, listener: &Arc<T>) -> bool {
        self.listeners.iter().any(|l| same(l, listener))
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Whether no listeners are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Open a traversal and return the listeners in registration order.
    ///
    /// Every call must be paired with [`end_traversing`](Self::end_traversing).
    pub fn begin_traversing(&mut self) -> Vec<Arc<T>> {
        self.traversing += 1;
        self.listeners.clone()
    }

    /// Close a traversal, applying queued changes once none remain open.
    pub fn end_traversing(&mut self) {
        self.traversing = self.traversing.saturating_sub(1);
        if self.traversing > 0 {
            return;
        }
        for change in std::mem::take(&mut self.pending) {
            match change {
                Pending::Attach(listener) => self.attach_now(listener),
                Pending::Detach(listener) => self.detach_now(&listener),
                Pending::Clear => self.listeners.clear(),
            }
        }
    }

    fn attach_now(&mut self, listener: Arc<T>) {
        if !self.contains(&listener) {
            self.listeners.push(listener);
        }
    }

    fn detach_now(&mut self, listener: &Arc<T>) {
        self.listeners.retain(|l| !same(l, listener));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Named: Send + Sync {
        fn name(&self) -> &str;
    }

    struct Listener(&'static str);

    impl Named for Listener {
        fn name(&self) -> &str {
            self.0
        }
    }

    fn names(set: &mut ListenerSet<dyn Named>) -> Vec<String> {
        let snapshot = set.begin_traversing();
        let names = snapshot.iter().map(|l| l.name().to_string()).collect();
        set.end_traversing();
        names
    }

    #[test]
    fn test_attach_keeps_order_and_identity() {
        let mut set: ListenerSet<dyn Named> = ListenerSet::new();
        let a: Arc<dyn Named> = Arc::new(Listener("a"));
        let b: Arc<dyn Named> = Arc::new(Listener("b"));
        set.attach(Arc::clone(&a));
        set.attach(Arc::clone(&b));
        set.attach(Arc::clone(&a));

        assert_eq!(set.len(), 2);
        assert_eq!(names(&mut set), ["a", "b"]);

        // Equal contents, different identity.
        let a2: Arc<dyn Named> = Arc::new(Listener("a"));
        assert!(!set.contains(&a2));
        set.detach(&a2);
        assert_eq!(set.len(), 2);

        set.detach(&a);
        assert_eq!(names(&mut set), ["b"]);
    }

    #[test]
    fn test_changes_during_traversal_are_deferred() {
        let mut set: ListenerSet<dyn Named> = ListenerSet::new();
        let a: Arc<dyn Named> = Arc::new(Listener("a"));
        let b: Arc<dyn Named> = Arc::new(Listener("b"));
        let c: Arc<dyn Named> = Arc::new(Listener("c"));
        set.attach(Arc::clone(&a));
        set.attach(Arc::clone(&b));

        let snapshot = set.begin_traversing();
        set.detach(&a);
        set.attach(Arc::clone(&c));
        assert_eq!(set.len(), 2);
        assert_eq!(snapshot.len(), 2);

        // Nested traversal sees the same live set.
        let inner = set.begin_traversing();
        assert_eq!(inner.len(), 2);
        set.end_traversing();
        assert!(set.contains(&a));

        set.end_traversing();
        assert_eq!(names(&mut set), ["b", "c"]);
    }

    #[test]
    fn test_clear_during_traversal() {
        let mut set: ListenerSet<dyn Named> = ListenerSet::new();
        set.attach(Arc::new(Listener("a")));
        let _snapshot = set.begin_traversing();
        set.clear();
        set.attach(Arc::new(Listener("late")));
        assert_eq!(set.len(), 1);
        set.end_traversing();
        assert_eq!(names(&mut set), ["late"]);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Attach(usize),
            Detach(usize),
            Clear,
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0..4usize).prop_map(Op::Attach),
                (0..4usize).prop_map(Op::Detach),
                Just(Op::Clear),
            ]
        }

        fn apply(set: &mut ListenerSet<dyn Named>, pool: &[Arc<dyn Named>], ops: &[Op]) {
            for op in ops {
                match op {
                    Op::Attach(i) => set.attach(Arc::clone(&pool[*i])),
                    Op::Detach(i) => set.detach(&pool[*i]),
                    Op::Clear => set.clear(),
                }
            }
        }

        proptest! {
            /// Changes made during a traversal end up exactly as if made outside one.
            #[test]
            fn deferred_changes_match_immediate(ops in proptest::collection::vec(op(), 0..32)) {
                let pool: Vec<Arc<dyn Named>> = ["a", "b", "c", "d"]
                    .into_iter()
                    .map(|n| Arc::new(Listener(n)) as Arc<dyn Named>)
                    .collect();

                let mut immediate: ListenerSet<dyn Named> = ListenerSet::new();
                apply(&mut immediate, &pool, &ops);

                let mut deferred: ListenerSet<dyn Named> = ListenerSet::new();
                let _snapshot = deferred.begin_traversing();
                apply(&mut deferred, &pool, &ops);
                prop_assert!(deferred.is_empty());
                deferred.end_traversing();

                prop_assert_eq!(names(&mut immediate), names(&mut deferred));
            }
        }
    }
}
