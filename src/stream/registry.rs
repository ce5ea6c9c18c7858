//! Viewer session registry.
//!
//! The only state shared between the producer (`push_frame`) and a
//! distributor's server thread. Every operation is a short critical section
//! over the session list; delivery and teardown of sinks happen on the
//! `Arc` handles returned out of the lock, never while holding it. A push
//! that races a detach either sees the session in its snapshot (and the
//! `Arc` keeps the sink alive until the push is done) or does not see it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type ViewerId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Registered, transport still being set up. Not yet fed frames.
    Constructing,
    Ready,
    TornDown,
}

/// Outcome of handing one item to one viewer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// The viewer is alive but could not take the item right now.
    Backpressure,
    /// The viewer is gone; its session should be detached.
    Closed,
}

/// Per-connection injection point.
pub trait ViewerSink: Send + Sync {
    type Item: ?Sized;

    /// Non-blocking hand-off.
    fn deliver(&self, item: &Self::Item) -> Delivery;

    /// Release transport resources. Called once, outside the registry lock.
    fn close(&self) {}
}

/// Counts from one fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub accepted: usize,
    pub backpressure: usize,
    pub closed: usize,
}

struct Session<S> {
    id: ViewerId,
    state: SessionState,
    sink: Arc<S>,
}

struct Sessions<S> {
    next_id: ViewerId,
    entries: Vec<Session<S>>,
}

pub struct ViewerRegistry<S> {
    inner: Mutex<Sessions<S>>,
}

impl<S: ViewerSink> ViewerRegistry<S> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Sessions {
                next_id: 1,
                entries: Vec::new(),
            }),
        }
    }

    /// A poisoned lock only means another thread panicked mid-mutation of a
    /// plain Vec; the list itself is still usable.
    fn lock(&self) -> MutexGuard<'_, Sessions<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session in the `Constructing` state.
    pub fn attach(&self, sink: Arc<S>) -> ViewerId {
        let mut sessions = self.lock();
        let id = sessions.next_id;
        sessions.next_id += 1;
        sessions.entries.push(Session {
            id,
            state: SessionState::Constructing,
            sink,
        });
        id
    }

    /// Move a session to `Ready`. False when the id is unknown.
    pub fn mark_ready(&self, id: ViewerId) -> bool {
        let mut sessions = self.lock();
        match sessions.entries.iter_mut().find(|s| s.id == id) {
            Some(session) => {
                session.state = SessionState::Ready;
                true
            }
            None => false,
        }
    }

    /// Remove a session and close its sink; `state` reports it as `TornDown`
    /// from here on. Returns false when the id was already gone.
    pub fn detach(&self, id: ViewerId) -> bool {
        let removed = {
            let mut sessions = self.lock();
            let idx = sessions.entries.iter().position(|s| s.id == id);
            idx.map(|idx| sessions.entries.remove(idx))
        };
        match removed {
            Some(session) => {
                session.sink.close();
                true
            }
            None => false,
        }
    }

    /// Remove and close every session. Returns how many were attached.
    pub fn detach_all(&self) -> usize {
        let drained: Vec<Session<S>> = {
            let mut sessions = self.lock();
            sessions.entries.drain(..).collect()
        };
        for session in &drained {
            session.sink.close();
        }
        drained.len()
    }

    /// Sinks of all `Ready` sessions at this instant.
    pub fn snapshot_ready(&self) -> Vec<(ViewerId, Arc<S>)> {
        self.lock()
            .entries
            .iter()
            .filter(|s| s.state == SessionState::Ready)
            .map(|s| (s.id, Arc::clone(&s.sink)))
            .collect()
    }

    /// `TornDown` for an id this registry issued and has since detached,
    /// `None` for an id it never issued.
    pub fn state(&self, id: ViewerId) -> Option<SessionState> {
        let sessions = self.lock();
        match sessions.entries.iter().find(|s| s.id == id) {
            Some(session) => Some(session.state),
            None if id > 0 && id < sessions.next_id => Some(SessionState::TornDown),
            None => None,
        }
    }

    pub fn ready_count(&self) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|s| s.state == SessionState::Ready)
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand `item` to every ready viewer, detaching the ones that report
    /// `Closed`.
    pub fn deliver_all(&self, item: &S::Item) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for (id, sink) in self.snapshot_ready() {
            match sink.deliver(item) {
                Delivery::Accepted => report.accepted += 1,
                Delivery::Backpressure => report.backpressure += 1,
                Delivery::Closed => {
                    report.closed += 1;
                    self.detach(id);
                }
            }
        }
        report
    }
}

impl<S: ViewerSink> Default for ViewerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    struct CountingSink {
        received: AtomicUsize,
        full: AtomicBool,
        gone: AtomicBool,
        closed: AtomicBool,
    }

    impl CountingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: AtomicUsize::new(0),
                full: AtomicBool::new(false),
                gone: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            })
        }
    }

    impl ViewerSink for CountingSink {
        type Item = u32;

        fn deliver(&self, _item: &u32) -> Delivery {
            if self.gone.load(Ordering::SeqCst) {
                return Delivery::Closed;
            }
            if self.full.load(Ordering::SeqCst) {
                return Delivery::Backpressure;
            }
            self.received.fetch_add(1, Ordering::SeqCst);
            Delivery::Accepted
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn constructing_sessions_are_not_fed() {
        let registry = ViewerRegistry::new();
        let sink = CountingSink::new();
        let id = registry.attach(sink.clone());
        assert_eq!(registry.state(id), Some(SessionState::Constructing));
        assert_eq!(registry.deliver_all(&1).accepted, 0);

        assert!(registry.mark_ready(id));
        assert_eq!(registry.deliver_all(&2).accepted, 1);
        assert_eq!(sink.received.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closed_viewers_are_detached_and_closed() {
        let registry = ViewerRegistry::new();
        let healthy = CountingSink::new();
        let gone = CountingSink::new();
        let slow = CountingSink::new();
        for sink in [&healthy, &gone, &slow] {
            let id = registry.attach(Arc::clone(sink));
            registry.mark_ready(id);
        }
        gone.gone.store(true, Ordering::SeqCst);
        slow.full.store(true, Ordering::SeqCst);

        let report = registry.deliver_all(&7);
        assert_eq!(
            report,
            DeliveryReport {
                accepted: 1,
                backpressure: 1,
                closed: 1
            }
        );
        assert_eq!(registry.len(), 2);
        assert!(gone.closed.load(Ordering::SeqCst));
        assert!(!slow.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn detach_is_idempotent_and_detach_all_empties() {
        let registry = ViewerRegistry::new();
        let a = registry.attach(CountingSink::new());
        registry.attach(CountingSink::new());
        assert!(registry.detach(a));
        assert_eq!(registry.state(a), Some(SessionState::TornDown));
        assert!(!registry.detach(a));
        assert!(!registry.mark_ready(a));
        assert_eq!(registry.detach_all(), 1);
        assert!(registry.is_empty());
        assert_eq!(registry.state(a + 1), Some(SessionState::TornDown));
        assert_eq!(registry.state(a + 100), None);
    }

    #[test]
    fn one_item_reaches_every_ready_viewer() {
        let registry = ViewerRegistry::new();
        let sinks = [CountingSink::new(), CountingSink::new(), CountingSink::new()];
        for sink in &sinks {
            let id = registry.attach(Arc::clone(sink));
            registry.mark_ready(id);
        }
        for item in 0..4 {
            assert_eq!(registry.deliver_all(&item).accepted, 3);
        }
        for sink in &sinks {
            assert_eq!(sink.received.load(Ordering::SeqCst), 4);
        }
    }

    #[test]
    fn concurrent_attach_detach_and_push_stay_consistent() {
        let registry = Arc::new(ViewerRegistry::<CountingSink>::new());
        let mut workers = Vec::new();
        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            workers.push(thread::spawn(move || {
                for _ in 0..200 {
                    let id = registry.attach(CountingSink::new());
                    registry.mark_ready(id);
                    registry.deliver_all(&0);
                    registry.detach(id);
                }
            }));
        }
        for _ in 0..500 {
            registry.deliver_all(&1);
        }
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
