use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::types::Check;

/// Identities of checks currently executing
#[derive(Debug, Default)]
pub struct InProgressChecks {
    ids: Mutex<HashSet<String>>,
}

impl InProgressChecks {
    pub fn contains(&self, id: &str) -> bool {
        self.ids.lock().contains(id)
    }

    pub fn remove(&self, id: &str) -> bool {
        self.ids.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Marks a check in progress for as long as it is alive
#[derive(Debug)]
pub struct InProgressGuard {
    id: String,
    tracker: Arc<InProgressChecks>,
}

impl InProgressGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        self.tracker.remove(&self.id);
    }
}

#[derive(Debug, Default)]
struct Pending {
    order: VecDeque<(String, Check)>,
    ids: HashSet<String>,
}

/// FIFO of checks waiting to run, unique by [`Check::unique_id`].
///
/// Lock order is always queue, then tracker.
#[derive(Debug)]
pub struct CheckQueue {
    pending: Mutex<Pending>,
    in_progress: Arc<InProgressChecks>,
}

impl CheckQueue {
    pub fn new(in_progress: Arc<InProgressChecks>) -> Self {
        Self { pending: Mutex::new(Pending::default()), in_progress }
    }

    pub fn in_progress(&self) -> &Arc<InProgressChecks> {
        &self.in_progress
    }

    /// Add checks that are neither queued nor running. Returns how many were added.
    pub fn enqueue_unique(&self, checks: Vec<Check>) -> usize {
        let mut pending = self.pending.lock();
        let running = self.in_progress.ids.lock();

        let mut added = 0;
        for check in checks {
            let id = check.unique_id();
            if running.contains(&id) {
                debug!("Check {} is in progress, not queueing it again", id);
                continue;
            }
            if !pending.ids.insert(id.clone()) {
                debug!("Check {} is already queued", id);
                continue;
            }
            pending.order.push_back((id, check));
            added += 1;
        }
        added
    }

    /// Pop the oldest check and mark it in progress in one step.
    pub fn take_next(&self) -> Option<(Check, InProgressGuard)> {
        let mut pending = self.pending.lock();
        let mut running = self.in_progress.ids.lock();

        while let Some((id, check)) = pending.order.pop_front() {
            pending.ids.remove(&id);
            if !running.insert(id.clone()) {
                debug!("Skipping check {}, it is already in progress", id);
                continue;
            }
            let guard = InProgressGuard { id, tracker: self.in_progress.clone() };
            return Some((check, guard));
        }
        None
    }

    pub fn len(&self) -> usize {
        self.pending.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::types::{ServiceCheck, ServiceCheckData};

    fn check(uuid: &str) -> Check {
        Check::Service(ServiceCheck {
            uuid: uuid.into(),
            check: ServiceCheckData {
                connect: "10.0.0.1".into(),
                port: Some(22),
                protocol: "tcp".into(),
                service: String::new(),
            },
        })
    }

    fn queue() -> CheckQueue {
        CheckQueue::new(Arc::new(InProgressChecks::default()))
    }

    #[test]
    fn test_enqueue_drops_duplicates() {
        let q = queue();
        assert_eq!(q.enqueue_unique(vec![check("a"), check("b"), check("a")]), 2);
        assert_eq!(q.enqueue_unique(vec![check("b"), check("c")]), 1);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_take_next_is_fifo_and_marks_in_progress() {
        let q = queue();
        q.enqueue_unique(vec![check("a"), check("b")]);

        let (first, guard) = q.take_next().unwrap();
        assert_eq!(first.uuid(), "a");
        assert!(q.in_progress().contains(guard.id()));
        assert_eq!(q.len(), 1);

        // A running check cannot be queued again until its guard is gone
        assert_eq!(q.enqueue_unique(vec![check("a")]), 0);
        drop(guard);
        assert!(q.in_progress().is_empty());
        assert_eq!(q.enqueue_unique(vec![check("a")]), 1);
    }

    #[test]
    fn test_identity_never_in_both() {
        let q = queue();
        for round in 0..5 {
            q.enqueue_unique(vec![check("a"), check("b"), check("c")]);
            let taken: Vec<_> = std::iter::from_fn(|| q.take_next()).take(round % 3 + 1).collect();
            for (c, guard) in &taken {
                assert!(q.in_progress().contains(&c.unique_id()));
                assert_eq!(guard.id(), c.unique_id());
            }
            q.enqueue_unique(vec![check("a"), check("b"), check("c")]);
            let pending = q.pending.lock();
            for id in &pending.ids {
                assert!(!q.in_progress().contains(id));
            }
            assert_eq!(pending.ids.len(), pending.order.len());
        }
    }

    #[test]
    fn test_empty_queue() {
        let q = queue();
        assert!(q.take_next().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn test_concurrent_take_never_duplicates() {
        let q = Arc::new(queue());
        let checks: Vec<_> = (0..200).map(|i| check(&format!("c{i}"))).collect();
        q.enqueue_unique(checks);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let q = q.clone();
                std::thread::spawn(move || {
                    let mut held = Vec::new();
                    while let Some(taken) = q.take_next() {
                        held.push(taken);
                    }
                    held.into_iter().map(|(c, _guard)| c.unique_id()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "check handed out twice");
            }
        }
        assert_eq!(seen.len(), 200);
    }
}
