//! In-flight computation table and wait-for graph.
//!
//! At most one caller executes a given key at a time. Others block until
//! the owner finishes and then share its outcome. Every blocking edge is
//! recorded in a wait-for graph: `parent -> child` when a query computes a
//! child inline, `waiter -> awaited` when it waits on another caller. A new
//! edge that would close a loop is refused as a cycle instead of
//! deadlocking.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use tracing::debug;

use kiln_core::QueryKey;

use crate::cancel::CancelToken;
use crate::error::QueryError;

#[derive(Debug, Default)]
struct Slot {
    outcome: OnceLock<Result<(), QueryError>>,
    waiters: usize,
}

#[derive(Debug, Default)]
struct Table {
    running: HashMap<QueryKey, Slot>,
    /// Wait-for edges; duplicates allow several forked children of one key.
    blocked_on: HashMap<QueryKey, Vec<QueryKey>>,
}

impl Table {
    /// Path `from -> .. -> to` through the wait-for graph, if any.
    fn path(&self, from: &QueryKey, to: &QueryKey) -> Option<Vec<QueryKey>> {
        let mut stack: Vec<Vec<QueryKey>> = vec![vec![from.clone()]];
        let mut seen: Vec<&QueryKey> = Vec::new();
        while let Some(path) = stack.pop() {
            let last = path.last()?;
            if last == to {
                return Some(path);
            }
            if seen.contains(&last) {
                continue;
            }
            let Some((seen_key, next)) = self.blocked_on.get_key_value(last) else {
                continue;
            };
            seen.push(seen_key);
            for child in next {
                let mut extended = path.clone();
                extended.push(child.clone());
                stack.push(extended);
            }
        }
        None
    }

    fn add_edge(&mut self, from: &QueryKey, to: &QueryKey) {
        self.blocked_on
            .entry(from.clone())
            .or_default()
            .push(to.clone());
    }

    fn remove_edge(&mut self, from: &QueryKey, to: &QueryKey) {
        if let Some(edges) = self.blocked_on.get_mut(from) {
            if let Some(pos) = edges.iter().position(|k| k == to) {
                edges.swap_remove(pos);
            }
            if edges.is_empty() {
                self.blocked_on.remove(from);
            }
        }
    }

    /// Refuses `parent -> key` if `key` already reaches `parent`.
    fn check_cycle(&self, parent: Option<&QueryKey>, key: &QueryKey) -> Result<(), QueryError> {
        let Some(parent) = parent else {
            return Ok(());
        };
        match self.path(key, parent) {
            Some(mut path) => {
                path.push(key.clone());
                Err(QueryError::Cycle {
                    key: key.clone(),
                    path,
                })
            }
            None => Ok(()),
        }
    }
}

pub(crate) enum Claim<'a> {
    /// The caller owns the computation and must complete the guard.
    Owner(SlotGuard<'a>),
    /// Another caller computed the key; this is its outcome.
    Shared(Result<(), QueryError>),
}

#[derive(Debug, Default)]
pub(crate) struct InFlight {
    table: Mutex<Table>,
    finished: Condvar,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claims `key` on behalf of `parent` (the enclosing query, if any),
    /// blocking while another caller holds it.
    pub(crate) fn claim(
        &self,
        key: &QueryKey,
        parent: Option<&QueryKey>,
        cancel: &CancelToken,
        poll: Duration,
    ) -> Result<Claim<'_>, QueryError> {
        let mut table = self.lock();
        table.check_cycle(parent, key)?;

        if !table.running.contains_key(key) {
            table.running.insert(key.clone(), Slot::default());
            if let Some(parent) = parent {
                table.add_edge(parent, key);
            }
            return Ok(Claim::Owner(SlotGuard {
                inflight: self,
                key: key.clone(),
                parent: parent.cloned(),
                done: false,
            }));
        }

        debug!(query = %key, "waiting on in-flight computation");
        if let Some(parent) = parent {
            table.add_edge(parent, key);
        }
        if let Some(slot) = table.running.get_mut(key) {
            slot.waiters += 1;
        }

        let result = loop {
            let Some(slot) = table.running.get(key) else {
                // Completed slots are only removed once their last waiter
                // has left, so this cannot happen.
                break Err(QueryError::msg("in-flight slot vanished"));
            };
            if let Some(outcome) = slot.outcome.get() {
                break Ok(outcome.clone());
            }
            if cancel.is_cancelled() {
                break Err(QueryError::Cancelled);
            }
            table = self
                .finished
                .wait_timeout(table, poll)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        };

        if let Some(parent) = parent {
            table.remove_edge(parent, key);
        }
        let release = match table.running.get_mut(key) {
            Some(slot) => {
                slot.waiters -= 1;
                slot.waiters == 0 && slot.outcome.get().is_some()
            }
            None => false,
        };
        if release {
            table.running.remove(key);
        }
        result.map(Claim::Shared)
    }

    /// True if anyone is blocked on a computation of one of `keys`.
    pub(crate) fn has_waiters(&self, keys: &[QueryKey]) -> bool {
        let table = self.lock();
        keys.iter()
            .any(|k| table.running.get(k).is_some_and(|slot| slot.waiters > 0))
    }

    pub(crate) fn running(&self) -> usize {
        self.lock()
            .running
            .values()
            .filter(|slot| slot.outcome.get().is_none())
            .count()
    }

    fn complete(&self, key: &QueryKey, parent: Option<&QueryKey>, outcome: Result<(), QueryError>) {
        let mut table = self.lock();
        if let Some(parent) = parent {
            table.remove_edge(parent, key);
        }
        table.blocked_on.remove(key);
        let release = match table.running.get_mut(key) {
            Some(slot) => {
                let _ = slot.outcome.set(outcome);
                slot.waiters == 0
            }
            None => false,
        };
        if release {
            table.running.remove(key);
        }
        drop(table);
        self.finished.notify_all();
    }
}

/// Ownership of one in-flight key. Dropping an uncompleted guard (the
/// compute function panicked) releases waiters with a failure.
pub(crate) struct SlotGuard<'a> {
    inflight: &'a InFlight,
    key: QueryKey,
    parent: Option<QueryKey>,
    done: bool,
}

impl SlotGuard<'_> {
    pub(crate) fn complete(mut self, outcome: Result<(), QueryError>) {
        self.done = true;
        self.inflight
            .complete(&self.key, self.parent.as_ref(), outcome);
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            let failure = QueryError::msg("compute function panicked").attributed_to(&self.key);
            self.inflight
                .complete(&self.key, self.parent.as_ref(), Err(failure));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    const POLL: Duration = Duration::from_millis(5);

    fn q(name: &str) -> QueryKey {
        QueryKey::unit(name).unwrap()
    }

    fn owner<'a>(inflight: &'a InFlight, key: &QueryKey, parent: Option<&QueryKey>) -> SlotGuard<'a> {
        match inflight.claim(key, parent, &CancelToken::new(), POLL) {
            Ok(Claim::Owner(guard)) => guard,
            Ok(Claim::Shared(_)) => panic!("expected ownership of {key}"),
            Err(e) => panic!("claim failed: {e}"),
        }
    }

    #[test]
    fn self_request_is_a_cycle() {
        let inflight = InFlight::new();
        let _a = owner(&inflight, &q("a"), None);
        let err = inflight
            .claim(&q("a"), Some(&q("a")), &CancelToken::new(), POLL)
            .err()
            .unwrap();
        match err {
            QueryError::Cycle { key, path } => {
                assert_eq!(key, q("a"));
                assert_eq!(path, vec![q("a"), q("a")]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn indirect_cycle_is_detected() {
        let inflight = InFlight::new();
        let _a = owner(&inflight, &q("a"), None);
        let _b = owner(&inflight, &q("b"), Some(&q("a")));
        let _c = owner(&inflight, &q("c"), Some(&q("b")));
        let err = inflight
            .claim(&q("a"), Some(&q("c")), &CancelToken::new(), POLL)
            .err()
            .unwrap();
        match err {
            QueryError::Cycle { path, .. } => {
                assert_eq!(path, vec![q("a"), q("b"), q("c"), q("a")]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn waiter_receives_owner_outcome() {
        let inflight = InFlight::new();
        let guard = owner(&inflight, &q("slow"), None);
        let (tx, rx) = mpsc::channel();

        thread::scope(|s| {
            s.spawn(|| {
                let claim = inflight.claim(&q("slow"), None, &CancelToken::new(), POLL);
                let shared = match claim {
                    Ok(Claim::Shared(outcome)) => outcome,
                    _ => panic!("expected shared outcome"),
                };
                tx.send(shared.is_err()).unwrap();
            });
            while !inflight.has_waiters(&[q("slow")]) {
                thread::sleep(POLL);
            }
            guard.complete(Err(QueryError::msg("boom")));
        });
        assert!(rx.recv().unwrap());
        assert_eq!(inflight.running(), 0);
        // The slot was released; the key can be claimed again.
        let _again = owner(&inflight, &q("slow"), None);
    }

    #[test]
    fn cancelled_waiter_stops_waiting() {
        let inflight = InFlight::new();
        let _guard = owner(&inflight, &q("slow"), None);
        let token = CancelToken::new();
        token.cancel();
        let err = inflight
            .claim(&q("slow"), None, &token, POLL)
            .err()
            .unwrap();
        assert!(err.is_cancelled());
        assert!(!inflight.has_waiters(&[q("slow")]));
    }

    #[test]
    fn dropped_guard_fails_waiters() {
        let inflight = InFlight::new();
        let guard = owner(&inflight, &q("panicky"), None);
        thread::scope(|s| {
            let waiter = s.spawn(|| inflight.claim(&q("panicky"), None, &CancelToken::new(), POLL));
            while !inflight.has_waiters(&[q("panicky")]) {
                thread::sleep(POLL);
            }
            drop(guard);
            match waiter.join().unwrap() {
                Ok(Claim::Shared(Err(QueryError::Compute { key, .. }))) => {
                    assert_eq!(key, Some(q("panicky")));
                }
                _ => panic!("expected a compute failure"),
            }
        });
    }
}
