//! Deduplicating, delay-capable work queue
//!
//! - An item added while already pending is not queued twice.
//! - An item added while a worker holds it is parked and becomes available
//!   again only after [`WorkQueue::done`], so no two workers ever process the
//!   same item concurrently.
//! - [`WorkQueue::add_after`] schedules future availability; repeated delayed
//!   adds keep the earliest deadline.
//! - [`WorkQueue::shut_down`] wakes every blocked [`WorkQueue::get`] caller,
//!   which then returns `None`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

struct State<T> {
    queue: VecDeque<T>,
    /// Items waiting to be processed, queued or parked behind an in-flight copy
    dirty: HashSet<T>,
    processing: HashSet<T>,
    /// Earliest pending deadline per delayed item
    waiting: HashMap<T, Instant>,
    shutting_down: bool,
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    available: Notify,
}

impl<T> Inner<T> {
    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Cloneable handle; all clones share one queue
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Display + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    shutting_down: false,
                }),
                available: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark `item` as needing processing
    pub fn add(&self, item: T) {
        Self::add_inner(&self.inner, item);
    }

    fn add_inner(inner: &Inner<T>, item: T) {
        let mut state = inner.state();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        inner.available.notify_one();
    }

    /// Make `item` available once `delay` has elapsed
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let deadline = Instant::now() + delay;
        {
            let mut state = self.inner.state();
            if state.shutting_down {
                return;
            }
            match state.waiting.get(&item) {
                Some(existing) if *existing <= deadline => return,
                _ => {
                    state.waiting.insert(item.clone(), deadline);
                }
            }
        }

        debug!(
            "{}: scheduling {} in {:?}",
            self.inner.name, item, delay
        );
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let due = {
                let mut state = inner.state();
                if state.waiting.get(&item) == Some(&deadline) {
                    state.waiting.remove(&item);
                    true
                } else {
                    false
                }
            };
            if due {
                Self::add_inner(&inner, item);
            }
        });
    }

    /// Wait for the next item and mark it in flight.
    /// Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.available.notified();
            {
                let mut state = self.inner.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Release an item obtained from [`get`](Self::get)
    pub fn done(&self, item: &T) {
        let mut state = self.inner.state();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.available.notify_one();
        }
    }

    pub fn shut_down(&self) {
        {
            let mut state = self.inner.state();
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.inner.available.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state().shutting_down
    }

    /// Items ready for processing
    pub fn len(&self) -> usize {
        self.inner.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_deduplicates_pending_items() {
        let q = WorkQueue::new("test");
        q.add("a".to_string());
        q.add("a".to_string());
        q.add("b".to_string());
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_readd_while_processing_yields_exactly_one_more() {
        let q = WorkQueue::new("test");
        q.add("a".to_string());
        let item = q.get().await.unwrap();

        // concurrent signals while in flight
        q.add("a".to_string());
        q.add("a".to_string());
        q.add("a".to_string());
        assert!(q.is_empty(), "in-flight item must not be handed out again");

        q.done(&item);
        assert_eq!(q.len(), 1);
        let again = q.get().await.unwrap();
        q.done(&again);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_done_without_readd_does_not_requeue() {
        let q = WorkQueue::new("test");
        q.add("a".to_string());
        let item = q.get().await.unwrap();
        q.done(&item);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_add_after_delays_availability() {
        let q = WorkQueue::new("test");
        q.add_after("a".to_string(), Duration::from_millis(50));
        assert!(q.is_empty());

        let got = tokio::time::timeout(Duration::from_secs(2), q.get())
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_add_after_keeps_earliest_deadline() {
        let q = WorkQueue::new("test");
        q.add_after("a".to_string(), Duration::from_secs(30));
        q.add_after("a".to_string(), Duration::from_millis(20));

        let got = tokio::time::timeout(Duration::from_secs(2), q.get())
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_shut_down_releases_blocked_getters() {
        let q: WorkQueue<String> = WorkQueue::new("test");
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();

        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
        q.add("late".to_string());
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_blocked_getter_wakes_on_add() {
        let q: WorkQueue<String> = WorkQueue::new("test");
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add("a".to_string());

        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.as_deref(), Some("a"));
    }
}
