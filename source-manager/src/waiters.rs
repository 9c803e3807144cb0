//! One-shot waiters for "the next event matching X".
//!
//! A waiter is resolved by whichever comes first: a matching event or its
//! timeout. Both paths go through the same removal under the registry lock,
//! so exactly one of them wins and the entry is gone afterwards either way.

use anyhow::{anyhow, Result};
use sourcebus::{Event, SourceError};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Extra predicate applied after the source/type criteria.
pub type EventPredicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// What a waiter is waiting for. Every criterion given must match.
#[derive(Clone, Default)]
pub struct WaitOptions {
    pub source: Option<String>,
    pub event_type: Option<String>,
    /// `None` waits until matched
    pub timeout: Option<Duration>,
    pub filter: Option<EventPredicate>,
}

impl WaitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.source.as_deref().map_or(true, |s| s == event.source)
            && self.event_type.as_deref().map_or(true, |t| t == event.event_type)
            && self.filter.as_ref().map_or(true, |f| f(event))
    }
}

impl fmt::Debug for WaitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitOptions")
            .field("source", &self.source)
            .field("event_type", &self.event_type)
            .field("timeout", &self.timeout)
            .field("filter", &self.filter.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

struct Waiter {
    options: WaitOptions,
    tx: oneshot::Sender<Event>,
}

/// Pending waiters keyed by id.
#[derive(Default)]
pub struct WaiterRegistry {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, Waiter>>,
}

/// Removes its waiter when dropped, covering cancelled wait futures.
struct Registration<'a> {
    registry: &'a WaiterRegistry,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.cancel(self.id);
    }
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, options: WaitOptions) -> (u64, oneshot::Receiver<Event>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, Waiter { options, tx });
        (id, rx)
    }

    /// Resolves and removes every waiter the event matches.
    pub fn dispatch(&self, event: &Event) -> usize {
        let mut waiters = self.lock();
        let matched: Vec<u64> = waiters
            .iter()
            .filter(|(_, waiter)| waiter.options.matches(event))
            .map(|(id, _)| *id)
            .collect();

        let mut resolved = 0;
        for id in matched {
            if let Some(waiter) = waiters.remove(&id) {
                if waiter.tx.send(event.clone()).is_ok() {
                    resolved += 1;
                }
            }
        }
        resolved
    }

    /// Removes a waiter; returns false if it was already gone.
    pub fn cancel(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Waits for the first event matching `options`.
    pub async fn wait(&self, options: WaitOptions) -> Result<Event> {
        let timeout = options.timeout;
        let (id, mut rx) = self.register(options);
        let _registration = Registration { registry: self, id };

        match timeout {
            None => rx.await.map_err(|_| anyhow!("event bus shut down")),
            Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                Ok(result) => result.map_err(|_| anyhow!("event bus shut down")),
                Err(_) => {
                    if self.cancel(id) {
                        debug!(waiter_id = id, timeout_ms = limit.as_millis() as u64, "Wait timed out");
                        return Err(SourceError::WaitTimeout(limit).into());
                    }
                    // Matched between the timer firing and the cancel
                    rx.try_recv()
                        .map_err(|_| SourceError::WaitTimeout(limit).into())
                }
            },
        }
    }
}
