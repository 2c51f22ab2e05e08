//! Push-resolved waiters for values that show up asynchronously (tokens,
//! connection ids).
//!
//! Every mutation of a registry happens under one lock. Completions never run
//! under that lock: resolution hands back a [`Deferred`] batch that runs them
//! once the caller has released whatever it holds, so a completion may call
//! back into the registry (or into the component that triggered it).

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::debug;

use crate::error::WaitError;

pub type WaiterId = u64;

type Outcome<T> = Result<T, WaitError>;
type Callback<T> = Box<dyn FnOnce(Outcome<T>) + Send + 'static>;

enum Completion<T> {
    Channel(oneshot::Sender<Outcome<T>>),
    Callback(Callback<T>),
}

impl<T> Completion<T> {
    fn complete(self, outcome: Outcome<T>) {
        match self {
            Self::Channel(tx) => {
                let _ = tx.send(outcome);
            }
            Self::Callback(callback) => callback(outcome),
        }
    }
}

struct Waiter<T> {
    created_at: Instant,
    timeout: Duration,
    completion: Completion<T>,
    timer: Option<JoinHandle<()>>,
}

impl<T> Waiter<T> {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct RegistryCore<T> {
    value: Option<T>,
    waiters: HashMap<WaiterId, Waiter<T>>,
    next_id: WaiterId,
}

/// Completions collected under a lock, run after it is released.
///
/// Runs on [`Deferred::fire`] or, if the batch is simply dropped, on drop.
#[must_use = "completions run when the batch is fired or dropped"]
pub struct Deferred {
    completions: Vec<Box<dyn FnOnce() + Send + 'static>>,
}

impl Deferred {
    pub fn empty() -> Self {
        Self {
            completions: Vec::new(),
        }
    }

    fn with<T: Send + 'static>(waiters: Vec<Waiter<T>>, outcome: Outcome<T>) -> Self
    where
        T: Clone,
    {
        let completions = waiters
            .into_iter()
            .map(|waiter| {
                let outcome = outcome.clone();
                Box::new(move || waiter.completion.complete(outcome)) as Box<dyn FnOnce() + Send>
            })
            .collect();
        Self { completions }
    }

    pub fn len(&self) -> usize {
        self.completions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completions.is_empty()
    }

    pub fn merge(&mut self, mut other: Deferred) {
        self.completions.append(&mut other.completions);
    }

    pub fn fire(mut self) {
        self.run();
    }

    fn run(&mut self) {
        for completion in self.completions.drain(..) {
            completion();
        }
    }
}

impl Drop for Deferred {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("pending", &self.completions.len())
            .finish()
    }
}

pub struct WaiterRegistry<T> {
    name: &'static str,
    core: Arc<Mutex<RegistryCore<T>>>,
}

impl<T> Clone for WaiterRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Clone + Send + 'static> WaiterRegistry<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            core: Arc::new(Mutex::new(RegistryCore {
                value: None,
                waiters: HashMap::new(),
                next_id: 1,
            })),
        }
    }

    pub fn current(&self) -> Option<T> {
        self.core.lock().value.clone()
    }

    pub fn pending(&self) -> usize {
        self.core.lock().waiters.len()
    }

    /// Registers interest in the next value, or returns a ticket that is
    /// already resolved when a value is available.
    pub fn register(&self, timeout: Duration) -> WaitTicket<T> {
        let (tx, rx) = oneshot::channel();
        match self.register_completion(timeout, Completion::Channel(tx)) {
            Registration::Ready(value, _) => WaitTicket {
                id: None,
                state: Some(TicketState::Ready(Ok(value))),
                core: Weak::new(),
                name: self.name,
            },
            Registration::Pending(id) => WaitTicket {
                id: Some(id),
                state: Some(TicketState::Pending(rx)),
                core: Arc::downgrade(&self.core),
                name: self.name,
            },
        }
    }

    pub async fn wait(&self, timeout: Duration) -> Result<T, WaitError> {
        self.register(timeout).resolved().await
    }

    /// Callback flavour of [`WaiterRegistry::wait`]. The callback runs exactly
    /// once; immediately (on the calling thread) if a value is already present.
    pub fn wait_with<F>(&self, timeout: Duration, callback: F) -> Option<WaiterId>
    where
        F: FnOnce(Result<T, WaitError>) + Send + 'static,
    {
        match self.register_completion(timeout, Completion::Callback(Box::new(callback))) {
            Registration::Ready(value, completion) => {
                if let Some(completion) = completion {
                    completion.complete(Ok(value));
                }
                None
            }
            Registration::Pending(id) => Some(id),
        }
    }

    fn register_completion(&self, timeout: Duration, completion: Completion<T>) -> Registration<T> {
        let mut core = self.core.lock();
        if let Some(value) = core.value.clone() {
            drop(core);
            return match completion {
                Completion::Channel(_) => Registration::Ready(value, None),
                callback => Registration::Ready(value, Some(callback)),
            };
        }

        let id = core.next_id;
        core.next_id += 1;
        let weak = Arc::downgrade(&self.core);
        let name = self.name;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(core) = weak.upgrade() {
                expire_in(&core, name, id).fire();
            }
        });
        core.waiters.insert(
            id,
            Waiter {
                created_at: Instant::now(),
                timeout,
                completion,
                timer: Some(timer),
            },
        );
        Registration::Pending(id)
    }

    /// Publishes `value` and resolves every pending waiter with it. The value
    /// stays current until [`invalidate`](Self::invalidate) or
    /// [`fail_all`](Self::fail_all).
    pub fn resolve_all(&self, value: T) -> Deferred {
        let mut core = self.core.lock();
        core.value = Some(value.clone());
        let waiters = drain(&mut core);
        drop(core);
        if !waiters.is_empty() {
            debug!(registry = self.name, count = waiters.len(), "resolving waiters");
        }
        Deferred::with(waiters, Ok(value))
    }

    /// Clears the current value and fails every pending waiter with `error`.
    pub fn fail_all(&self, error: WaitError) -> Deferred {
        let mut core = self.core.lock();
        core.value = None;
        let waiters = drain(&mut core);
        drop(core);
        if !waiters.is_empty() {
            debug!(registry = self.name, count = waiters.len(), %error, "failing waiters");
        }
        Deferred::with(waiters, Err(error))
    }

    /// Forgets the current value; pending waiters keep waiting for the next one.
    pub fn invalidate(&self) {
        self.core.lock().value = None;
    }

    /// Resolves one waiter with a timeout failure.
    pub fn expire(&self, id: WaiterId) -> Deferred {
        expire_in(&self.core, self.name, id)
    }

    /// Resolves one waiter with [`WaitError::Withdrawn`].
    pub fn cancel(&self, id: WaiterId) -> Deferred {
        cancel_in(&self.core, id)
    }
}

enum Registration<T> {
    Ready(T, Option<Completion<T>>),
    Pending(WaiterId),
}

fn drain<T>(core: &mut RegistryCore<T>) -> Vec<Waiter<T>> {
    core.waiters
        .drain()
        .map(|(_, mut waiter)| {
            waiter.disarm();
            waiter
        })
        .collect()
}

fn expire_in<T: Clone + Send + 'static>(
    core: &Mutex<RegistryCore<T>>,
    name: &'static str,
    id: WaiterId,
) -> Deferred {
    let Some(mut waiter) = core.lock().waiters.remove(&id) else {
        return Deferred::empty();
    };
    waiter.disarm();
    debug!(
        registry = name,
        waiter = id,
        elapsed = ?waiter.created_at.elapsed(),
        "waiter timed out"
    );
    let timeout = waiter.timeout;
    Deferred::with(vec![waiter], Err(WaitError::Timeout(timeout)))
}

fn cancel_in<T: Clone + Send + 'static>(core: &Mutex<RegistryCore<T>>, id: WaiterId) -> Deferred {
    let Some(mut waiter) = core.lock().waiters.remove(&id) else {
        return Deferred::empty();
    };
    waiter.disarm();
    Deferred::with(vec![waiter], Err(WaitError::Withdrawn))
}

enum TicketState<T> {
    Ready(Outcome<T>),
    Pending(oneshot::Receiver<Outcome<T>>),
}

/// Handle to one registered waiter. Dropping it withdraws the waiter.
pub struct WaitTicket<T: Clone + Send + 'static> {
    id: Option<WaiterId>,
    state: Option<TicketState<T>>,
    core: Weak<Mutex<RegistryCore<T>>>,
    name: &'static str,
}

impl<T: Clone + Send + 'static> WaitTicket<T> {
    /// `None` when the value was already available at registration.
    pub fn id(&self) -> Option<WaiterId> {
        self.id
    }

    pub async fn resolved(mut self) -> Result<T, WaitError> {
        let outcome = match self.state.take() {
            Some(TicketState::Ready(outcome)) => outcome,
            Some(TicketState::Pending(rx)) => rx.await.unwrap_or_else(|_| {
                Err(WaitError::Failed(format!("{} registry dropped", self.name)))
            }),
            None => Err(WaitError::Withdrawn),
        };
        self.id = None;
        outcome
    }
}

impl<T: Clone + Send + 'static> Drop for WaitTicket<T> {
    fn drop(&mut self) {
        let (Some(id), Some(core)) = (self.id.take(), self.core.upgrade()) else {
            return;
        };
        cancel_in(&core, id).fire();
    }
}

#[cfg(test)]
#[path = "tests/waiter_tests.rs"]
mod tests;
