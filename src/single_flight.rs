//! Single-flight call deduplication
//!
//! A [`Group`] collapses concurrent calls that share a key into one execution.
//! The first caller runs the function; callers arriving while it is in flight
//! wait for it and receive a clone of the same result.
//!
//! # Features
//!
//! - Results are never cached: the in-flight record is dropped the moment
//!   the call finishes, so the next call starts fresh
//! - The registry lock is held only for map updates, never while the
//!   function runs
//! - A panic is captured with its message and a backtrace and surfaced again
//! - An executor that is dropped or aborted mid-call wakes every waiter with
//!   [`FlightError::AbnormalExit`] instead of leaving them blocked
//!
//! # Examples
//!
//! ```rust,ignore
//! use prometheus_singleton_cron::single_flight::Group;
//!
//! let group: Group<String, String> = Group::new();
//! let (result, shared) = group
//!     .call("config", || async { Ok::<_, String>(load_config().await) })
//!     .await;
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{error, warn};

/// Panic value and backtrace captured from a flight's function.
#[derive(Debug, Clone)]
pub struct PanicError {
    value: String,
    stack: String,
}

impl PanicError {
    fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let value = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        Self {
            value,
            stack: std::backtrace::Backtrace::force_capture().to_string(),
        }
    }

    /// The panic message.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Backtrace captured where the panic was caught.
    pub fn stack(&self) -> &str {
        &self.stack
    }
}

impl std::fmt::Display for PanicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\n{}", self.value, self.stack)
    }
}

impl std::error::Error for PanicError {}

/// Why a flight did not produce a value.
#[derive(Debug, Clone, Error)]
pub enum FlightError<E> {
    /// The function returned an error.
    #[error("{0}")]
    Failed(E),
    /// The function panicked.
    #[error("call panicked: {0}")]
    Panicked(Arc<PanicError>),
    /// The executor stopped without returning or panicking.
    #[error("call exited abnormally")]
    AbnormalExit,
}

impl<E> FlightError<E> {
    /// True for [`FlightError::Panicked`].
    pub const fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }
}

/// Result of one flight as seen by one caller.
pub type FlightResult<T, E> = Result<T, FlightError<E>>;

/// Outcome delivered through [`Group::call_chan`].
#[derive(Debug, Clone)]
pub struct FlightOutcome<T, E> {
    /// Shared result.
    pub result: FlightResult<T, E>,
    /// Whether more than one caller received this result.
    pub shared: bool,
}

struct Waiters<T, E> {
    dups: usize,
    chans: Vec<oneshot::Sender<FlightOutcome<T, E>>>,
}

struct Call<T, E> {
    done: watch::Sender<Option<FlightResult<T, E>>>,
    waiters: Mutex<Waiters<T, E>>,
}

impl<T, E> Call<T, E> {
    fn new() -> Self {
        let (done, _) = watch::channel(None);
        Self {
            done,
            waiters: Mutex::new(Waiters { dups: 0, chans: Vec::new() }),
        }
    }
}

type Registry<T, E> = Arc<Mutex<HashMap<String, Arc<Call<T, E>>>>>;

enum Join<T, E> {
    Executor(Arc<Call<T, E>>),
    Waiter(watch::Receiver<Option<FlightResult<T, E>>>),
}

/// Clears the registry entry if the executing future is dropped before it
/// finishes. Dropping the call's channels wakes every waiter.
struct CallGuard<'a, T, E> {
    calls: &'a Registry<T, E>,
    key: &'a str,
    call: &'a Arc<Call<T, E>>,
    armed: bool,
}

impl<T, E> Drop for CallGuard<'_, T, E> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("single-flight call for {} exited abnormally", self.key);
        let mut calls = self.calls.lock();
        if calls.get(self.key).is_some_and(|c| Arc::ptr_eq(c, self.call)) {
            calls.remove(self.key);
        }
        self.call.waiters.lock().chans.clear();
    }
}

/// A namespace of deduplicated calls.
pub struct Group<T, E> {
    calls: Registry<T, E>,
}

impl<T, E> Clone for Group<T, E> {
    fn clone(&self) -> Self {
        Self {
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<T, E> Default for Group<T, E> {
    fn default() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T, E> Group<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` unless a call for `key` is already in flight, in which case
    /// wait for that call instead.
    ///
    /// Returns the result and whether it was shared with other callers.
    ///
    /// # Panics
    ///
    /// Re-raises a panic from `f`. The executing caller resumes the original
    /// panic when no channel waiters exist; waiting callers panic with the
    /// captured [`PanicError`].
    pub async fn call<F, Fut>(&self, key: &str, f: F) -> (FlightResult<T, E>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.join(key) {
            Join::Executor(call) => {
                let outcome = self.execute(key, &call, f).await;
                (outcome.result, outcome.shared)
            }
            Join::Waiter(mut rx) => {
                let settled = rx
                    .wait_for(Option::is_some)
                    .await
                    .ok()
                    .and_then(|v| (*v).clone());
                match settled {
                    Some(Err(FlightError::Panicked(p))) => {
                        std::panic::resume_unwind(Box::new(PanicError::clone(&p)))
                    }
                    Some(result) => (result, true),
                    None => (Err(FlightError::AbnormalExit), true),
                }
            }
        }
    }

    /// Like [`call`](Self::call) but returns immediately with a receiver.
    ///
    /// A new flight runs on a spawned task. Panics are reported through the
    /// receiver as [`FlightError::Panicked`].
    pub fn call_chan<F, Fut>(&self, key: &str, f: F) -> FlightReceiver<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut calls = self.calls.lock();
        if let Some(call) = calls.get(key) {
            let mut waiters = call.waiters.lock();
            waiters.dups += 1;
            waiters.chans.push(tx);
            return FlightReceiver { rx };
        }
        let call = Arc::new(Call::new());
        call.waiters.lock().chans.push(tx);
        calls.insert(key.to_owned(), Arc::clone(&call));
        drop(calls);

        let group = self.clone();
        let key = key.to_owned();
        tokio::spawn(async move {
            let _ = group.execute(&key, &call, f).await;
        });
        FlightReceiver { rx }
    }

    /// Drop the in-flight record for `key`. Later calls start a new flight.
    pub fn forget(&self, key: &str) {
        self.calls.lock().remove(key);
    }

    /// Number of keys currently in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }

    fn join(&self, key: &str) -> Join<T, E> {
        let mut calls = self.calls.lock();
        if let Some(call) = calls.get(key) {
            call.waiters.lock().dups += 1;
            return Join::Waiter(call.done.subscribe());
        }
        let call = Arc::new(Call::new());
        calls.insert(key.to_owned(), Arc::clone(&call));
        Join::Executor(call)
    }

    async fn execute<F, Fut>(&self, key: &str, call: &Arc<Call<T, E>>, f: F) -> FlightOutcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut guard = CallGuard {
            calls: &self.calls,
            key,
            call,
            armed: true,
        };
        let caught = AssertUnwindSafe(async move { f().await }).catch_unwind().await;
        guard.armed = false;

        let (dups, chans) = self.finish(key, call);
        let shared = dups > 0;
        match caught {
            Ok(result) => {
                let result = result.map_err(FlightError::Failed);
                Self::settle(call, chans, &result, shared);
                FlightOutcome { result, shared }
            }
            Err(payload) => {
                let panic = Arc::new(PanicError::from_payload(payload.as_ref()));
                let result = Err(FlightError::Panicked(Arc::clone(&panic)));
                let has_chans = !chans.is_empty();
                Self::settle(call, chans, &result, shared);
                if !has_chans {
                    std::panic::resume_unwind(payload);
                }
                surface_panic(&panic);
                FlightOutcome { result, shared }
            }
        }
    }

    /// Remove the entry if it is still ours and collect its waiters.
    fn finish(
        &self,
        key: &str,
        call: &Arc<Call<T, E>>,
    ) -> (usize, Vec<oneshot::Sender<FlightOutcome<T, E>>>) {
        let mut calls = self.calls.lock();
        if calls.get(key).is_some_and(|c| Arc::ptr_eq(c, call)) {
            calls.remove(key);
        }
        let mut waiters = call.waiters.lock();
        (waiters.dups, std::mem::take(&mut waiters.chans))
    }

    fn settle(
        call: &Call<T, E>,
        chans: Vec<oneshot::Sender<FlightOutcome<T, E>>>,
        result: &FlightResult<T, E>,
        shared: bool,
    ) {
        call.done.send_replace(Some(result.clone()));
        for tx in chans {
            let _ = tx.send(FlightOutcome {
                result: result.clone(),
                shared,
            });
        }
    }
}

/// Re-raise a captured panic on its own thread so it reaches the panic hook
/// even though channel waiters already received it as an error.
fn surface_panic(panic: &Arc<PanicError>) {
    error!("single-flight call panicked: {}", panic.value());
    let message = panic.to_string();
    let spawned = std::thread::Builder::new()
        .name("single-flight-panic".into())
        .spawn(move || panic!("{message}"));
    if let Err(e) = spawned {
        error!("could not surface single-flight panic: {}", e);
    }
}

/// Future resolving to a [`Group::call_chan`] outcome.
pub struct FlightReceiver<T, E> {
    rx: oneshot::Receiver<FlightOutcome<T, E>>,
}

impl<T, E> Future for FlightReceiver<T, E> {
    type Output = FlightOutcome<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or(FlightOutcome {
                result: Err(FlightError::AbnormalExit),
                shared: false,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_returns_value_unshared() {
        let group: Group<u32, String> = Group::new();
        let (result, shared) = group.call("k", || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert!(!shared);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_error_is_wrapped() {
        let group: Group<u32, String> = Group::new();
        let (result, _) = group.call("k", || async { Err("boom".to_string()) }).await;
        assert!(matches!(result, Err(FlightError::Failed(e)) if e == "boom"));
    }

    #[test]
    fn test_panic_error_display() {
        let err = PanicError {
            value: "bad".into(),
            stack: "frames".into(),
        };
        assert_eq!(err.to_string(), "bad\n\nframes");
    }
}
