//! Scheduled-task primitive shared by the polling strategies.
//!
//! A [`ScheduledTask`] is an explicit value owning a cancellation token and
//! a replaceable callback slot. Timer loops read the slot on every tick, so
//! the active timer always invokes the newest closure; swapping never
//! requires re-arming the timer.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;

/// Cooperative cancellation token.
///
/// Cheap to clone; `cancel()` is sticky and wakes every waiter.
#[derive(Clone, Default)]
pub struct CancelToken {
  inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
  cancelled: AtomicBool,
  notify: Notify,
}

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.inner.cancelled.store(true, Ordering::SeqCst);
    self.inner.notify.notify_waiters();
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.cancelled.load(Ordering::SeqCst)
  }

  /// Resolve once the token is cancelled.
  pub async fn cancelled(&self) {
    loop {
      if self.is_cancelled() {
        return;
      }
      let notified = self.inner.notify.notified();
      if self.is_cancelled() {
        return;
      }
      notified.await;
    }
  }
}

impl std::fmt::Debug for CancelToken {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CancelToken")
      .field("cancelled", &self.is_cancelled())
      .finish()
  }
}

/// A boxed future produced by a task callback.
pub type BoxTaskFuture<O = ()> = BoxFuture<'static, O>;

type TaskFn<O> = Box<dyn FnMut() -> BoxTaskFuture<O> + Send>;

/// A recurring task: a cancellation token plus a replaceable callback slot.
///
/// `O` is what one invocation reports back to the scheduler driving it.
pub struct ScheduledTask<O = ()> {
  cancel: Mutex<CancelToken>,
  slot: Mutex<TaskFn<O>>,
}

impl<O> ScheduledTask<O> {
  pub fn new<F, Fut>(mut callback: F) -> Self
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = O> + Send + 'static,
  {
    Self {
      cancel: Mutex::new(CancelToken::new()),
      slot: Mutex::new(Box::new(move || Box::pin(callback()) as BoxTaskFuture<O>)),
    }
  }

  /// Replace the callback. The next tick invokes the new closure.
  pub fn swap<F, Fut>(&self, mut callback: F)
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = O> + Send + 'static,
  {
    let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
    *slot = Box::new(move || Box::pin(callback()) as BoxTaskFuture<O>);
  }

  /// Invoke the current callback and await its completion.
  ///
  /// The slot lock is held only while producing the future, so a `swap`
  /// during a long-running invocation takes effect on the next tick.
  pub async fn run_once(&self) -> O {
    let future = {
      let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
      (slot)()
    };
    future.await
  }

  /// The currently armed cancellation token.
  pub fn token(&self) -> CancelToken {
    self
      .cancel
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// Cancel the current run, if any.
  pub fn cancel(&self) {
    self
      .cancel
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .cancel();
  }

  /// Cancel the current run and arm a fresh token for the next one.
  pub fn rearm(&self) -> CancelToken {
    let mut guard = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
    guard.cancel();
    *guard = CancelToken::new();
    guard.clone()
  }
}

impl<O> Drop for ScheduledTask<O> {
  fn drop(&mut self) {
    self.cancel();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicU32;
  use std::time::Duration;

  #[tokio::test]
  async fn test_cancel_wakes_waiters() {
    let token = CancelToken::new();
    let waiter = token.clone();
    let handle = tokio::spawn(async move { waiter.cancelled().await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!handle.is_finished());

    token.cancel();
    tokio::time::timeout(Duration::from_millis(100), handle)
      .await
      .expect("waiter should wake")
      .unwrap();
  }

  #[tokio::test]
  async fn test_cancelled_token_resolves_immediately() {
    let token = CancelToken::new();
    token.cancel();
    token.cancelled().await;
    assert!(token.is_cancelled());
  }

  #[tokio::test]
  async fn test_swap_takes_effect_on_next_run() {
    let first = Arc::new(AtomicU32::new(0));
    let second = Arc::new(AtomicU32::new(0));

    let counter = first.clone();
    let task = ScheduledTask::new(move || {
      let counter = counter.clone();
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
      }
    });

    task.run_once().await;
    assert_eq!(first.load(Ordering::SeqCst), 1);

    let counter = second.clone();
    task.swap(move || {
      let counter = counter.clone();
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
      }
    });

    task.run_once().await;
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_rearm_replaces_cancelled_token() {
    let task = ScheduledTask::new(|| async {});
    let old = task.token();
    let new = task.rearm();

    assert!(old.is_cancelled());
    assert!(!new.is_cancelled());
  }
}
