//! Recurring-invocation strategies over the scheduled-task primitive.
//!
//! Three schedulers share one invariant: the callback is always awaited to
//! completion inside the timer loop, so a tick that lands while an
//! invocation is still pending is deferred, never run concurrently with it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::error::FetchError;

use super::connection::ConnectionMonitor;
use super::task::{CancelToken, ScheduledTask};

/// Interval after `failures` consecutive failures: `min(base * mult^n, max)`.
pub(crate) fn backoff_interval(
  base: Duration,
  multiplier: f64,
  failures: u32,
  max: Duration,
) -> Duration {
  let scaled = base.as_millis() as f64 * multiplier.powi(failures as i32);
  let capped = scaled.min(max.as_millis() as f64);
  Duration::from_millis(capped as u64)
}

/// Fixed-interval poller that follows `enabled && online`.
///
/// Interval and enabled are runtime-settable; any change to either, or to
/// host connectivity, tears down the pending sleep and re-arms it. The loop
/// is cancelled when the poller drops.
pub struct AutoPoller {
  task: Arc<ScheduledTask>,
  interval_tx: watch::Sender<Duration>,
  enabled_tx: watch::Sender<bool>,
}

impl AutoPoller {
  pub fn new<F, Fut>(
    callback: F,
    interval: Duration,
    enabled: bool,
    monitor: &ConnectionMonitor,
  ) -> Self
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let task = Arc::new(ScheduledTask::new(callback));
    let (interval_tx, interval_rx) = watch::channel(interval);
    let (enabled_tx, enabled_rx) = watch::channel(enabled);

    let token = task.token();
    let loop_task = task.clone();
    let online_rx = monitor.online_rx();
    tokio::spawn(run_auto(loop_task, token, interval_rx, enabled_rx, online_rx));

    Self {
      task,
      interval_tx,
      enabled_tx,
    }
  }

  pub fn set_interval(&self, interval: Duration) {
    let _ = self.interval_tx.send(interval);
  }

  pub fn set_enabled(&self, enabled: bool) {
    let _ = self.enabled_tx.send(enabled);
  }

  pub fn is_enabled(&self) -> bool {
    *self.enabled_tx.borrow()
  }

  /// Replace the polled callback; takes effect on the next tick.
  pub fn swap<F, Fut>(&self, callback: F)
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    self.task.swap(callback);
  }
}

impl Drop for AutoPoller {
  fn drop(&mut self) {
    self.task.cancel();
  }
}

async fn run_auto(
  task: Arc<ScheduledTask>,
  token: CancelToken,
  mut interval_rx: watch::Receiver<Duration>,
  mut enabled_rx: watch::Receiver<bool>,
  mut online_rx: watch::Receiver<bool>,
) {
  loop {
    if token.is_cancelled() {
      return;
    }

    let active = *enabled_rx.borrow() && *online_rx.borrow();
    if !active {
      tokio::select! {
        _ = token.cancelled() => return,
        r = enabled_rx.changed() => if r.is_err() { return },
        r = online_rx.changed() => if r.is_err() { return },
      }
      continue;
    }

    let interval = *interval_rx.borrow();
    tokio::select! {
      _ = token.cancelled() => return,
      _ = tokio::time::sleep(interval) => {
        task.run_once().await;
      }
      r = interval_rx.changed() => if r.is_err() { return },
      r = enabled_rx.changed() => if r.is_err() { return },
      r = online_rx.changed() => if r.is_err() { return },
    }
  }
}

/// Manually driven poller: `start` invokes immediately, then on every
/// interval; `start` while running is a no-op; `stop` clears the timer.
pub struct ControlledPoller {
  task: Arc<ScheduledTask>,
  interval: Duration,
  running: Arc<AtomicBool>,
}

impl ControlledPoller {
  pub fn new<F, Fut>(callback: F, interval: Duration) -> Self
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    Self {
      task: Arc::new(ScheduledTask::new(callback)),
      interval,
      running: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn start(&self) {
    if self.running.swap(true, Ordering::SeqCst) {
      return;
    }

    let token = self.task.rearm();
    let task = self.task.clone();
    let interval = self.interval;

    // The loop exits only through cancellation, and whoever cancels owns
    // the `running` flag: `stop()` clears it, drop makes it moot.
    tokio::spawn(async move {
      task.run_once().await;
      loop {
        tokio::select! {
          _ = token.cancelled() => return,
          _ = tokio::time::sleep(interval) => task.run_once().await,
        }
      }
    });
  }

  pub fn stop(&self) {
    if self.running.swap(false, Ordering::SeqCst) {
      self.task.cancel();
    }
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }
}

impl Drop for ControlledPoller {
  fn drop(&mut self) {
    self.task.cancel();
  }
}

/// Hook invoked on each failed tick with the error and the failure count.
pub type SmartErrorHook = Box<dyn FnMut(&FetchError, u32) + Send>;

pub struct SmartPollerOptions {
  pub base_interval: Duration,
  pub max_interval: Duration,
  pub backoff_multiplier: f64,
  /// Consecutive failures after which the poller stops itself.
  pub max_retries: u32,
  pub enabled: bool,
  pub on_error: Option<SmartErrorHook>,
}

impl Default for SmartPollerOptions {
  fn default() -> Self {
    Self {
      base_interval: Duration::from_secs(30),
      max_interval: Duration::from_secs(300),
      backoff_multiplier: 2.0,
      max_retries: 5,
      enabled: true,
      on_error: None,
    }
  }
}

/// Adaptive poller with exponential backoff and an open-loop breaker.
///
/// `start()` invokes immediately, then reschedules after the current
/// interval. Success resets the interval and the failure count; each
/// failure grows the interval and increments the count, and once the count
/// reaches `max_retries` the poller stops itself — only an external
/// `start()` resumes it. While disabled or offline the loop holds without
/// consuming retries.
pub struct SmartPoller {
  inner: Arc<SmartInner>,
  enabled_tx: watch::Sender<bool>,
}

struct SmartInner {
  task: ScheduledTask<Result<(), FetchError>>,
  on_error: Mutex<Option<SmartErrorHook>>,
  base_interval: Duration,
  max_interval: Duration,
  backoff_multiplier: f64,
  max_retries: u32,
  running: AtomicBool,
  retry_count: AtomicU32,
  current_interval_ms: AtomicU64,
  last_error: Mutex<Option<FetchError>>,
  online_rx: watch::Receiver<bool>,
  enabled_rx: watch::Receiver<bool>,
}

impl SmartPoller {
  pub fn new<F, Fut>(callback: F, options: SmartPollerOptions, monitor: &ConnectionMonitor) -> Self
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), FetchError>> + Send + 'static,
  {
    let (enabled_tx, enabled_rx) = watch::channel(options.enabled);
    let inner = Arc::new(SmartInner {
      task: ScheduledTask::new(callback),
      on_error: Mutex::new(options.on_error),
      base_interval: options.base_interval,
      max_interval: options.max_interval,
      backoff_multiplier: options.backoff_multiplier,
      max_retries: options.max_retries,
      running: AtomicBool::new(false),
      retry_count: AtomicU32::new(0),
      current_interval_ms: AtomicU64::new(options.base_interval.as_millis() as u64),
      last_error: Mutex::new(None),
      online_rx: monitor.online_rx(),
      enabled_rx,
    });

    Self { inner, enabled_tx }
  }

  pub fn start(&self) {
    if self.inner.running.swap(true, Ordering::SeqCst) {
      return;
    }

    let token = self.inner.task.rearm();
    tokio::spawn(run_smart(self.inner.clone(), token));
  }

  pub fn stop(&self) {
    if self.inner.running.swap(false, Ordering::SeqCst) {
      self.inner.task.cancel();
    }
  }

  /// Restore the base interval and clear failure state. Does not start a
  /// stopped poller.
  pub fn reset(&self) {
    self.inner.retry_count.store(0, Ordering::SeqCst);
    self
      .inner
      .current_interval_ms
      .store(self.inner.base_interval.as_millis() as u64, Ordering::SeqCst);
    *self
      .inner
      .last_error
      .lock()
      .unwrap_or_else(PoisonError::into_inner) = None;
  }

  pub fn set_enabled(&self, enabled: bool) {
    let _ = self.enabled_tx.send(enabled);
  }

  pub fn is_running(&self) -> bool {
    self.inner.running.load(Ordering::SeqCst)
  }

  pub fn retry_count(&self) -> u32 {
    self.inner.retry_count.load(Ordering::SeqCst)
  }

  pub fn current_interval(&self) -> Duration {
    Duration::from_millis(self.inner.current_interval_ms.load(Ordering::SeqCst))
  }

  pub fn last_error(&self) -> Option<FetchError> {
    self
      .inner
      .last_error
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }
}

impl Drop for SmartPoller {
  fn drop(&mut self) {
    self.inner.task.cancel();
  }
}

// On cancellation the loop just exits: whoever cancelled owns the
// `running` flag (`stop()` clears it, a restart has already re-set it).
// Only the breaker trip clears the flag from inside the loop.
async fn run_smart(inner: Arc<SmartInner>, token: CancelToken) {
  let mut online_rx = inner.online_rx.clone();
  let mut enabled_rx = inner.enabled_rx.clone();

  loop {
    // Hold while disabled or offline; consumes no retries.
    loop {
      if token.is_cancelled() {
        return;
      }
      if *enabled_rx.borrow() && *online_rx.borrow() {
        break;
      }
      tokio::select! {
        _ = token.cancelled() => return,
        r = enabled_rx.changed() => if r.is_err() {
          inner.running.store(false, Ordering::SeqCst);
          return;
        },
        r = online_rx.changed() => if r.is_err() {
          inner.running.store(false, Ordering::SeqCst);
          return;
        },
      }
    }

    let result = tokio::select! {
      _ = token.cancelled() => return,
      r = inner.task.run_once() => r,
    };

    match result {
      Ok(()) => {
        inner.retry_count.store(0, Ordering::SeqCst);
        inner
          .current_interval_ms
          .store(inner.base_interval.as_millis() as u64, Ordering::SeqCst);
        *inner
          .last_error
          .lock()
          .unwrap_or_else(PoisonError::into_inner) = None;
      }
      Err(error) => {
        let count = inner.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
        let next = backoff_interval(
          inner.base_interval,
          inner.backoff_multiplier,
          count,
          inner.max_interval,
        );
        inner
          .current_interval_ms
          .store(next.as_millis() as u64, Ordering::SeqCst);
        *inner
          .last_error
          .lock()
          .unwrap_or_else(PoisonError::into_inner) = Some(error.clone());

        if let Some(hook) = inner
          .on_error
          .lock()
          .unwrap_or_else(PoisonError::into_inner)
          .as_mut()
        {
          hook(&error, count);
        }

        if count >= inner.max_retries {
          debug!(count, "smart poller exhausted retries, stopping");
          inner.running.store(false, Ordering::SeqCst);
          return;
        }
      }
    }

    let wait = Duration::from_millis(inner.current_interval_ms.load(Ordering::SeqCst));
    tokio::select! {
      _ = token.cancelled() => return,
      _ = tokio::time::sleep(wait) => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicU32;

  #[test]
  fn test_backoff_interval_growth() {
    let base = Duration::from_millis(1000);
    let max = Duration::from_millis(300_000);

    assert_eq!(backoff_interval(base, 2.0, 0, max), Duration::from_millis(1000));
    assert_eq!(backoff_interval(base, 2.0, 1, max), Duration::from_millis(2000));
    assert_eq!(backoff_interval(base, 2.0, 5, max), Duration::from_millis(32_000));
    // 1000 * 2^9 = 512_000, clamped.
    assert_eq!(backoff_interval(base, 2.0, 9, max), Duration::from_millis(300_000));
    assert_eq!(backoff_interval(base, 2.0, 20, max), Duration::from_millis(300_000));
  }

  #[tokio::test]
  async fn test_auto_poller_ticks_and_follows_enabled() {
    let monitor = ConnectionMonitor::new();
    let ticks = Arc::new(AtomicU32::new(0));

    let counter = ticks.clone();
    let poller = AutoPoller::new(
      move || {
        let counter = counter.clone();
        async move {
          counter.fetch_add(1, Ordering::SeqCst);
        }
      },
      Duration::from_millis(20),
      true,
      &monitor,
    );

    tokio::time::sleep(Duration::from_millis(110)).await;
    let after_run = ticks.load(Ordering::SeqCst);
    assert!(after_run >= 3, "expected at least 3 ticks, got {}", after_run);

    poller.set_enabled(false);
    tokio::time::sleep(Duration::from_millis(60)).await;
    let after_disable = ticks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), after_disable);
  }

  #[tokio::test]
  async fn test_auto_poller_pauses_while_offline() {
    let monitor = ConnectionMonitor::new();
    let ticks = Arc::new(AtomicU32::new(0));

    let counter = ticks.clone();
    let _poller = AutoPoller::new(
      move || {
        let counter = counter.clone();
        async move {
          counter.fetch_add(1, Ordering::SeqCst);
        }
      },
      Duration::from_millis(20),
      true,
      &monitor,
    );

    monitor.set_online(false);
    tokio::time::sleep(Duration::from_millis(80)).await;
    let while_offline = ticks.load(Ordering::SeqCst);

    monitor.set_online(true);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(ticks.load(Ordering::SeqCst) > while_offline);
  }

  #[tokio::test]
  async fn test_auto_poller_stops_on_drop() {
    let monitor = ConnectionMonitor::new();
    let ticks = Arc::new(AtomicU32::new(0));

    let counter = ticks.clone();
    let poller = AutoPoller::new(
      move || {
        let counter = counter.clone();
        async move {
          counter.fetch_add(1, Ordering::SeqCst);
        }
      },
      Duration::from_millis(10),
      true,
      &monitor,
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(poller);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let after_drop = ticks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), after_drop);
  }

  #[tokio::test]
  async fn test_ticks_never_overlap() {
    let monitor = ConnectionMonitor::new();
    let active = Arc::new(AtomicU32::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));

    let in_flight = active.clone();
    let saw_overlap = overlapped.clone();
    let _poller = AutoPoller::new(
      move || {
        let in_flight = in_flight.clone();
        let saw_overlap = saw_overlap.clone();
        async move {
          if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            saw_overlap.store(true, Ordering::SeqCst);
          }
          tokio::time::sleep(Duration::from_millis(40)).await;
          in_flight.fetch_sub(1, Ordering::SeqCst);
        }
      },
      Duration::from_millis(10),
      true,
      &monitor,
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!overlapped.load(Ordering::SeqCst));
  }

  #[tokio::test]
  async fn test_controlled_double_start_invokes_once() {
    let ticks = Arc::new(AtomicU32::new(0));

    let counter = ticks.clone();
    let poller = ControlledPoller::new(
      move || {
        let counter = counter.clone();
        async move {
          counter.fetch_add(1, Ordering::SeqCst);
        }
      },
      Duration::from_secs(5),
    );

    poller.start();
    poller.start();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
    assert!(poller.is_running());
  }

  #[tokio::test]
  async fn test_controlled_stop_clears_timer() {
    let ticks = Arc::new(AtomicU32::new(0));

    let counter = ticks.clone();
    let poller = ControlledPoller::new(
      move || {
        let counter = counter.clone();
        async move {
          counter.fetch_add(1, Ordering::SeqCst);
        }
      },
      Duration::from_millis(20),
    );

    poller.start();
    tokio::time::sleep(Duration::from_millis(70)).await;
    poller.stop();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let after_stop = ticks.load(Ordering::SeqCst);
    assert!(after_stop >= 2);
    assert!(!poller.is_running());

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
  }

  #[tokio::test]
  async fn test_controlled_restart_after_stop() {
    let ticks = Arc::new(AtomicU32::new(0));

    let counter = ticks.clone();
    let poller = ControlledPoller::new(
      move || {
        let counter = counter.clone();
        async move {
          counter.fetch_add(1, Ordering::SeqCst);
        }
      },
      Duration::from_secs(5),
    );

    poller.start();
    tokio::time::sleep(Duration::from_millis(30)).await;
    poller.stop();
    tokio::time::sleep(Duration::from_millis(30)).await;

    poller.start();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_smart_poller_stops_at_max_retries() {
    let monitor = ConnectionMonitor::new();
    let errors = Arc::new(AtomicU32::new(0));

    let seen = errors.clone();
    let poller = SmartPoller::new(
      || async { Err(FetchError::Network("unreachable".into())) },
      SmartPollerOptions {
        base_interval: Duration::from_millis(10),
        max_interval: Duration::from_millis(100),
        max_retries: 3,
        on_error: Some(Box::new(move |_, count| {
          seen.fetch_add(1, Ordering::SeqCst);
          assert!(count >= 1 && count <= 3);
        })),
        ..Default::default()
      },
      &monitor,
    );

    poller.start();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(!poller.is_running());
    assert_eq!(poller.retry_count(), 3);
    assert_eq!(errors.load(Ordering::SeqCst), 3);
    assert_eq!(
      poller.last_error(),
      Some(FetchError::Network("unreachable".into()))
    );
  }

  #[tokio::test]
  async fn test_smart_poller_success_resets_backoff() {
    let monitor = ConnectionMonitor::new();
    let calls = Arc::new(AtomicU32::new(0));

    let sequence = calls.clone();
    let poller = SmartPoller::new(
      move || {
        let call = sequence.fetch_add(1, Ordering::SeqCst);
        async move {
          if call == 0 {
            Err(FetchError::Network("blip".into()))
          } else {
            Ok(())
          }
        }
      },
      SmartPollerOptions {
        base_interval: Duration::from_millis(20),
        max_interval: Duration::from_millis(200),
        max_retries: 5,
        ..Default::default()
      },
      &monitor,
    );

    poller.start();
    tokio::time::sleep(Duration::from_millis(30)).await;
    // One failure so far: interval has grown.
    assert_eq!(poller.retry_count(), 1);
    assert_eq!(poller.current_interval(), Duration::from_millis(40));

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(poller.retry_count(), 0);
    assert_eq!(poller.current_interval(), Duration::from_millis(20));
    assert!(poller.is_running());
  }

  #[tokio::test]
  async fn test_smart_poller_restarts_after_breaker_trip() {
    let monitor = ConnectionMonitor::new();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let poller = SmartPoller::new(
      move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(FetchError::Network("unreachable".into())) }
      },
      SmartPollerOptions {
        base_interval: Duration::from_millis(10),
        max_interval: Duration::from_millis(40),
        max_retries: 2,
        ..Default::default()
      },
      &monitor,
    );

    poller.start();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!poller.is_running());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    poller.reset();
    poller.start();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);
  }

  #[tokio::test]
  async fn test_smart_poller_holds_while_offline() {
    let monitor = ConnectionMonitor::new();
    monitor.set_online(false);
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let poller = SmartPoller::new(
      move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
      },
      SmartPollerOptions {
        base_interval: Duration::from_millis(20),
        ..Default::default()
      },
      &monitor,
    );

    poller.start();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(poller.is_running());

    monitor.set_online(true);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(calls.load(Ordering::SeqCst) >= 1);
  }
}
