//! Push-transport plumbing: shared connections, topic subscriptions, and
//! the bridge that merges inbound events into held resources.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::resource::Resource;

/// Server-initiated event delivered over the push transport.
#[derive(Debug, Clone)]
pub struct PushEvent {
  pub topic: String,
  pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportStatus {
  pub connected: bool,
}

/// Handler invoked for each event on a subscribed topic.
pub type EventHandler = Arc<dyn Fn(&PushEvent) + Send + Sync>;

/// Bidirectional push channel (socket-shaped collaborator).
///
/// Handlers are dispatched on the runtime; implementations must tolerate a
/// handler subscribing or unsubscribing from within a dispatch.
pub trait PushTransport: Send + Sync {
  fn connect(&self);
  fn disconnect(&self);

  /// Register a handler; the returned id is released through `unsubscribe`.
  fn subscribe(&self, topic: &str, handler: EventHandler) -> u64;
  fn unsubscribe(&self, id: u64);

  /// Returns false when the message could not be handed to the transport.
  fn send(&self, kind: &str, payload: serde_json::Value) -> bool;

  fn status(&self) -> TransportStatus;
  fn status_rx(&self) -> watch::Receiver<bool>;
}

/// A topic registration; unsubscribes exactly once on drop.
pub struct Subscription {
  transport: Arc<dyn PushTransport>,
  id: u64,
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.transport.unsubscribe(self.id);
  }
}

/// Reference-counted shared transport.
///
/// The first lease connects the underlying transport, the last one dropped
/// disconnects it, so any number of consumers share one physical connection.
#[derive(Clone)]
pub struct SharedTransport {
  transport: Arc<dyn PushTransport>,
  leases: Arc<AtomicUsize>,
}

impl SharedTransport {
  pub fn new(transport: Arc<dyn PushTransport>) -> Self {
    Self {
      transport,
      leases: Arc::new(AtomicUsize::new(0)),
    }
  }

  pub fn acquire(&self) -> TransportLease {
    if self.leases.fetch_add(1, Ordering::SeqCst) == 0 {
      self.transport.connect();
    }
    TransportLease {
      transport: self.transport.clone(),
      leases: self.leases.clone(),
    }
  }

  pub fn transport(&self) -> Arc<dyn PushTransport> {
    self.transport.clone()
  }

  pub fn status_rx(&self) -> watch::Receiver<bool> {
    self.transport.status_rx()
  }
}

/// A held share of the transport connection.
pub struct TransportLease {
  transport: Arc<dyn PushTransport>,
  leases: Arc<AtomicUsize>,
}

impl Drop for TransportLease {
  fn drop(&mut self) {
    if self.leases.fetch_sub(1, Ordering::SeqCst) == 1 {
      self.transport.disconnect();
    }
  }
}

/// Outcome of merging a push event against a held value.
pub enum MergeOutcome<T> {
  /// The event carried enough to update the value locally.
  Update(T),
  /// Delta or notification only; the resource must refetch.
  Refetch,
  /// The event does not concern this resource.
  Ignore,
}

/// Bridges push events into resources over a shared transport.
///
/// A bridge owns its subscriptions and its connection lease; dropping it
/// releases all of them together.
pub struct RealtimeBridge {
  transport: Arc<dyn PushTransport>,
  _lease: TransportLease,
  subscriptions: Vec<Subscription>,
  status_forwarder: Option<JoinHandle<()>>,
}

impl RealtimeBridge {
  pub fn new(shared: &SharedTransport) -> Self {
    let lease = shared.acquire();
    Self {
      transport: shared.transport(),
      _lease: lease,
      subscriptions: Vec::new(),
      status_forwarder: None,
    }
  }

  /// Subscribe a raw handler to a topic.
  pub fn subscribe<F>(&mut self, topic: &str, handler: F)
  where
    F: Fn(&PushEvent) + Send + Sync + 'static,
  {
    let id = self.transport.subscribe(topic, Arc::new(handler));
    self.subscriptions.push(Subscription {
      transport: self.transport.clone(),
      id,
    });
  }

  /// Wire a topic to a resource.
  ///
  /// `merge` decides per event: an event carrying the full updated object
  /// (or enough of it) merges into the held value with no network round
  /// trip; a notification-only event triggers `refetch()` on the resource.
  pub fn bind_resource<T, M>(&mut self, topic: &str, resource: &Resource<T>, merge: M)
  where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    M: Fn(&PushEvent, Option<&T>) -> MergeOutcome<T> + Send + Sync + 'static,
  {
    let resource = resource.clone();
    self.subscribe(topic, move |event| {
      let current = resource.data();
      match merge(event, current.as_ref()) {
        MergeOutcome::Update(value) => {
          debug!(topic = %event.topic, "merging push event into resource");
          resource.update_data(|_| value);
        }
        MergeOutcome::Refetch => {
          debug!(topic = %event.topic, "push event is delta-only, refetching");
          resource.refetch();
        }
        MergeOutcome::Ignore => {}
      }
    });
  }

  /// Surface transport status changes to a callback. Opt-in; nothing in the
  /// bridge depends on it.
  pub fn on_status<F>(&mut self, callback: F)
  where
    F: Fn(TransportStatus) + Send + 'static,
  {
    if let Some(handle) = self.status_forwarder.take() {
      handle.abort();
    }
    let mut rx = self.transport.status_rx();
    self.status_forwarder = Some(tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let connected = *rx.borrow();
        callback(TransportStatus { connected });
      }
    }));
  }

  pub fn send(&self, kind: &str, payload: serde_json::Value) -> bool {
    self.transport.send(kind, payload)
  }

  pub fn reconnect(&self) {
    self.transport.disconnect();
    self.transport.connect();
  }

  pub fn status(&self) -> TransportStatus {
    self.transport.status()
  }
}

impl Drop for RealtimeBridge {
  fn drop(&mut self) {
    if let Some(handle) = self.status_forwarder.take() {
      handle.abort();
    }
  }
}

/// In-process transport dispatching synchronously to registered handlers.
///
/// Backs tests and local wiring; a socket-backed implementation plugs in
/// through the same trait.
pub struct ChannelTransport {
  state: Mutex<ChannelState>,
  status_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct ChannelState {
  next_id: u64,
  handlers: HashMap<u64, (String, EventHandler)>,
}

impl ChannelTransport {
  pub fn new() -> Self {
    let (status_tx, _) = watch::channel(false);
    Self {
      state: Mutex::new(ChannelState::default()),
      status_tx,
    }
  }

  /// Deliver an event to every subscriber of its topic.
  pub fn emit(&self, topic: &str, payload: serde_json::Value) {
    let handlers: Vec<EventHandler> = {
      let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
      state
        .handlers
        .values()
        .filter(|(t, _)| t == topic)
        .map(|(_, h)| h.clone())
        .collect()
    };

    let event = PushEvent {
      topic: topic.to_string(),
      payload,
    };

    // Dispatch outside the lock so handlers may re-enter the transport.
    for handler in handlers {
      handler(&event);
    }
  }

  #[cfg(test)]
  fn subscriber_count(&self) -> usize {
    self
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .handlers
      .len()
  }
}

impl Default for ChannelTransport {
  fn default() -> Self {
    Self::new()
  }
}

impl PushTransport for ChannelTransport {
  fn connect(&self) {
    self.status_tx.send_replace(true);
  }

  fn disconnect(&self) {
    self.status_tx.send_replace(false);
  }

  fn subscribe(&self, topic: &str, handler: EventHandler) -> u64 {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    let id = state.next_id;
    state.next_id += 1;
    state.handlers.insert(id, (topic.to_string(), handler));
    id
  }

  fn unsubscribe(&self, id: u64) {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    state.handlers.remove(&id);
  }

  fn send(&self, kind: &str, _payload: serde_json::Value) -> bool {
    let connected = *self.status_tx.borrow();
    if connected {
      debug!(kind, "outbound push message");
    }
    connected
  }

  fn status(&self) -> TransportStatus {
    TransportStatus {
      connected: *self.status_tx.borrow(),
    }
  }

  fn status_rx(&self) -> watch::Receiver<bool> {
    self.status_tx.subscribe()
  }
}
