//! Real-time observer sessions over WebSocket.
//!
//! Every connected client is an observer: it receives each stored reading
//! as a JSON text frame and sends nothing but keep-alive traffic. The
//! [`ObserverRegistry`] owns the set of live observers.

use crate::AppState;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        ConnectInfo, Extension, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::{
    collections::BTreeMap,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Mutex,
};

/// Opaque handle for one observer connection. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

/// Why a broadcast could not be handed to an observer.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The observer's outbound buffer is full.
    #[error("{0} is not keeping up with broadcasts")]
    Lagging(ObserverId),

    /// The observer's writer task has gone away.
    #[error("{0} has disconnected")]
    Closed(ObserverId),
}

type ObserverMap = BTreeMap<ObserverId, mpsc::Sender<String>>;

/// Tracks live observers and fans messages out to them.
///
/// Registration, unregistration and each broadcast pass hold the same lock,
/// so the set is never mutated mid-iteration and two broadcasts never
/// interleave their sends to one observer. Sends use `try_send` and never
/// wait: an observer whose channel is closed or full is removed during the
/// pass that failed to reach it.
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    observers: Arc<Mutex<ObserverMap>>,
    next_id: Arc<AtomicU64>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking an observer and returns its handle.
    ///
    /// Registering a sender whose channel is already tracked returns the
    /// existing handle. The observer receives broadcasts issued after this
    /// call only.
    pub async fn register(&self, sender: mpsc::Sender<String>) -> ObserverId {
        let mut observers = self.observers.lock().await;

        if let Some(existing) = observers
            .iter()
            .find_map(|(id, tracked)| tracked.same_channel(&sender).then_some(*id))
        {
            return existing;
        }

        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        observers.insert(id, sender);
        tracing::debug!(observer_id = %id, observers = observers.len(), "observer registered");
        id
    }

    /// Stops tracking an observer. Unknown or already removed handles are a no-op.
    ///
    /// Returns whether the observer was tracked.
    pub async fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock().await;
        let removed = observers.remove(&id).is_some();
        if removed {
            tracing::debug!(observer_id = %id, observers = observers.len(), "observer unregistered");
        }
        removed
    }

    /// Sends `message` to every tracked observer in handle order.
    ///
    /// Observers that cannot accept the message are removed before the
    /// lock is released. Returns the number of observers that accepted it.
    pub async fn broadcast(&self, message: &str) -> usize {
        let mut observers = self.observers.lock().await;
        let mut delivered = 0;

        observers.retain(|id, sender| match try_deliver(*id, sender, message) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(e) => {
                tracing::warn!(observer_id = %id, "pruning observer: {}", e);
                false
            }
        });

        delivered
    }

    /// Number of tracked observers.
    pub async fn len(&self) -> usize {
        self.observers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.observers.lock().await.is_empty()
    }

    pub async fn contains(&self, id: ObserverId) -> bool {
        self.observers.lock().await.contains_key(&id)
    }
}

fn try_deliver(
    id: ObserverId,
    sender: &mpsc::Sender<String>,
    message: &str,
) -> Result<(), DeliveryError> {
    sender.try_send(message.to_owned()).map_err(|e| match e {
        TrySendError::Full(_) => DeliveryError::Lagging(id),
        TrySendError::Closed(_) => DeliveryError::Closed(id),
    })
}

/// WebSocket handler: `GET /ws`.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

/// Runs one observer session until the peer leaves or the registry drops it.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();

    // The registry holds the only sender. Once it prunes this observer the
    // channel closes, the writer below finishes, and the session ends.
    let (tx, mut rx) = mpsc::channel::<String>(state.observer_buffer);
    let observer_id = state.registry.register(tx).await;

    tracing::info!(observer_id = %observer_id, remote_addr = %addr, "observer connected");

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(AxumMessage::Text(msg.into())).await.is_err() {
                return;
            }
        }
        let _ = sender.close().await;
    });

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(AxumMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(observer_id = %observer_id, "websocket read error: {}", e);
                    break;
                }
            },
            _ = &mut send_task => break,
        }
    }

    state.registry.unregister(observer_id).await;
    send_task.abort();

    tracing::info!(observer_id = %observer_id, remote_addr = %addr, "observer disconnected");
}
