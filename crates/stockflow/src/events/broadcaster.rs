use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use uuid::Uuid;

use crate::events::frame::{self, Connected, Frame, Heartbeat};

pub type ObserverId = Uuid;

/// `tokio::time::interval` rejects a zero period.
const MIN_HEARTBEAT: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("observer channel closed")]
    Closed,
    #[error("observer channel full")]
    Full,
}

/// Write side of one connected listener. A failed write means the listener
/// is gone (or hopelessly behind) and gets pruned.
pub trait ObserverChannel: Send + Sync {
    fn write(&self, frame: &Frame) -> Result<(), ChannelError>;
}

impl ObserverChannel for mpsc::Sender<Frame> {
    fn write(&self, frame: &Frame) -> Result<(), ChannelError> {
        self.try_send(frame.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::Full,
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
        })
    }
}

#[derive(Default)]
struct Inner {
    observers: Mutex<HashMap<ObserverId, Arc<dyn ObserverChannel>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the lock cannot leave the map half-written.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fans named events out to every connected observer.
#[derive(Clone, Default)]
pub struct EventBroadcaster {
    inner: Arc<Inner>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&self, channel: Arc<dyn ObserverChannel>) -> ObserverId {
        let id = Uuid::new_v4();
        lock(&self.inner.observers).insert(id, channel);
        tracing::debug!(observer_id = %id, "observer connected");
        id
    }

    pub fn remove_observer(&self, id: ObserverId) {
        if lock(&self.inner.observers).remove(&id).is_some() {
            tracing::debug!(observer_id = %id, "observer removed");
        }
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.inner.observers).len()
    }

    /// Write one frame to every observer and return how many accepted it.
    /// Observers whose write fails are dropped; the rest still get the frame.
    pub fn broadcast<T: Serialize + ?Sized>(&self, event: &str, data: &T) -> usize {
        let frame = match Frame::json(event, data) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(event, error = %e, "failed to serialize event payload");
                return 0;
            }
        };

        // Snapshot so writes (and removals) happen outside the lock.
        let snapshot: Vec<(ObserverId, Arc<dyn ObserverChannel>)> = lock(&self.inner.observers)
            .iter()
            .map(|(id, ch)| (*id, Arc::clone(ch)))
            .collect();

        let mut delivered = 0;
        for (id, channel) in snapshot {
            match channel.write(&frame) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(observer_id = %id, event, error = %e, "dropping observer");
                    self.remove_observer(id);
                }
            }
        }
        delivered
    }

    /// Drop every observer. Streams handed out by `subscribe` end once their
    /// buffered frames are read.
    pub fn close_all(&self) -> usize {
        let closed = std::mem::take(&mut *lock(&self.inner.observers)).len();
        if closed > 0 {
            tracing::info!(closed, "closed all observers");
        }
        closed
    }

    /// Register a buffered channel and hand back the receiving end as a
    /// stream. The first frame on it is `connected` with the new id.
    pub fn subscribe(&self, buffer: usize) -> Subscription {
        let (tx, rx) = mpsc::channel::<Frame>(buffer.max(1));
        let id = Uuid::new_v4();

        // The greeting is queued before the observer is visible to
        // `broadcast`, so nothing can overtake it.
        match Frame::json(frame::EVENT_CONNECTED, &Connected { client_id: id }) {
            Ok(hello) => {
                if let Err(e) = tx.write(&hello) {
                    tracing::warn!(observer_id = %id, error = %e, "failed to greet observer");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize connected event"),
        }

        lock(&self.inner.observers).insert(id, Arc::new(tx));
        tracing::debug!(observer_id = %id, "observer connected");

        Subscription {
            id,
            rx: ReceiverStream::new(rx),
            broadcaster: Arc::downgrade(&self.inner),
        }
    }

    /// Start (or restart) the periodic heartbeat. The first beat fires one
    /// interval after the call. Intervals below 1ms are raised to 1ms.
    pub fn start_heartbeat(&self, interval: Duration) {
        let interval = interval.max(MIN_HEARTBEAT);
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                EventBroadcaster { inner }.broadcast(frame::EVENT_HEARTBEAT, &Heartbeat::at(Utc::now()));
            }
        });

        if let Some(previous) = lock(&self.inner.heartbeat).replace(task) {
            previous.abort();
        }
        tracing::info!(interval_ms = interval.as_millis() as u64, "heartbeat started");
    }

    pub fn stop_heartbeat(&self) {
        if let Some(task) = lock(&self.inner.heartbeat).take() {
            task.abort();
            tracing::info!("heartbeat stopped");
        }
    }
}

/// Receiving end of one observer. Dropping it (client disconnected)
/// removes the observer right away.
pub struct Subscription {
    id: ObserverId,
    rx: ReceiverStream<Frame>,
    broadcaster: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> ObserverId {
        self.id
    }
}

impl Stream for Subscription {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.broadcaster.upgrade() {
            EventBroadcaster { inner }.remove_observer(self.id);
        }
    }
}
