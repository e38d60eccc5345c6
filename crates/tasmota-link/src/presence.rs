//! Presence tracking from the `tele/+/LWT` last-will topic.
//!
//! The tracker keeps no per-peer state: every `Online` message emits the peer
//! on the connected channel and every `Offline` message on the disconnected
//! channel, in delivery order. Emission waits for a reader or for the session
//! root token, whichever comes first, so shutdown never wedges the transport's
//! delivery task.

use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use transport_bus::{handler, Bus, BusMessage, Handler, SubscriptionId};

use crate::error::{LinkError, LinkResult};
use crate::subscription::SubscriptionIds;
use crate::topic::{self, PRESENCE_OFFLINE, PRESENCE_ONLINE};

pub const PRESENCE_CHANNEL_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Online,
    Offline,
}

impl Presence {
    /// Classifies a last-will payload; anything but the two sentinels is ignored.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        if payload == PRESENCE_ONLINE.as_bytes() {
            Some(Presence::Online)
        } else if payload == PRESENCE_OFFLINE.as_bytes() {
            Some(Presence::Offline)
        } else {
            None
        }
    }
}

/// Reading end of a presence channel.
///
/// Clones share one queue and compete for events. The sequence ends (`None`)
/// once the owning session has closed.
#[derive(Debug, Clone)]
pub struct PeerEvents {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
}

impl PeerEvents {
    fn new(rx: mpsc::Receiver<String>) -> Self {
        Self {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    pub async fn recv(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }

    /// Returns a queued peer without waiting.
    pub fn try_recv(&self) -> Option<String> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    pub fn into_stream(self) -> impl Stream<Item = String> {
        futures::stream::unfold(self, |events| async move {
            let peer = events.recv().await?;
            Some((peer, events))
        })
    }
}

/// Writing end of a presence channel; closing drops the sender for good.
#[derive(Debug)]
struct Outlet {
    tx: Mutex<Option<mpsc::Sender<String>>>,
}

impl Outlet {
    fn sender(&self) -> Option<mpsc::Sender<String>> {
        self.tx.lock().clone()
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

fn channel() -> (Arc<Outlet>, PeerEvents) {
    let (tx, rx) = mpsc::channel(PRESENCE_CHANNEL_CAPACITY);
    let outlet = Outlet {
        tx: Mutex::new(Some(tx)),
    };
    (Arc::new(outlet), PeerEvents::new(rx))
}

pub struct PresenceTracker {
    bus: Arc<dyn Bus>,
    root: CancellationToken,
    connected: Arc<Outlet>,
    disconnected: Arc<Outlet>,
    connected_events: PeerEvents,
    disconnected_events: PeerEvents,
    subscriptions: Mutex<Vec<(String, SubscriptionId)>>,
}

impl PresenceTracker {
    pub fn new(bus: Arc<dyn Bus>, root: CancellationToken) -> Self {
        let (connected, connected_events) = channel();
        let (disconnected, disconnected_events) = channel();
        Self {
            bus,
            root,
            connected,
            disconnected,
            connected_events,
            disconnected_events,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn connected(&self) -> PeerEvents {
        self.connected_events.clone()
    }

    pub fn disconnected(&self) -> PeerEvents {
        self.disconnected_events.clone()
    }

    /// Subscribes one handler per channel to the presence filter. On failure
    /// any subscription already made is released again.
    pub async fn subscribe(&self, ids: &SubscriptionIds) -> LinkResult<()> {
        let filter = topic::presence_filter();
        let outlets = [
            (Presence::Online, Arc::clone(&self.connected)),
            (Presence::Offline, Arc::clone(&self.disconnected)),
        ];
        for (presence, outlet) in outlets {
            let id = ids.next_id();
            let handler = presence_handler(presence, outlet, self.root.clone());
            if let Err(source) = self.bus.subscribe(&filter, id, handler).await {
                self.unsubscribe().await;
                return Err(LinkError::Setup { filter, source });
            }
            debug!(filter = %filter, subscription_id = id, ?presence, "presence subscription ready");
            self.subscriptions.lock().push((filter.clone(), id));
        }
        Ok(())
    }

    /// Releases every presence subscription, logging failures.
    pub async fn unsubscribe(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for (filter, id) in subscriptions {
            if let Err(err) = self.bus.unsubscribe(&filter, id).await {
                warn!(
                    filter = %filter,
                    subscription_id = id,
                    error = %err,
                    "failed to release presence subscription"
                );
            }
        }
    }

    /// Ends both event sequences. Callers cancel the root token first so no
    /// handler is still waiting to send.
    pub fn close_channels(&self) {
        self.connected.close();
        self.disconnected.close();
    }
}

fn presence_handler(expected: Presence, outlet: Arc<Outlet>, root: CancellationToken) -> Handler {
    handler(move |message: BusMessage| {
        let outlet = Arc::clone(&outlet);
        let root = root.clone();
        async move {
            if Presence::from_payload(&message.payload) != Some(expected) {
                return;
            }
            let Some(peer) = topic::peer_id(&message.topic) else {
                warn!(topic = %message.topic, "presence message without peer id");
                return;
            };
            let Some(tx) = outlet.sender() else {
                trace!(peer, "presence channel closed; event dropped");
                return;
            };
            tokio::select! {
                biased;
                _ = root.cancelled() => {
                    debug!(peer, presence = ?expected, "session shutting down; presence event dropped");
                }
                result = tx.send(peer.to_string()) => {
                    if result.is_err() {
                        trace!(peer, "presence receiver gone");
                    }
                }
            }
        }
    })
}
