//! The protocol engine seam.
//!
//! A [`Transport`] owns the socket and the wire protocol; the client only
//! drives its lifecycle and installs [`TransportCallbacks`]. A
//! [`TransportFactory`] builds a fresh transport whenever the client rebinds.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{BoxError, ConnectParams, Message, OutboundMessage, SubscribeOptions};

type LostCallback = Arc<dyn Fn() + Send + Sync>;
type MessageCallback = Arc<dyn Fn(Message) + Send + Sync>;

/// Callback slots a transport invokes for asynchronous events.
#[derive(Clone)]
pub struct TransportCallbacks {
    pub on_connection_lost: LostCallback,
    pub on_message_arrived: MessageCallback,
}

impl TransportCallbacks {
    pub fn new<L, M>(on_connection_lost: L, on_message_arrived: M) -> Self
    where
        L: Fn() + Send + Sync + 'static,
        M: Fn(Message) + Send + Sync + 'static,
    {
        Self {
            on_connection_lost: Arc::new(on_connection_lost),
            on_message_arrived: Arc::new(on_message_arrived),
        }
    }

    /// Callbacks that ignore everything. Installed on a transport before it is
    /// discarded so late events cannot reach the client.
    pub fn noop() -> Self {
        Self::new(|| {}, |_| {})
    }

    pub fn connection_lost(&self) {
        (self.on_connection_lost)();
    }

    pub fn message_arrived(&self, message: Message) {
        (self.on_message_arrived)(message);
    }
}

impl Default for TransportCallbacks {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for TransportCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportCallbacks").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    // -- lifecycle --
    /// Perform the handshake. Resolves once the broker accepted or rejected
    /// the session, or the transport's own timeout elapsed.
    async fn connect(&self, params: ConnectParams) -> Result<(), BoxError>;
    async fn disconnect(&self) -> Result<(), BoxError>;
    /// Best-effort liveness; `None` when the transport cannot tell.
    fn is_connected(&self) -> Option<bool> {
        None
    }

    // -- operations --
    fn send(&self, message: OutboundMessage) -> Result<(), BoxError>;
    fn subscribe(&self, filter: &str, options: SubscribeOptions) -> Result<(), BoxError>;
    fn unsubscribe(&self, filter: &str, options: SubscribeOptions) -> Result<(), BoxError>;

    // -- callbacks --
    /// Replace the installed callbacks.
    fn set_callbacks(&self, callbacks: TransportCallbacks);
}

pub trait TransportFactory: Send + Sync {
    /// Build an unconnected transport for `uri` identified as `client_id`.
    fn create(&self, uri: &str, client_id: &str) -> Result<Arc<dyn Transport>, BoxError>;
}

impl<F> TransportFactory for F
where
    F: Fn(&str, &str) -> Result<Arc<dyn Transport>, BoxError> + Send + Sync,
{
    fn create(&self, uri: &str, client_id: &str) -> Result<Arc<dyn Transport>, BoxError> {
        self(uri, client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callbacks_forward_to_closures() {
        let lost = Arc::new(AtomicUsize::new(0));
        let arrived = Arc::new(AtomicUsize::new(0));
        let (l, a) = (Arc::clone(&lost), Arc::clone(&arrived));
        let callbacks = TransportCallbacks::new(
            move || {
                l.fetch_add(1, Ordering::SeqCst);
            },
            move |msg: Message| {
                assert_eq!(msg.topic, "t");
                a.fetch_add(1, Ordering::SeqCst);
            },
        );
        callbacks.connection_lost();
        callbacks.message_arrived(Message::new("t", "p"));
        callbacks.clone().message_arrived(Message::new("t", "p"));
        assert_eq!(lost.load(Ordering::SeqCst), 1);
        assert_eq!(arrived.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn noop_callbacks_accept_events() {
        let callbacks = TransportCallbacks::default();
        callbacks.connection_lost();
        callbacks.message_arrived(Message::new("t", "p"));
        assert!(format!("{callbacks:?}").contains("TransportCallbacks"));
    }
}
