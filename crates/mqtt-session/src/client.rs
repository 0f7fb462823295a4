//! Connection lifecycle: connect, disconnect, loss detection and automatic
//! reconnection.
//!
//! All mutable state lives in one [`State`] behind a mutex that is never held
//! across an `.await` or while event handlers run. Transport callbacks and
//! countdown expiry are the only asynchronous entry points; both check that
//! they still belong to the current transport binding / countdown before
//! touching state.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;

use crate::config::ConnectionConfig;
use crate::event_bus::{EventBus, HandlerId};
use crate::router;
use crate::scheduler::{NextDelay, ReconnectScheduler};
use crate::transport::{Transport, TransportCallbacks, TransportFactory};
use crate::types::{
    BoxError, Error, Event, Message, OutboundMessage, Phase, PublishOptions, Result,
    SubscribeOptions,
};

/// Receives human-readable status text, e.g. to show a notification.
///
/// Only called when [`ConnectionConfig::report_status`] is set; the same text
/// is always emitted as a `status` event.
pub trait StatusSink: Send + Sync {
    fn show(&self, text: &str);
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Manual,
    /// Fired by the countdown with this generation.
    AutoRetry(u64),
    /// Issued by a `reconnect()` task holding this disconnect count.
    Reconnect(u64),
}

enum AfterFailure {
    Ignore,
    Retry(NextDelay),
    Finalize,
    /// `disconnect()` already ran while the attempt was in flight.
    Stopped,
}

struct State {
    phase: Phase,
    connected: bool,
    /// Set by `disconnect()`; a loss or failure while set never reconnects.
    disconnect_normally: bool,
    scheduler: ReconnectScheduler,
    transport: Arc<dyn Transport>,
    /// Bumped on every rebind. Callbacks carry the epoch they were installed for.
    epoch: u64,
    /// Bumped on every `disconnect()`. A pending reconnect stops once it moves.
    disconnects: u64,
}

struct Inner {
    config: ConnectionConfig,
    factory: Arc<dyn TransportFactory>,
    bus: EventBus,
    status_sink: Option<Arc<dyn StatusSink>>,
    runtime: Handle,
    state: Mutex<State>,
}

/// Handle to a managed session. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Create a client and its first transport. Does not connect.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ConnectionConfig, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        Self::build(config, factory, None)
    }

    pub fn with_status_sink(
        config: ConnectionConfig,
        factory: Arc<dyn TransportFactory>,
        sink: Arc<dyn StatusSink>,
    ) -> Result<Self> {
        Self::build(config, factory, Some(sink))
    }

    fn build(
        config: ConnectionConfig,
        factory: Arc<dyn TransportFactory>,
        status_sink: Option<Arc<dyn StatusSink>>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| Error::Runtime)?;
        let transport = factory
            .create(&config.uri, &config.client_id)
            .map_err(Error::Transport)?;
        let scheduler = ReconnectScheduler::new(config.reconnect_delays.clone(), runtime.clone());

        let inner = Arc::new(Inner {
            config,
            factory,
            bus: EventBus::new(),
            status_sink,
            runtime,
            state: Mutex::new(State {
                phase: Phase::Idle,
                connected: false,
                disconnect_normally: false,
                scheduler,
                transport: Arc::clone(&transport),
                epoch: 0,
                disconnects: 0,
            }),
        });
        transport.set_callbacks(inner.callbacks(0));
        tracing::debug!(
            uri = %inner.config.uri,
            client_id = %inner.config.client_id,
            "client created"
        );
        Ok(Self { inner })
    }

    /// Connect the session.
    ///
    /// Resolves once the transport accepts or rejects this attempt. On
    /// failure the error is returned even when a retry has been scheduled;
    /// watch the `connected` event to learn about a later success.
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect(Trigger::Manual).await
    }

    /// Disconnect and cancel any pending retry. Never fails.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    /// Start a fresh connection cycle in the background.
    ///
    /// A connected session is disconnected and connected again; otherwise the
    /// transport is replaced with a new one from the factory before connecting.
    pub fn reconnect(&self) {
        self.inner.reconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state().connected
    }

    /// What the transport itself reports, if it can tell.
    pub fn transport_reports_connected(&self) -> Option<bool> {
        self.inner.transport().is_connected()
    }

    pub fn phase(&self) -> Phase {
        self.inner.state().phase
    }

    /// Cursor into the retry delay table; `None` outside a retry sequence.
    pub fn reconnect_delay_index(&self) -> Option<usize> {
        self.inner.state().scheduler.index()
    }

    pub fn is_reconnect_pending(&self) -> bool {
        self.inner.state().scheduler.is_counting_down()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Publish a message. Failures are reported as a `status` event.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>, options: PublishOptions) {
        let message = OutboundMessage {
            topic: topic.to_string(),
            payload: payload.into(),
            qos: options.qos.unwrap_or_default(),
            retained: options.retained,
        };
        if let Err(e) = self.inner.transport().send(message) {
            tracing::warn!(topic, error = %e, "publish failed");
            self.inner.status(format!("Send failed: {e}"));
        }
    }

    pub fn subscribe(&self, filter: &str, options: SubscribeOptions) {
        if let Err(e) = self.inner.transport().subscribe(filter, options) {
            tracing::warn!(filter, error = %e, "subscribe failed");
            self.inner.status(format!("Subscribe failed: {e}"));
        }
    }

    pub fn unsubscribe(&self, filter: &str, options: SubscribeOptions) {
        if let Err(e) = self.inner.transport().unsubscribe(filter, options) {
            tracing::warn!(filter, error = %e, "unsubscribe failed");
            self.inner.status(format!("Unsubscribe failed: {e}"));
        }
    }

    /// Register a handler for a system event or a message topic.
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&Event) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.inner.bus.on(event, handler)
    }

    pub fn off(&self, event: &str, id: HandlerId) -> bool {
        self.inner.bus.off(event, id)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("uri", &self.inner.config.uri)
            .field("client_id", &self.inner.config.client_id)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.state().transport)
    }

    fn status(&self, text: impl Into<String>) {
        let text = text.into();
        if self.config.report_status
            && let Some(sink) = &self.status_sink
        {
            sink.show(&text);
        }
        self.bus.emit(&Event::Status(text));
    }

    fn callbacks(self: &Arc<Self>, epoch: u64) -> TransportCallbacks {
        let lost = Arc::downgrade(self);
        let arrived = Arc::downgrade(self);
        TransportCallbacks::new(
            move || {
                if let Some(inner) = lost.upgrade() {
                    inner.on_connection_lost(epoch);
                }
            },
            move |message| {
                if let Some(inner) = arrived.upgrade() {
                    inner.on_message_arrived(epoch, message);
                }
            },
        )
    }

    // -----------------------------------------------------------------------
    // Connect
    // -----------------------------------------------------------------------

    async fn connect(self: &Arc<Self>, trigger: Trigger) -> Result<()> {
        let (transport, epoch) = {
            let mut st = self.state();
            match trigger {
                Trigger::Manual | Trigger::Reconnect(_) => {
                    if let Trigger::Reconnect(token) = trigger
                        && st.disconnects != token
                    {
                        tracing::debug!("reconnect superseded by disconnect");
                        return Err(Error::Aborted);
                    }
                    st.disconnect_normally = false;
                    st.scheduler.stop_countdown();
                    st.scheduler.reset();
                    if st.connected {
                        tracing::debug!("connect requested while connected");
                        return Ok(());
                    }
                }
                Trigger::AutoRetry(generation) => {
                    if st.disconnect_normally || st.scheduler.generation() != generation {
                        tracing::debug!(generation, "stale retry skipped");
                        return Err(Error::Aborted);
                    }
                }
            }
            st.phase = Phase::Connecting;
            (Arc::clone(&st.transport), st.epoch)
        };

        self.bus.emit(&Event::Connecting);
        tracing::info!(
            uri = %self.config.uri,
            trigger = ?trigger,
            "connecting"
        );

        match transport.connect(self.config.connect_params()).await {
            Ok(()) => self.connect_succeeded(transport, epoch).await,
            Err(e) => {
                self.connect_failed(epoch, &e).await;
                Err(Error::Connect(e))
            }
        }
    }

    async fn connect_succeeded(&self, transport: Arc<dyn Transport>, epoch: u64) -> Result<()> {
        let abandoned = {
            let mut st = self.state();
            if st.epoch != epoch {
                Some("transport replaced")
            } else if st.disconnect_normally {
                st.connected = false;
                st.phase = Phase::Disconnected;
                Some("disconnect requested")
            } else {
                st.connected = true;
                st.phase = Phase::Connected;
                st.scheduler.reset();
                None
            }
        };

        if let Some(reason) = abandoned {
            tracing::info!(reason, "connect completed after it was abandoned, tearing down");
            if let Err(e) = transport.disconnect().await {
                tracing::debug!(error = %e, "ignoring disconnect error");
            }
            return Err(Error::Aborted);
        }

        tracing::info!(uri = %self.config.uri, "connected");
        self.bus.emit(&Event::Connected);
        self.status("Connected");
        Ok(())
    }

    async fn connect_failed(self: &Arc<Self>, epoch: u64, error: &BoxError) {
        let after = {
            let mut st = self.state();
            if st.epoch != epoch {
                AfterFailure::Ignore
            } else {
                st.connected = false;
                st.phase = Phase::Disconnected;
                if self.config.restore_connection && !st.disconnect_normally {
                    let next = st.scheduler.next_delay();
                    if next.should_retry {
                        self.arm_countdown(&mut st, next.delay());
                        st.phase = Phase::Reconnecting;
                        AfterFailure::Retry(next)
                    } else {
                        AfterFailure::Finalize
                    }
                } else if st.disconnect_normally {
                    AfterFailure::Stopped
                } else {
                    AfterFailure::Finalize
                }
            }
        };

        match after {
            AfterFailure::Ignore => {
                tracing::debug!(error = %error, "ignoring failure from replaced transport");
            }
            AfterFailure::Retry(next) => {
                tracing::warn!(
                    error = %error,
                    index = next.index,
                    delay_ms = next.delay_ms,
                    "connect failed, scheduling reconnect"
                );
                let delays = self.config.reconnect_delays.as_slice().to_vec();
                self.bus.emit(&Event::ScheduleReconnect {
                    delays,
                    delay_ms: u64::try_from(next.delay_ms).unwrap_or(0),
                });
                self.status(format!("Reconnecting in {}s", whole_secs(next.delay())));
            }
            AfterFailure::Stopped => {
                tracing::debug!(error = %error, "connect failed after disconnect");
            }
            AfterFailure::Finalize => {
                tracing::warn!(error = %error, "connect failed, not reconnecting");
                self.disconnect().await;
            }
        }
    }

    /// Caller holds the state lock; the callbacks only run later on the timer task.
    fn arm_countdown(self: &Arc<Self>, st: &mut State, delay: Duration) {
        let ticker = Arc::downgrade(self);
        let expirer = Arc::downgrade(self);
        st.scheduler.start_countdown(
            delay,
            move |remaining| {
                if !remaining.is_zero()
                    && let Some(inner) = ticker.upgrade()
                {
                    inner.status(format!("Reconnecting in {}s", whole_secs(remaining)));
                }
            },
            move |generation| {
                let Some(inner) = expirer.upgrade() else {
                    return;
                };
                let task = Arc::clone(&inner);
                inner.runtime.spawn(async move {
                    if let Err(e) = task.connect(Trigger::AutoRetry(generation)).await {
                        tracing::debug!(error = %e, "retry did not connect");
                    }
                });
            },
        );
    }

    // -----------------------------------------------------------------------
    // Disconnect / reconnect
    // -----------------------------------------------------------------------

    /// Returns the disconnect count this call left behind.
    async fn disconnect(&self) -> u64 {
        let (transport, token) = {
            let mut st = self.state();
            st.scheduler.stop_countdown();
            st.scheduler.reset();
            st.disconnect_normally = true;
            st.connected = false;
            st.phase = Phase::Disconnected;
            st.disconnects = st.disconnects.wrapping_add(1);
            (Arc::clone(&st.transport), st.disconnects)
        };

        self.bus.emit(&Event::Disconnect);
        tracing::info!(uri = %self.config.uri, "disconnecting");
        // A transport that never connected may refuse; teardown still completes.
        if let Err(e) = transport.disconnect().await {
            tracing::debug!(error = %e, "ignoring transport disconnect error");
        }
        self.status("Disconnected");
        token
    }

    fn reconnect(self: &Arc<Self>) {
        let (was_connected, token) = {
            let mut st = self.state();
            st.disconnect_normally = false;
            (st.connected, st.disconnects)
        };

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let superseded = inner.state().disconnects != token;
            if superseded {
                tracing::debug!("reconnect superseded by disconnect");
                return;
            }
            let token = if was_connected {
                // our own disconnect moves the count; a caller's moves it again
                inner.disconnect().await
            } else {
                if let Err(e) = inner.rebind() {
                    tracing::error!(error = %e, "failed to create transport");
                    inner.status(format!("Reconnect failed: {e}"));
                    return;
                }
                token
            };
            if let Err(e) = inner.connect(Trigger::Reconnect(token)).await {
                tracing::debug!(error = %e, "reconnect did not connect");
            }
        });
    }

    /// Replace the transport with a fresh one from the factory.
    fn rebind(self: &Arc<Self>) -> Result<()> {
        let fresh = self
            .factory
            .create(&self.config.uri, &self.config.client_id)
            .map_err(Error::Transport)?;
        let (old, epoch) = {
            let mut st = self.state();
            st.epoch = st.epoch.wrapping_add(1);
            let old = std::mem::replace(&mut st.transport, Arc::clone(&fresh));
            (old, st.epoch)
        };
        old.set_callbacks(TransportCallbacks::noop());
        drop(old);
        fresh.set_callbacks(self.callbacks(epoch));
        tracing::debug!(epoch, "transport replaced");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transport callbacks
    // -----------------------------------------------------------------------

    fn on_connection_lost(self: &Arc<Self>, epoch: u64) {
        let should_reconnect = {
            let mut st = self.state();
            if st.epoch != epoch {
                tracing::debug!(epoch, "ignoring connection loss from replaced transport");
                return;
            }
            st.connected = false;
            st.phase = Phase::Disconnected;
            self.config.restore_connection && !st.disconnect_normally
        };

        tracing::warn!(uri = %self.config.uri, reconnect = should_reconnect, "connection lost");
        self.bus.emit(&Event::Disconnected);
        self.status("Connection lost");
        if should_reconnect {
            self.reconnect();
        }
    }

    fn on_message_arrived(&self, epoch: u64, message: Message) {
        if self.state().epoch != epoch {
            tracing::debug!(
                epoch,
                topic = %message.topic,
                "ignoring message from replaced transport"
            );
            return;
        }
        router::route(&self.bus, message);
    }
}

/// Seconds for status text, rounded up.
fn whole_secs(d: Duration) -> u128 {
    d.as_millis().div_ceil(1000)
}
