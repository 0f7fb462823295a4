//! Resilient MQTT session management.
//!
//! Wraps a protocol [`Transport`] with a connection lifecycle: connect and
//! disconnect, detection of unexpected loss, and automatic reconnection
//! driven by a configurable delay table. Lifecycle changes and inbound
//! messages are surfaced as named events.
//!
//! # Features
//! - Retry delay table that wraps around, with `-1` as a stop marker
//! - Per-second "reconnecting in Ns" status updates while waiting
//! - Late callbacks from replaced transports are ignored
//! - Inbound messages dispatched as `data` and under their topic name
//!
//! # Example
//! ```no_run
//! # use std::sync::Arc;
//! # use mqtt_session::TransportFactory;
//! # async fn example(factory: Arc<dyn TransportFactory>) -> mqtt_session::Result<()> {
//! use mqtt_session::{Client, ConnectionConfig, Event, PublishOptions, SubscribeOptions};
//!
//! let config = ConnectionConfig::new("mqtt://broker.local:1883")?;
//! let client = Client::new(config, factory)?;
//!
//! client.on("sensors/temp", |event: &Event| {
//!     if let Event::Topic { payload, .. } = event {
//!         println!("temp: {}", String::from_utf8_lossy(payload));
//!     }
//!     Ok(())
//! });
//! client.connect().await?;
//! client.subscribe("sensors/#", SubscribeOptions::default());
//! client.publish("sensors/hello", "hi", PublishOptions::default());
//! # Ok(())
//! # }
//! ```

mod client;
pub mod config;
pub mod event_bus;
mod router;
pub mod scheduler;
pub mod transport;
mod types;

pub use client::{Client, StatusSink};
pub use config::{ClientOptions, ConnectionConfig, Credentials, ReconnectDelaySetting};
pub use event_bus::{EventBus, HandlerId, RESERVED_EVENTS, is_reserved};
pub use scheduler::{NextDelay, ReconnectDelays, ReconnectScheduler, STOP_SENTINEL};
pub use transport::{Transport, TransportCallbacks, TransportFactory};
pub use types::{
    BoxError, ConnectParams, Error, Event, Message, OutboundMessage, Phase, PublishOptions, QoS,
    Result, SubscribeOptions,
};
