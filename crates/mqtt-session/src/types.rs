//! Public types for the mqtt-session crate.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;

use crate::event_bus;

/// A boxed error type for transport and handler failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// MQTT delivery guarantee, passed through to the transport untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn as_u8(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(other),
        }
    }
}

/// A message delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload.
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::default(),
            retained: false,
        }
    }

    /// Payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// A message handed to [`Transport::send`](crate::Transport::send).
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
}

/// Options for [`Client::publish`](crate::Client::publish).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// `None` leaves the transport default (QoS 0).
    pub qos: Option<QoS>,
    pub retained: bool,
}

impl PublishOptions {
    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = Some(qos);
        self
    }

    pub fn retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }

    /// Build options from loosely typed input such as a JSON options object.
    ///
    /// `qos` may be a number or a numeric string; anything that does not
    /// parse to 0, 1 or 2 is ignored. `retained` is read as a truthy value,
    /// falling back to `retain` when `retained` is absent. Non-object input
    /// yields the defaults.
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };
        let qos = obj.get("qos").and_then(parse_qos);
        let retained = match obj.get("retained") {
            Some(v) => truthy(v),
            None => obj.get("retain").is_some_and(truthy),
        };
        Self { qos, retained }
    }
}

fn parse_qos(value: &Value) -> Option<QoS> {
    let n = match value {
        Value::Number(n) => match n.as_u64() {
            Some(u) => u,
            None => {
                let f = n.as_f64()?;
                if !f.is_finite() || f < 0.0 {
                    return None;
                }
                f.trunc() as u64
            }
        },
        Value::String(s) => {
            let digits: String = s
                .trim_start()
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            digits.parse::<u64>().ok()?
        }
        _ => return None,
    };
    let n = u8::try_from(n).ok()?;
    QoS::try_from(n).ok()
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Options for subscribe and unsubscribe requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub qos: QoS,
}

/// Parameters passed to [`Transport::connect`](crate::Transport::connect).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub user_name: Option<String>,
    pub password: Option<String>,
    /// Only set when configured; the transport applies its own default otherwise.
    pub keep_alive_interval: Option<Duration>,
    /// Handshake timeout in whole seconds.
    pub timeout_secs: Option<u64>,
}

/// Events dispatched through the [`EventBus`](crate::EventBus).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Human-readable status text.
    Status(String),
    /// A connect attempt is starting.
    Connecting,
    /// The transport accepted the session.
    Connected,
    /// The session was lost unexpectedly.
    Disconnected,
    /// A caller-initiated disconnect is in progress.
    Disconnect,
    /// A connect attempt failed and a retry has been armed.
    ScheduleReconnect {
        /// The full configured delay table.
        delays: Vec<i64>,
        /// Delay chosen for this retry.
        delay_ms: u64,
    },
    /// Every inbound message.
    Data(Message),
    /// Inbound message re-dispatched under its topic name.
    Topic { topic: String, payload: Bytes },
}

impl Event {
    /// The event name handlers are registered under.
    pub fn name(&self) -> &str {
        match self {
            Event::Status(_) => event_bus::STATUS,
            Event::Connecting => event_bus::CONNECTING,
            Event::Connected => event_bus::CONNECTED,
            Event::Disconnected => event_bus::DISCONNECTED,
            Event::Disconnect => event_bus::DISCONNECT,
            Event::ScheduleReconnect { .. } => event_bus::SCHEDULE_RECONNECT,
            Event::Data(_) => event_bus::DATA,
            Event::Topic { topic, .. } => topic,
        }
    }
}

/// Lifecycle phase of a [`Client`](crate::Client).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    /// Disconnected with a retry countdown armed.
    Reconnecting,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Connecting => "connecting",
            Phase::Connected => "connected",
            Phase::Disconnected => "disconnected",
            Phase::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connect failed: {0}")]
    Connect(BoxError),

    #[error("connect aborted: session was disconnected or replaced")]
    Aborted,

    #[error("transport error: {0}")]
    Transport(BoxError),

    #[error("no Tokio runtime available")]
    Runtime,
}

pub type Result<T> = std::result::Result<T, Error>;
