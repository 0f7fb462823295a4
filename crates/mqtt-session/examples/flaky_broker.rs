//! Drive a client against an in-memory broker that refuses the first few
//! connects and later drops the session, to watch the retry cycle.
//!
//! ```sh
//! RUST_LOG=mqtt_session=debug cargo run -p mqtt-session --example flaky_broker -- \
//!     --refuse 3 --drop-after 5
//! ```
//!
//! With `--config` the client options are read from a YAML file instead:
//! ```yaml
//! host: broker.local
//! reconnectDelay: [1000, 2000, -1]
//! reportConnectionStatus: true
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

use mqtt_session::{
    BoxError, Client, ClientOptions, ConnectParams, ConnectionConfig, Event, Message,
    OutboundMessage, PublishOptions, ReconnectDelaySetting, StatusSink, SubscribeOptions,
    Transport, TransportCallbacks, TransportFactory,
};

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        write!(w, "[{:02}:{:03}]", d.as_secs(), d.subsec_millis())
    }
}

#[derive(Parser)]
#[command(name = "flaky_broker")]
struct Args {
    /// YAML client options; overrides --delays
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of connect attempts the broker refuses
    #[arg(long, default_value_t = 2)]
    refuse: u32,
    /// Drop the session this many seconds after it connects (0 = never)
    #[arg(long, default_value_t = 0)]
    drop_after: u64,
    /// Retry delays in milliseconds, -1 stops retrying
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true, default_value = "1000,2000")]
    delays: Vec<i64>,
    /// Seconds to run before disconnecting
    #[arg(long, default_value_t = 15)]
    run_for: u64,
}

/// Broker state shared by every transport the factory creates.
struct Broker {
    refuse_remaining: AtomicU32,
}

struct FlakyTransport {
    broker: Arc<Broker>,
    callbacks: Mutex<TransportCallbacks>,
    connected: AtomicBool,
}

impl FlakyTransport {
    fn callbacks(&self) -> TransportCallbacks {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn connect(&self, params: ConnectParams) -> Result<(), BoxError> {
        tracing::debug!(timeout_secs = ?params.timeout_secs, "broker: connect");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let refused = self
            .broker
            .refuse_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err("broker: connection refused".into());
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BoxError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            Ok(())
        } else {
            Err("broker: not connected".into())
        }
    }

    fn is_connected(&self) -> Option<bool> {
        Some(self.connected.load(Ordering::SeqCst))
    }

    fn send(&self, message: OutboundMessage) -> Result<(), BoxError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err("broker: not connected".into());
        }
        // loop the message straight back, as if we were subscribed to it
        self.callbacks()
            .message_arrived(Message::new(message.topic, message.payload));
        Ok(())
    }

    fn subscribe(&self, filter: &str, _options: SubscribeOptions) -> Result<(), BoxError> {
        tracing::debug!(filter, "broker: subscribe");
        Ok(())
    }

    fn unsubscribe(&self, filter: &str, _options: SubscribeOptions) -> Result<(), BoxError> {
        tracing::debug!(filter, "broker: unsubscribe");
        Ok(())
    }

    fn set_callbacks(&self, callbacks: TransportCallbacks) {
        *self.callbacks.lock().unwrap_or_else(|e| e.into_inner()) = callbacks;
    }
}

struct FlakyFactory {
    broker: Arc<Broker>,
    latest: Mutex<Option<Arc<FlakyTransport>>>,
}

impl FlakyFactory {
    /// Simulate the broker closing the current session.
    fn drop_session(&self) {
        let latest = self.latest.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(transport) = latest
            && transport.connected.swap(false, Ordering::SeqCst)
        {
            tracing::info!("broker: dropping session");
            transport.callbacks().connection_lost();
        }
    }
}

impl TransportFactory for FlakyFactory {
    fn create(&self, uri: &str, client_id: &str) -> Result<Arc<dyn Transport>, BoxError> {
        tracing::debug!(uri, client_id, "broker: new transport");
        let transport = Arc::new(FlakyTransport {
            broker: Arc::clone(&self.broker),
            callbacks: Mutex::new(TransportCallbacks::noop()),
            connected: AtomicBool::new(false),
        });
        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&transport));
        Ok(transport)
    }
}

struct Stdout;

impl StatusSink for Stdout {
    fn show(&self, text: &str) {
        println!("status: {text}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => mqtt_session::config::load(path).await?,
        None => ConnectionConfig::from_options(ClientOptions {
            host: Some("broker.local".into()),
            reconnect_delay: Some(ReconnectDelaySetting::Table(args.delays.clone())),
            report_connection_status: true,
            ..Default::default()
        })?,
    };

    let factory = Arc::new(FlakyFactory {
        broker: Arc::new(Broker {
            refuse_remaining: AtomicU32::new(args.refuse),
        }),
        latest: Mutex::new(None),
    });
    let client = Client::with_status_sink(
        config,
        Arc::clone(&factory) as Arc<dyn TransportFactory>,
        Arc::new(Stdout),
    )?;

    let publisher = client.clone();
    client.on("connected", move |_: &Event| {
        publisher.subscribe("demo/#", SubscribeOptions::default());
        publisher.publish("demo/hello", "hello again", PublishOptions::default());
        Ok(())
    });
    client.on("demo/hello", |event: &Event| {
        if let Event::Topic { payload, .. } = event {
            println!("demo/hello: {}", String::from_utf8_lossy(payload));
        }
        Ok(())
    });

    if let Err(e) = client.connect().await {
        tracing::warn!(error = %e, "first connect failed");
    }

    if args.drop_after > 0 {
        let factory = Arc::clone(&factory);
        let drop_after = Duration::from_secs(args.drop_after);
        tokio::spawn(async move {
            tokio::time::sleep(drop_after).await;
            factory.drop_session();
        });
    }

    tokio::time::sleep(Duration::from_secs(args.run_for)).await;
    client.disconnect().await;
    println!("final phase: {}", client.phase());
    Ok(())
}
