//! Inbound message dispatch.

use crate::event_bus::{EventBus, is_reserved};
use crate::types::{Event, Message};

/// Emit `data` for every message, then an event named after the topic.
///
/// Topics that collide with a system event name are only visible through
/// `data`.
pub fn route(bus: &EventBus, message: Message) {
    tracing::trace!(topic = %message.topic, bytes = message.payload.len(), "message arrived");
    let topic_event = (!is_reserved(&message.topic)).then(|| Event::Topic {
        topic: message.topic.clone(),
        payload: message.payload.clone(),
    });
    bus.emit(&Event::Data(message));
    if let Some(event) = topic_event {
        bus.emit(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::{CONNECTED, DATA};
    use crate::types::BoxError;
    use std::sync::{Arc, Mutex};

    fn capture(bus: &EventBus, name: &str) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.on(name, move |e: &Event| {
            sink.lock().unwrap().push(e.clone());
            Ok::<(), BoxError>(())
        });
        seen
    }

    #[test]
    fn topic_message_emits_data_and_topic_event() {
        let bus = EventBus::new();
        let data = capture(&bus, DATA);
        let topic = capture(&bus, "sensors/temp");

        route(&bus, Message::new("sensors/temp", "21.5"));

        let data = data.lock().unwrap();
        assert_eq!(data.len(), 1);
        assert!(matches!(&data[0], Event::Data(m) if m.payload_str() == Some("21.5")));
        let topic = topic.lock().unwrap();
        assert_eq!(topic.len(), 1);
        assert!(matches!(&topic[0], Event::Topic { payload, .. } if payload.as_ref() == b"21.5"));
    }

    #[test]
    fn reserved_topic_only_emits_data() {
        let bus = EventBus::new();
        let data = capture(&bus, DATA);
        let connected = capture(&bus, CONNECTED);

        route(&bus, Message::new("connected", "spoof"));

        assert_eq!(data.lock().unwrap().len(), 1);
        assert!(connected.lock().unwrap().is_empty());
    }

    #[test]
    fn data_is_emitted_before_topic_event() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in [DATA, "a/b"] {
            let order = Arc::clone(&order);
            bus.on(name, move |e: &Event| {
                order.lock().unwrap().push(e.name().to_string());
                Ok::<(), BoxError>(())
            });
        }
        route(&bus, Message::new("a/b", "x"));
        assert_eq!(*order.lock().unwrap(), vec!["data", "a/b"]);
    }
}
