//! Ingress: validates raw events, derives the visitor pseudonym, and
//! offers the event to the worker queue. Never blocks the HTTP path and
//! never returns an error to it; failures are counted and logged.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::event::{parse_event, visitor_id, Event, RawEvent};
use crate::metrics_consts::INGESTED_EVENTS;
use crate::prometheus::report_event_error;
use crate::queue::QueueSender;
use crate::salt::Salter;

#[async_trait]
pub trait EventSaver: Send + Sync {
    async fn save_event(&self, raw: RawEvent);
}

pub struct AsyncEventSaver {
    queue: QueueSender<Event>,
    salter: Arc<dyn Salter>,
    valid_event_names: Vec<String>,
}

impl AsyncEventSaver {
    pub fn new(
        queue: QueueSender<Event>,
        salter: Arc<dyn Salter>,
        valid_event_names: Vec<String>,
    ) -> Self {
        AsyncEventSaver {
            queue,
            salter,
            valid_event_names,
        }
    }
}

#[async_trait]
impl EventSaver for AsyncEventSaver {
    async fn save_event(&self, raw: RawEvent) {
        let mut event = match parse_event(raw, &self.valid_event_names) {
            Ok(event) => event,
            Err(err) => {
                report_event_error("parse");
                debug!(error = %err, "error parsing event");
                return;
            }
        };

        let salt = match self.salter.get_salt().await {
            Ok(salt) => salt,
            Err(err) => {
                // The error still carries the last-known salt; keep going.
                report_event_error("salt");
                warn!(error = %err, "error getting salt from db, using old salt");
                err.salt
            }
        };
        event.visitor_id = visitor_id(&salt, &event);

        counter!(INGESTED_EVENTS, "domain" => event.domain.clone()).increment(1);

        if let Err(err) = self.queue.try_send(event) {
            report_event_error("enqueue");
            info!(error = %err, "error queueing event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue;
    use crate::salt::SaltError;

    struct FixedSalter(String);

    #[async_trait]
    impl Salter for FixedSalter {
        async fn get_salt(&self) -> Result<String, SaltError> {
            Ok(self.0.clone())
        }
    }

    fn saver_with_capacity(capacity: usize) -> (AsyncEventSaver, queue::QueueReceiver<Event>) {
        let (tx, rx) = queue::bounded(capacity);
        let saver = AsyncEventSaver::new(
            tx,
            Arc::new(FixedSalter("salt".to_string())),
            vec!["load".to_string(), "ping".to_string()],
        );
        (saver, rx)
    }

    fn load_event() -> RawEvent {
        RawEvent {
            name: "load".to_string(),
            location: "http://www.example.com/docs".to_string(),
            client_ip: "203.0.113.9".to_string(),
            user_agent: "Mozilla/5.0".to_string(),
            ..RawEvent::default()
        }
    }

    #[tokio::test]
    async fn queues_a_parsed_event_with_visitor_id() {
        let (saver, mut rx) = saver_with_capacity(4);
        saver.save_event(load_event()).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.domain, "example.com");
        assert_eq!(event.path, "/docs");
        assert!(!event.visitor_id.is_empty());
    }

    #[tokio::test]
    async fn drops_events_with_invalid_names() {
        let (saver, rx) = saver_with_capacity(4);
        let mut raw = load_event();
        raw.name = "clicked".to_string();
        saver.save_event(raw).await;
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn drops_when_the_queue_is_full() {
        let (saver, rx) = saver_with_capacity(1);
        saver.save_event(load_event()).await;
        saver.save_event(load_event()).await;
        assert_eq!(rx.len(), 1);
    }
}
