//! Live fan-out of execution entries to stream subscribers.
//!
//! Each execution gets a topic when it is dispatched. The runner publishes
//! every entry it appends to the execution log, so subscribers see the same
//! transcript the record stores, from the moment they attach. Closing the
//! topic sends `stream_end` to each client and drops them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::execution::ExecutionStatus;
use crate::transcript::LogEntry;

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Entry(LogEntry),
    StreamEnd(StreamEnd),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEnd {
    pub execution_id: String,
    pub status: ExecutionStatus,
}

#[derive(Debug, Default)]
struct Topic {
    clients: Vec<mpsc::UnboundedSender<BrokerEvent>>,
}

#[derive(Debug, Clone, Default)]
pub struct StreamBroker {
    topics: Arc<Mutex<HashMap<String, Topic>>>,
}

impl StreamBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the execution already has a topic.
    pub fn open(&self, execution_id: &str) -> bool {
        let mut topics = self.lock();
        if topics.contains_key(execution_id) {
            return false;
        }
        topics.insert(execution_id.to_string(), Topic::default());
        true
    }

    /// Returns `None` when the execution has no live topic.
    pub fn subscribe(&self, execution_id: &str) -> Option<mpsc::UnboundedReceiver<BrokerEvent>> {
        let mut topics = self.lock();
        let topic = topics.get_mut(execution_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        topic.clients.push(tx);
        tracing::debug!(
            execution_id,
            subscribers = topic.clients.len(),
            "stream subscriber attached"
        );
        Some(rx)
    }

    pub fn subscriber_count(&self, execution_id: &str) -> usize {
        self.lock()
            .get_mut(execution_id)
            .map_or(0, |topic| {
                topic.clients.retain(|client| !client.is_closed());
                topic.clients.len()
            })
    }

    pub fn is_open(&self, execution_id: &str) -> bool {
        self.lock().contains_key(execution_id)
    }

    /// Sends entries to every attached client, dropping clients that left.
    pub fn publish(&self, execution_id: &str, entries: &[LogEntry]) {
        let mut topics = self.lock();
        let Some(topic) = topics.get_mut(execution_id) else {
            return;
        };
        topic.clients.retain(|client| {
            entries
                .iter()
                .all(|entry| client.send(BrokerEvent::Entry(entry.clone())).is_ok())
        });
    }

    /// Ends every subscription with `stream_end` and removes the topic.
    pub fn close(&self, execution_id: &str, status: ExecutionStatus) {
        let Some(topic) = self.lock().remove(execution_id) else {
            return;
        };
        let end = StreamEnd {
            execution_id: execution_id.to_string(),
            status,
        };
        for client in &topic.clients {
            let _ = client.send(BrokerEvent::StreamEnd(end.clone()));
        }
        tracing::debug!(
            execution_id,
            status = status.as_str(),
            subscribers = topic.clients.len(),
            "stream closed"
        );
    }

    /// Drops a topic whose execution never started.
    pub fn discard(&self, execution_id: &str) {
        self.lock().remove(execution_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Topic>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::{LinePayload, StreamMessage};
    use crate::transcript::{self, LogEntryData};
    use serde_json::json;

    fn text_entries(sequence: u64, text: &str) -> Vec<LogEntry> {
        transcript::classify(&StreamMessage::new(
            sequence,
            LinePayload::Json(json!({
                "type": "assistant",
                "message": {"content": [{"type": "text", "text": text}]}
            })),
        ))
    }

    fn texts(events: &[BrokerEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                BrokerEvent::Entry(entry) => match &entry.data {
                    LogEntryData::AssistantText { text } => Some(text.clone()),
                    _ => None,
                },
                BrokerEvent::StreamEnd(_) => None,
            })
            .collect()
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<BrokerEvent>) -> Vec<BrokerEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn subscribers_see_entries_then_stream_end_once() {
        let broker = StreamBroker::new();
        assert!(broker.open("e1"));
        assert!(!broker.open("e1"));

        let mut first = broker.subscribe("e1").unwrap();
        broker.publish("e1", &text_entries(1, "one"));
        let mut late = broker.subscribe("e1").unwrap();
        assert_eq!(broker.subscriber_count("e1"), 2);
        broker.publish("e1", &text_entries(2, "two"));
        broker.close("e1", ExecutionStatus::Success);

        let first_events = drain(&mut first).await;
        assert_eq!(texts(&first_events), vec!["one", "two"]);
        let late_events = drain(&mut late).await;
        assert_eq!(texts(&late_events), vec!["two"]);

        for events in [&first_events, &late_events] {
            let ends = events
                .iter()
                .filter(|event| matches!(event, BrokerEvent::StreamEnd(_)))
                .count();
            assert_eq!(ends, 1);
            assert!(matches!(events.last(), Some(BrokerEvent::StreamEnd(end)) if end.status == ExecutionStatus::Success));
        }
        assert!(!broker.is_open("e1"));
        assert!(broker.subscribe("e1").is_none());
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_affect_others() {
        let broker = StreamBroker::new();
        broker.open("e1");

        let gone = broker.subscribe("e1").unwrap();
        let mut kept = broker.subscribe("e1").unwrap();
        drop(gone);
        broker.publish("e1", &text_entries(1, "still here"));
        assert_eq!(broker.subscriber_count("e1"), 1);
        broker.close("e1", ExecutionStatus::Failed);

        let events = drain(&mut kept).await;
        assert_eq!(texts(&events), vec!["still here"]);
        assert_eq!(broker.subscriber_count("e1"), 0);
    }
}
