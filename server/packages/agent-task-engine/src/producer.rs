//! Line-stream producer: reads agent stdout, parses one JSON object per line and
//! publishes each parsed line to every subscriber.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

/// A parsed stdout line. Lines that are not valid JSON are kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum LinePayload {
    Json(Value),
    Raw { text: String, error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub sequence: u64,
    pub received_at: DateTime<Utc>,
    pub payload: LinePayload,
}

impl StreamMessage {
    pub fn new(sequence: u64, payload: LinePayload) -> Self {
        Self {
            sequence,
            received_at: Utc::now(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProducerSummary {
    pub lines: u64,
    pub invalid_lines: u64,
}

/// Single producer per execution. Each subscriber owns an unbounded queue, so a
/// slow reader neither blocks the producer nor loses messages, and a dropped
/// reader does not affect the others.
#[derive(Debug)]
pub struct LineProducer {
    execution_id: String,
    subscribers: Vec<mpsc::UnboundedSender<StreamMessage>>,
}

impl LineProducer {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            subscribers: Vec::new(),
        }
    }

    /// Subscriptions must be taken before `run`; they see every line from the first.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<StreamMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub async fn run<R>(mut self, reader: R) -> ProducerSummary
    where
        R: AsyncRead + Unpin,
    {
        let started = Instant::now();
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut summary = ProducerSummary::default();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(
                        execution_id = %self.execution_id,
                        error = %err,
                        "agent stdout: read failed"
                    );
                    break;
                }
            }

            let line = String::from_utf8_lossy(&buf);
            let Some(payload) = parse_line(&line) else {
                continue;
            };

            summary.lines += 1;
            if summary.lines == 1 {
                tracing::info!(
                    execution_id = %self.execution_id,
                    first_stdout_ms = started.elapsed().as_millis() as u64,
                    "agent process: first stdout line received"
                );
            }
            if let LinePayload::Raw { error, .. } = &payload {
                summary.invalid_lines += 1;
                tracing::debug!(
                    execution_id = %self.execution_id,
                    line_number = summary.lines,
                    error = %error,
                    "agent stdout: invalid JSON, keeping raw text"
                );
            }

            self.publish(StreamMessage::new(summary.lines, payload));
        }

        tracing::debug!(
            execution_id = %self.execution_id,
            total_lines = summary.lines,
            invalid_lines = summary.invalid_lines,
            age_ms = started.elapsed().as_millis() as u64,
            "agent stdout: stream ended"
        );
        summary
    }

    fn publish(&mut self, message: StreamMessage) {
        self.subscribers
            .retain(|subscriber| subscriber.send(message.clone()).is_ok());
    }
}

/// Parses one stdout line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Option<LinePayload> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => LinePayload::Json(value),
        Err(err) => LinePayload::Raw {
            text: trimmed.to_string(),
            error: err.to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_is_lenient() {
        assert_eq!(parse_line("   \n"), None);
        assert_eq!(
            parse_line("{\"type\":\"system\"}\n"),
            Some(LinePayload::Json(serde_json::json!({"type": "system"})))
        );
        match parse_line("not json") {
            Some(LinePayload::Raw { text, .. }) => assert_eq!(text, "not json"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_line_in_order() {
        let input = b"{\"a\":1}\n\ngarbage\n{\"a\":2}".to_vec();
        let mut producer = LineProducer::new("exec-test");
        let mut first = producer.subscribe();
        let mut second = producer.subscribe();

        let summary = producer.run(&input[..]).await;
        assert_eq!(summary.lines, 3);
        assert_eq!(summary.invalid_lines, 1);

        for rx in [&mut first, &mut second] {
            let mut sequences = Vec::new();
            while let Some(message) = rx.recv().await {
                sequences.push(message.sequence);
            }
            assert_eq!(sequences, vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_affect_others() {
        let input = b"{\"a\":1}\n{\"a\":2}\n".to_vec();
        let mut producer = LineProducer::new("exec-test");
        let dropped = producer.subscribe();
        let mut kept = producer.subscribe();
        drop(dropped);

        producer.run(&input[..]).await;
        let mut count = 0;
        while kept.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }
}
