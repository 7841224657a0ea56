use async_trait::async_trait;
use serde_json::Value;

use crate::resilience::OutboundMetrics;

#[derive(Debug, Clone)]
pub struct Health {
    pub running: bool,
    pub detail: String,
}

/// One interface per transport. `send` must route through the adapter's
/// own `OutboundResilience` instance; `process_webhook_payload` is only
/// implemented by HTTP-webhook-driven transports.
#[async_trait]
pub trait BaseChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&mut self) -> anyhow::Result<()>;
    async fn stop(&mut self) -> anyhow::Result<()>;
    async fn send(&mut self, target: &str, text: &str, metadata: Option<Value>) -> anyhow::Result<()>;

    fn health(&self) -> Health;
    fn outbound_metrics_snapshot(&self) -> OutboundMetrics;
    fn circuit_state(&self) -> crate::resilience::CircuitState {
        crate::resilience::CircuitState::Closed
    }

    /// Normalizes a vendor webhook body into `(sender, text, chat_id, is_dm)`
    /// and hands it to the inbound handler. Channels that are not
    /// webhook-driven return `Ok(None)`.
    async fn process_webhook_payload(&mut self, _payload: Value) -> anyhow::Result<Option<WebhookEnvelope>> {
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct WebhookEnvelope {
    pub sender: String,
    pub text: String,
    pub chat_id: String,
    pub is_dm: bool,
    pub thread_id: Option<String>,
}

const TELEGRAM_CHUNK_LIMIT: usize = 4096;
const DEFAULT_CHUNK_LIMIT: usize = 2000;

/// UTF-8-safe chunking of outbound text for transports with a message-size
/// limit: prefers breaking on a paragraph boundary, then a newline, before
/// falling back to a hard character-count cut.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.chars().count() <= limit {
            chunks.push(remaining.to_string());
            break;
        }

        let boundary = find_boundary(remaining, limit);
        let (head, tail) = split_at_char_boundary(remaining, boundary);
        chunks.push(head.trim_end().to_string());
        remaining = tail.trim_start();
    }

    chunks
}

pub fn telegram_chunk_limit() -> usize {
    TELEGRAM_CHUNK_LIMIT
}

pub fn default_chunk_limit() -> usize {
    DEFAULT_CHUNK_LIMIT
}

fn find_boundary(text: &str, limit: usize) -> usize {
    let prefix: String = text.chars().take(limit).collect();
    if let Some(pos) = prefix.rfind("\n\n") {
        return prefix[..pos].chars().count();
    }
    if let Some(pos) = prefix.rfind('\n') {
        return prefix[..pos].chars().count();
    }
    if let Some(pos) = prefix.rfind(' ') {
        return prefix[..pos].chars().count();
    }
    limit
}

fn split_at_char_boundary(text: &str, char_count: usize) -> (&str, &str) {
    match text.char_indices().nth(char_count) {
        Some((byte_idx, _)) => text.split_at(byte_idx),
        None => (text, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_single_chunk() {
        assert_eq!(split_message("hello", 100), vec!["hello".to_string()]);
    }

    #[test]
    fn splits_on_paragraph_boundary() {
        let text = format!("{}\n\n{}", "a".repeat(50), "b".repeat(50));
        let chunks = split_message(&text, 60);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(50));
        assert_eq!(chunks[1], "b".repeat(50));
    }

    #[test]
    fn handles_multibyte_text_without_panicking() {
        let text = "café ".repeat(500);
        let chunks = split_message(&text, 40);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 40);
        }
    }
}
