//! In-process message bus: an mpsc channel carrying inbound messages from
//! adapters to the agent loop, with a per-sender sliding-window rate limit
//! so a single misbehaving channel cannot starve the others.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::bus::events::InboundMessage;

pub struct MessageBus {
    sender: mpsc::Sender<InboundMessage>,
    receiver: mpsc::Receiver<InboundMessage>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        MessageBus { sender, receiver }
    }

    pub fn sender(&self) -> mpsc::Sender<InboundMessage> {
        self.sender.clone()
    }

    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.receiver.recv().await
    }
}

/// Sliding-window rate limiter keyed per sender (e.g. per `session_id`),
/// matching the manager's per-instance inbound throttle.
pub struct RateLimiter {
    window: Duration,
    max_events: usize,
    hits: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_events: usize) -> Self {
        RateLimiter { window, max_events, hits: VecDeque::new() }
    }

    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        while let Some(front) = self.hits.front() {
            if now.duration_since(*front) > self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.hits.len() >= self.max_events {
            return false;
        }
        self.hits.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bus_delivers_in_order() {
        let mut bus = MessageBus::new(8);
        let tx = bus.sender();
        for i in 0..3 {
            tx.send(InboundMessage {
                session_id: format!("s{i}"),
                channel: "telegram".to_string(),
                sender_id: "1".to_string(),
                text: "hi".to_string(),
                thread_id: None,
                is_dm: true,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();
        }
        for i in 0..3 {
            let msg = bus.recv().await.unwrap();
            assert_eq!(msg.session_id, format!("s{i}"));
        }
    }

    #[test]
    fn rate_limiter_blocks_after_max_events() {
        let mut limiter = RateLimiter::new(Duration::from_secs(60), 2);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }
}
