use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub session_id: String,
    pub channel: String,
    pub sender_id: String,
    pub text: String,
    pub thread_id: Option<String>,
    pub is_dm: bool,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub session_id: String,
    pub channel: String,
    pub target: String,
    pub text: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingEdit {
    pub session_id: String,
    pub delta: String,
    pub done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_message_round_trips_through_json() {
        let msg = InboundMessage {
            session_id: "tg_chat_1".to_string(),
            channel: "telegram".to_string(),
            sender_id: "42".to_string(),
            text: "oi".to_string(),
            thread_id: None,
            is_dm: true,
            metadata: serde_json::json!({}),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: InboundMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session_id, msg.session_id);
    }
}
