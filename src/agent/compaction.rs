//! Summarizes older turns into a single prepended block when the context
//! budget is exceeded. Grounded on the teacher's `agent/compaction.rs`
//! (`MessageCompactor`), narrowed to the single summarize-then-prepend
//! shape `spec.md` §4.4 step 3 calls for.

use std::sync::Arc;

use crate::providers::base::{ChatRequest, LLMProvider, Message};

const COMPACTION_PROMPT: &str = "Summarize the following conversation turns concisely, preserving key \
decisions, facts, names, dates, and pending commitments. Write a plain \
paragraph (no preamble), at most 300 words.\n\nTurns:\n{turns}";

const KEEP_TAIL_TURNS: usize = 6;

pub struct MessageCompactor {
    provider: Arc<dyn LLMProvider>,
    model: Option<String>,
}

impl MessageCompactor {
    pub fn new(provider: Arc<dyn LLMProvider>, model: Option<String>) -> Self {
        MessageCompactor { provider, model }
    }

    /// Splits `history` into an older head (summarized) and a recent tail
    /// (kept verbatim), returning `[summary_message, ...tail]`.
    pub async fn compact(&self, history: &[Message]) -> anyhow::Result<Vec<Message>> {
        if history.len() <= KEEP_TAIL_TURNS {
            return Ok(history.to_vec());
        }
        let split_at = history.len() - KEEP_TAIL_TURNS;
        let (head, tail) = history.split_at(split_at);

        let rendered = head.iter().map(|m| format!("{}: {}", m.role, m.content)).collect::<Vec<_>>().join("\n");
        let prompt = COMPACTION_PROMPT.replace("{turns}", &rendered);

        let response = self
            .provider
            .chat(ChatRequest { messages: vec![Message::user(prompt)], tools: None, model: self.model.as_deref(), max_tokens: 600, temperature: 0.2, tool_choice: None })
            .await?;

        let summary = response.content.unwrap_or_default();
        let mut out = vec![Message::system(format!("[Resumo de turnos anteriores]\n{summary}"))];
        out.extend_from_slice(tail);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct EchoProvider;
    #[async_trait]
    impl LLMProvider for EchoProvider {
        async fn chat(&self, _req: ChatRequest<'_>) -> anyhow::Result<crate::providers::base::LLMResponse> {
            Ok(crate::providers::base::LLMResponse { content: Some("resumo breve".to_string()), ..Default::default() })
        }
        fn default_model(&self) -> &str {
            "test-model"
        }
    }

    #[tokio::test]
    async fn short_history_is_left_untouched() {
        let compactor = MessageCompactor::new(Arc::new(EchoProvider), None);
        let history = vec![Message::user("oi")];
        let result = compactor.compact(&history).await.unwrap();
        assert_eq!(result, history);
    }

    #[tokio::test]
    async fn long_history_is_summarized_with_tail_kept() {
        let compactor = MessageCompactor::new(Arc::new(EchoProvider), None);
        let history: Vec<Message> = (0..20).map(|i| Message::user(format!("turno {i}"))).collect();
        let result = compactor.compact(&history).await.unwrap();
        assert_eq!(result.len(), KEEP_TAIL_TURNS + 1);
        assert!(result[0].content.contains("resumo breve"));
        assert_eq!(result.last().unwrap().content, "turno 19");
    }
}
