//! In-process providers for development and tests.
//!
//! [`EchoProvider`] streams the last user message back token by token;
//! [`ScriptedProvider`] replays pre-built rounds of [`StreamEvent`]s, which
//! is what the orchestrator integration tests drive their scenarios with.

use std::collections::VecDeque;

use parking_lot::Mutex;

use agently_domain::chat::{ChatContent, ChatRole};
use agently_domain::error::Result;
use agently_domain::stream::{BoxStream, StreamEvent, Usage};

use crate::traits::{ChatRequest, LlmCapabilities, LlmProvider};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EchoProvider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Streams the last user message back verbatim. Default dev provider so
/// the gateway is usable without any wire adapter configured.
pub struct EchoProvider {
    id: String,
}

impl EchoProvider {
    pub fn new() -> Self {
        Self::named("echo")
    }

    pub fn named(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Default for EchoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LlmProvider for EchoProvider {
    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let text = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| match &m.content {
                ChatContent::Text(t) => t.clone(),
                parts => parts.all_text(),
            })
            .unwrap_or_default();

        let stream = async_stream::stream! {
            for chunk in text.split_inclusive(' ') {
                yield Ok(StreamEvent::Token { text: chunk.to_string() });
            }
            yield Ok(StreamEvent::Done {
                usage: Some(Usage {
                    prompt_tokens: 0,
                    completion_tokens: text.split_whitespace().count() as u32,
                    total_tokens: text.split_whitespace().count() as u32,
                }),
                finish_reason: Some("stop".into()),
            });
        };
        Ok(Box::pin(stream))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ScriptedProvider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Replays pre-built rounds. Each `chat_stream` call pops the next round;
/// when the script is exhausted it streams an empty final answer.
pub struct ScriptedProvider {
    id: String,
    rounds: Mutex<VecDeque<Vec<StreamEvent>>>,
    capabilities: LlmCapabilities,
}

impl ScriptedProvider {
    pub fn new(rounds: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            id: "scripted".into(),
            rounds: Mutex::new(rounds.into()),
            capabilities: LlmCapabilities::default(),
        }
    }

    pub fn with_parallel_tool_calls(mut self) -> Self {
        self.capabilities.parallel_tool_calls = true;
        self
    }

    /// A round that streams `text` and finishes.
    pub fn text_round(text: &str) -> Vec<StreamEvent> {
        vec![
            StreamEvent::Token {
                text: text.to_string(),
            },
            StreamEvent::Done {
                usage: Some(Usage {
                    prompt_tokens: 1,
                    completion_tokens: 1,
                    total_tokens: 2,
                }),
                finish_reason: Some("stop".into()),
            },
        ]
    }

    /// A round that plans one tool call.
    pub fn tool_round(call_id: &str, tool: &str, args: serde_json::Value) -> Vec<StreamEvent> {
        vec![
            StreamEvent::ToolCallStarted {
                call_id: call_id.to_string(),
                tool_name: tool.to_string(),
            },
            StreamEvent::ToolCallFinished {
                call_id: call_id.to_string(),
                tool_name: tool.to_string(),
                arguments: args,
            },
            StreamEvent::Done {
                usage: None,
                finish_reason: Some("tool_calls".into()),
            },
        ]
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat_stream(
        &self,
        _req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let round = self
            .rounds
            .lock()
            .pop_front()
            .unwrap_or_else(|| Self::text_round(""));

        let stream = async_stream::stream! {
            for event in round {
                yield Ok(event);
            }
        };
        Ok(Box::pin(stream))
    }

    fn capabilities(&self) -> LlmCapabilities {
        self.capabilities
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agently_domain::chat::ChatMessage;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn echo_streams_last_user_message() {
        let provider = EchoProvider::new();
        let req = ChatRequest {
            messages: vec![ChatMessage::user("hello world")],
            ..Default::default()
        };
        let mut stream = provider.chat_stream(req).await.unwrap();
        let mut text = String::new();
        let mut done = false;
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                StreamEvent::Token { text: t } => text.push_str(&t),
                StreamEvent::Done { .. } => done = true,
                _ => {}
            }
        }
        assert_eq!(text, "hello world");
        assert!(done);
    }

    #[tokio::test]
    async fn scripted_pops_rounds_in_order() {
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::tool_round("c1", "math:add", serde_json::json!({"a": 2, "b": 3})),
            ScriptedProvider::text_round("the sum is 5"),
        ]);

        let mut first = provider.chat_stream(ChatRequest::default()).await.unwrap();
        let mut saw_tool = false;
        while let Some(event) = first.next().await {
            if matches!(event.unwrap(), StreamEvent::ToolCallFinished { .. }) {
                saw_tool = true;
            }
        }
        assert!(saw_tool);

        let mut second = provider.chat_stream(ChatRequest::default()).await.unwrap();
        let mut text = String::new();
        while let Some(event) = second.next().await {
            if let StreamEvent::Token { text: t } = event.unwrap() {
                text.push_str(&t);
            }
        }
        assert_eq!(text, "the sum is 5");
    }
}
