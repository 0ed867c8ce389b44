use crate::llm::{EngineError, GenerationRequest, LlmBackend};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Generation halts before the model starts a new user turn.
pub const STOP_SEQUENCE: &str = "Human:";

pub const DEFAULT_MAX_TOKENS: i32 = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i32,
}

fn default_max_tokens() -> i32 {
    DEFAULT_MAX_TOKENS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub text: String,
}

/// Build the single-turn completion prompt
pub fn build_prompt(system_prompt: &str, prompt: &str) -> String {
    format!("System: {}\n\nHuman: {}\n\nAssistant:", system_prompt, prompt)
}

/// Run one chat turn against the model and return the trimmed reply.
pub async fn complete(
    llm: &dyn LlmBackend,
    system_prompt: &str,
    request: ChatRequest,
) -> Result<ChatResponse, EngineError> {
    let generation = GenerationRequest {
        prompt: build_prompt(system_prompt, &request.prompt),
        max_tokens: request.max_tokens,
        stop: vec![STOP_SEQUENCE.to_string()],
        echo: false,
    };

    let completion = llm.generate(generation).await?;
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or(EngineError::NoChoices)?;
    debug!("Finished with {:?}", choice.finish_reason);

    Ok(ChatResponse {
        text: choice.text.trim().to_string(),
    })
}
