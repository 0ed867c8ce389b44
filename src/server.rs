use crate::chat::{self, ChatRequest, ChatResponse};
use crate::config::Endpoint;
use crate::llm::{EngineError, LlmBackend};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub llm: Arc<dyn LlmBackend>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("{}", .0.body_text())]
    Body(#[from] JsonRejection),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Body(rejection) => rejection.status(),
        };
        let body = ErrorBody {
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Build the router with one chat route per configured endpoint.
///
/// Every route shares the same handler; the endpoint it serves is bound to
/// the route as an extension.
pub fn router(endpoints: &[Endpoint], llm: Arc<dyn LlmBackend>) -> Router {
    let mut app = Router::new();
    for endpoint in endpoints {
        let bound = Arc::new(endpoint.clone());
        app = app.route(&endpoint.route, post(chat).layer(Extension(bound)));
    }
    app.with_state(AppState { llm })
}

async fn chat(
    State(state): State<AppState>,
    Extension(endpoint): Extension<Arc<Endpoint>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(request) = payload.inspect_err(|e| {
        warn!("Rejected request on {}: {}", endpoint.route, e.body_text());
    })?;

    info!(
        "Chat request on {} ({} chars, max_tokens {})",
        endpoint.route,
        request.prompt.chars().count(),
        request.max_tokens
    );

    match chat::complete(state.llm.as_ref(), &endpoint.system_prompt, request).await {
        Ok(response) => {
            info!(
                "Replied on {} ({} chars)",
                endpoint.route,
                response.text.chars().count()
            );
            Ok(Json(response))
        }
        Err(e) => {
            error!("Generation failed on {}: {}", endpoint.route, e);
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Choice, Completion, FinishReason, GenerationRequest};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Records every call and replies with a fixed text. Fails the calls
    /// whose index is listed in `fail_on`.
    struct Recording {
        reply: String,
        fail_on: Vec<usize>,
        calls: Mutex<Vec<GenerationRequest>>,
        count: AtomicUsize,
    }

    impl Recording {
        fn new(reply: &str) -> Arc<Self> {
            Self::failing_on(reply, &[])
        }

        fn failing_on(reply: &str, fail_on: &[usize]) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                fail_on: fail_on.to_vec(),
                calls: Mutex::new(Vec::new()),
                count: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> Vec<GenerationRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmBackend for Recording {
        async fn generate(&self, request: GenerationRequest) -> Result<Completion, EngineError> {
            let index = self.count.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push(request);
            if self.fail_on.contains(&index) {
                return Err(EngineError::ContextOverflow {
                    prompt: 4096,
                    n_ctx: 2048,
                });
            }
            Ok(Completion {
                choices: vec![Choice {
                    text: self.reply.clone(),
                    finish_reason: FinishReason::Stop,
                }],
            })
        }
    }

    fn endpoint(route: &str, system_prompt: &str) -> Endpoint {
        Endpoint {
            route: route.to_string(),
            system_prompt: system_prompt.to_string(),
        }
    }

    async fn spawn(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_chat_forwards_prompt_and_trims_reply() {
        let llm = Recording::new("\n  Why did the chicken cross the road?  \n");
        let base = spawn(router(&[endpoint("/chat", "You are helpful.")], llm.clone())).await;

        let response = reqwest::Client::new()
            .post(format!("{}/chat", base))
            .json(&json!({"prompt": "Tell me a joke", "max_tokens": 50}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: ChatResponse = response.json().await.unwrap();
        assert_eq!(body.text, "Why did the chicken cross the road?");

        let calls = llm.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].prompt,
            "System: You are helpful.\n\nHuman: Tell me a joke\n\nAssistant:"
        );
        assert_eq!(calls[0].max_tokens, 50);
        assert_eq!(calls[0].stop, vec!["Human:".to_string()]);
        assert!(!calls[0].echo);
    }

    #[tokio::test]
    async fn test_chat_default_max_tokens() {
        let llm = Recording::new("ok");
        let base = spawn(router(&[endpoint("/chat", "sys")], llm.clone())).await;

        let response = reqwest::Client::new()
            .post(format!("{}/chat", base))
            .json(&json!({"prompt": "hi"}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(llm.calls()[0].max_tokens, 100);
    }

    #[tokio::test]
    async fn test_chat_non_ascii_prompt() {
        let llm = Recording::new(" ¡Olé, café! ");
        let base = spawn(router(&[endpoint("/chat", "Réponds en français.")], llm.clone())).await;

        let response = reqwest::Client::new()
            .post(format!("{}/chat", base))
            .json(&json!({"prompt": "naïve 日本語"}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: ChatResponse = response.json().await.unwrap();
        assert_eq!(body.text, "¡Olé, café!");
        assert_eq!(
            llm.calls()[0].prompt,
            "System: Réponds en français.\n\nHuman: naïve 日本語\n\nAssistant:"
        );
    }

    #[tokio::test]
    async fn test_each_route_uses_its_own_system_prompt() {
        let llm = Recording::new("ok");
        let endpoints = [
            endpoint("/chat_rhymes", "Answer in rhymes."),
            endpoint("/chat_sexy", "Be flirtatious."),
        ];
        let base = spawn(router(&endpoints, llm.clone())).await;
        let client = reqwest::Client::new();

        for route in ["/chat_rhymes", "/chat_sexy"] {
            let response = client
                .post(format!("{}{}", base, route))
                .json(&json!({"prompt": "hello"}))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let prompts: Vec<_> = llm.calls().into_iter().map(|c| c.prompt).collect();
        assert_eq!(
            prompts,
            vec![
                "System: Answer in rhymes.\n\nHuman: hello\n\nAssistant:".to_string(),
                "System: Be flirtatious.\n\nHuman: hello\n\nAssistant:".to_string(),
            ]
        );

        let response = client
            .post(format!("{}/chat", base))
            .json(&json!({"prompt": "hello"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_model_failure_returns_500_and_server_keeps_serving() {
        let llm = Recording::failing_on("recovered", &[0]);
        let base = spawn(router(&[endpoint("/chat", "sys")], llm.clone())).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/chat", base))
            .json(&json!({"prompt": "first"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorBody = response.json().await.unwrap();
        assert_eq!(
            body.detail,
            "requested tokens (4096) exceed context window of 2048"
        );

        let response = client
            .post(format!("{}/chat", base))
            .json(&json!({"prompt": "second"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: ChatResponse = response.json().await.unwrap();
        assert_eq!(body.text, "recovered");
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected_before_generation() {
        let llm = Recording::new("unused");
        let base = spawn(router(&[endpoint("/chat", "sys")], llm.clone())).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/chat", base))
            .json(&json!({"max_tokens": 10}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: ErrorBody = response.json().await.unwrap();
        assert!(body.detail.contains("prompt"));

        let response = client
            .post(format!("{}/chat", base))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert!(llm.calls().is_empty());
    }
}
