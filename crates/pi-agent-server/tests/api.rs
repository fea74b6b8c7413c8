use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use futures::stream;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use pi_agent_server::config::Settings;
use pi_agent_server::services::llm_service::{
    FragmentStream, GenerationRequest, LlmProvider, ProviderError,
};
use pi_agent_server::{build_router, AppState};

/// Backend double that replays a fixed script and records every prompt.
struct ScriptedProvider {
    reply: Result<&'static str, &'static str>,
    fragments: Vec<Result<&'static str, &'static str>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn replying(reply: &'static str) -> Self {
        Self {
            reply: Ok(reply),
            fragments: vec![Ok(reply)],
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn streaming(fragments: Vec<Result<&'static str, &'static str>>) -> Self {
        Self {
            reply: Err("not scripted"),
            fragments,
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn failing(message: &'static str) -> Self {
        Self {
            reply: Err(message),
            fragments: vec![Err(message)],
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        self.prompts.lock().push(request.prompt.clone());
        self.reply
            .map(str::to_string)
            .map_err(|e| ProviderError::Backend(e.to_string()))
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<FragmentStream, ProviderError> {
        self.prompts.lock().push(request.prompt.clone());
        let items: Vec<Result<String, ProviderError>> = self
            .fragments
            .iter()
            .map(|item| {
                item.map(str::to_string)
                    .map_err(|e| ProviderError::Backend(e.to_string()))
            })
            .collect();
        Ok(Box::pin(stream::iter(items)))
    }
}

fn app(provider: Arc<ScriptedProvider>) -> (Router, AppState) {
    let state = AppState::with_provider(&Settings::default(), provider).unwrap();
    (build_router(state.clone()), state)
}

fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/chat")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

fn header(response: &axum::response::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[tokio::test]
async fn test_health() {
    let (app, _) = app(Arc::new(ScriptedProvider::replying("hi")));

    let response = app.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_list_agents() {
    let (app, _) = app(Arc::new(ScriptedProvider::replying("hi")));

    let response = app.oneshot(get("/agents")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"agents": ["general"]}));
}

#[tokio::test]
async fn test_chat_reply() {
    let (app, state) = app(Arc::new(ScriptedProvider::replying("hello")));

    let response = app
        .oneshot(chat_request(json!({"message": "Say hi", "agent": "general"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let id_header = header(&response, "x-conversation-id").unwrap();
    let body = body_json(response).await;
    assert_eq!(body["reply"], "hello");
    assert_eq!(body["conversation_id"], id_header.as_str());
    assert_eq!(body["model"], "qwen2.5:3b-instruct");
    assert_eq!(body["provider"], "ollama");
    assert_eq!(state.conversation_store.get(&id_header).len(), 2);
}

#[tokio::test]
async fn test_chat_stream() {
    let provider = Arc::new(ScriptedProvider::streaming(vec![Ok("he"), Ok("llo")]));
    let (app, state) = app(provider);

    let response = app
        .oneshot(chat_request(json!({
            "message": "stream",
            "stream": true,
            "conversation_id": "c-stream"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-conversation-id").as_deref(), Some("c-stream"));
    assert!(header(&response, "content-type").unwrap().starts_with("text/plain"));
    assert_eq!(body_text(response).await, "hello");

    let turns = state.conversation_store.get("c-stream");
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].content, "hello");
}

#[tokio::test]
async fn test_chat_stream_failure_mid_reply_truncates_body() {
    let provider = Arc::new(ScriptedProvider::streaming(vec![
        Ok("partial "),
        Err("network dropped"),
    ]));
    let (app, state) = app(provider);

    let response = app
        .oneshot(chat_request(json!({
            "message": "go",
            "stream": true,
            "conversation_id": "c1"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "partial ");

    let turns = state.conversation_store.get("c1");
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].content, "partial ");
}

#[tokio::test]
async fn test_chat_stream_failure_before_output_is_bad_gateway() {
    let (app, state) = app(Arc::new(ScriptedProvider::failing("model not loaded")));

    let response = app
        .oneshot(chat_request(json!({
            "message": "go",
            "stream": true,
            "conversation_id": "c1"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(response).await["error"], "ProviderError");
    assert!(state.conversation_store.is_empty());
}

#[tokio::test]
async fn test_chat_provider_failure_is_bad_gateway() {
    let (app, state) = app(Arc::new(ScriptedProvider::failing("model not loaded")));

    let response = app
        .oneshot(chat_request(json!({"message": "hi", "conversation_id": "c1"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["error"], "ProviderError");
    assert!(body["message"].as_str().unwrap().contains("model not loaded"));
    assert!(state.conversation_store.is_empty());
}

#[tokio::test]
async fn test_chat_unknown_agent() {
    let provider = Arc::new(ScriptedProvider::replying("hi"));
    let (app, _) = app(provider.clone());

    let response = app
        .oneshot(chat_request(json!({"message": "hi", "agent": "planner"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "BadRequest");
    assert!(provider.prompts().is_empty());
}

#[tokio::test]
async fn test_chat_rejects_empty_and_oversized_messages() {
    let provider = Arc::new(ScriptedProvider::replying("hi"));
    let (app, _) = app(provider.clone());

    for message in [String::new(), "x".repeat(4001)] {
        let response = app
            .clone()
            .oneshot(chat_request(json!({"message": message})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(response).await["error"], "ValidationError");
    }
    assert!(provider.prompts().is_empty());
}

#[tokio::test]
async fn test_follow_up_sees_previous_exchange() {
    let provider = Arc::new(ScriptedProvider::replying("Nice to meet you, Ana."));
    let (app, _) = app(provider.clone());

    let first = app
        .clone()
        .oneshot(chat_request(json!({"message": "My name is Ana."})))
        .await
        .unwrap();
    let id = body_json(first).await["conversation_id"]
        .as_str()
        .unwrap()
        .to_string();

    let second = app
        .oneshot(chat_request(json!({
            "message": "What is my name?",
            "conversation_id": id
        })))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(header(&second, "x-conversation-id").as_deref(), Some(id.as_str()));

    let prompts = provider.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("<assistant>"));
    assert!(prompts[1].contains("<user>\nMy name is Ana.\n</user>"));
    assert!(prompts[1].contains("<assistant>\nNice to meet you, Ana.\n</assistant>"));
    assert!(prompts[1].ends_with("<user>\nWhat is my name?\n</user>"));
}

#[tokio::test]
async fn test_readiness_reports_memory() {
    let (app, _) = app(Arc::new(ScriptedProvider::replying("hello")));

    app.clone()
        .oneshot(chat_request(json!({"message": "hi", "conversation_id": "c1"})))
        .await
        .unwrap();

    let response = app.oneshot(get("/health/ready")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ready");
    assert_eq!(body["memory"]["conversations"], 1);
    assert_eq!(body["memory"]["turns"], 2);
    assert_eq!(body["memory"]["max_turns"], 8);
}
