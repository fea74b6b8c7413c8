use crate::models::chat::*;
use crate::services::{ChatInput, ChatService};
use crate::utils::error::ApiError;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::debug;
use validator::Validate;

pub async fn chat_handler(
    State(chat_service): State<Arc<ChatService>>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    request
        .validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    if let Some(id) = &request.conversation_id {
        HeaderValue::from_str(id).map_err(|_| {
            ApiError::Validation("conversation_id contains invalid characters".to_string())
        })?;
    }

    if !SUPPORTED_AGENTS.contains(&request.agent.as_str()) {
        return Err(ApiError::BadRequest("unknown agent".to_string()));
    }

    let input = ChatInput {
        message: request.message,
        conversation_id: request.conversation_id,
    };

    // Non-stream path
    if !request.stream {
        let reply = chat_service.reply(input).await?;
        let id_header = conversation_header(&reply.conversation_id)?;
        return Ok(([id_header], Json(ChatResponse::from(reply))).into_response());
    }

    // Stream path: from here on failures only truncate the body
    let reply = chat_service.stream(input).await?;
    let id_header = conversation_header(reply.conversation_id())?;
    debug!("Streaming reply for conversation {}", reply.conversation_id());

    let body = Body::from_stream(reply.map(Ok::<_, Infallible>));

    Ok((
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            ),
            id_header,
        ],
        body,
    )
        .into_response())
}

fn conversation_header(id: &str) -> Result<(HeaderName, HeaderValue), ApiError> {
    let value = HeaderValue::from_str(id)
        .map_err(|e| ApiError::InternalError(format!("Invalid conversation id header: {}", e)))?;
    Ok((HeaderName::from_static(CONVERSATION_ID_HEADER), value))
}
