use axum::Json;

use crate::models::chat::{AgentsResponse, SUPPORTED_AGENTS};

pub async fn list_agents() -> Json<AgentsResponse> {
    Json(AgentsResponse {
        agents: SUPPORTED_AGENTS.iter().map(|a| a.to_string()).collect(),
    })
}
