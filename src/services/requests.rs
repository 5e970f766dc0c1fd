//! Structured tool/request surface.
//!
//! Every operation takes a JSON request and returns
//! `{success, message, data | error}`. Input accepts both camelCase and
//! snake_case field names via serde aliases.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::error::CoreError;
use crate::domain::models::{AgentStatus, CleanupConfig, ObjectiveType};
use crate::domain::ports::AgentFilter;

use super::agent_service::{AgentService, ClaudeConfig, CreateAgentRequest, StaleAgentOptions};
use super::objective_service::{CreateObjectiveRequest, ObjectiveService};
use super::orchestrator::{OrchestrationRequest, Orchestrator};

/// Uniform response envelope.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ToolResponse {
    fn ok(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            error: None,
        }
    }

    fn err(error: &CoreError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            data: None,
            error: Some(json!({ "kind": error.kind(), "detail": error.to_string() })),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::err(&CoreError::InvalidRequest(message.into()))
    }
}

#[derive(Debug, Deserialize)]
struct OrchestrateObjectiveParams {
    title: String,
    objective: String,
    #[serde(alias = "repositoryPath")]
    repository_path: String,
    #[serde(default, alias = "skipResearch")]
    skip_research: bool,
    #[serde(default, alias = "skipMonitor")]
    skip_monitor: bool,
}

#[derive(Debug, Deserialize)]
struct SpawnAgentParams {
    #[serde(alias = "agentType")]
    agent_type: String,
    #[serde(alias = "repositoryPath")]
    repository_path: String,
    #[serde(alias = "objectiveDescription")]
    objective_description: String,
    #[serde(default, alias = "agentName")]
    agent_name: Option<String>,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default, alias = "dependsOn")]
    depends_on: Vec<Uuid>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateObjectiveParams {
    #[serde(alias = "repositoryPath")]
    repository_path: String,
    #[serde(alias = "objectiveType")]
    objective_type: String,
    title: String,
    description: String,
    #[serde(default)]
    priority: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct ListAgentsParams {
    #[serde(default, alias = "repositoryPath")]
    repository_path: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
struct TerminateAgentParams {
    #[serde(alias = "agentIds")]
    agent_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
struct ContinueAgentSessionParams {
    #[serde(alias = "agentId")]
    agent_id: Uuid,
    #[serde(default, alias = "additionalInstructions")]
    additional_instructions: Option<String>,
    #[serde(default, alias = "newObjectiveDescription")]
    new_objective_description: Option<String>,
    #[serde(default = "default_true", alias = "preserveContext")]
    preserve_context: bool,
    #[serde(default, alias = "updateMetadata")]
    update_metadata: Option<Value>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct CleanupStaleAgentsParams {
    #[serde(default, alias = "staleMinutes")]
    stale_minutes: Option<i64>,
    #[serde(default, alias = "dryRun")]
    dry_run: bool,
    #[serde(default, alias = "includeRoomCleanup")]
    include_room_cleanup: bool,
    #[serde(default, alias = "notifyParticipants")]
    notify_participants: bool,
}

pub struct RequestDispatcher {
    orchestrator: Arc<Orchestrator>,
    agents: Arc<AgentService>,
    objectives: Arc<ObjectiveService>,
    cleanup_defaults: CleanupConfig,
}

impl RequestDispatcher {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        agents: Arc<AgentService>,
        objectives: Arc<ObjectiveService>,
        cleanup_defaults: CleanupConfig,
    ) -> Self {
        Self {
            orchestrator,
            agents,
            objectives,
            cleanup_defaults,
        }
    }

    /// Dispatch one operation by name.
    pub async fn dispatch(&self, operation: &str, params: Value) -> ToolResponse {
        match operation {
            "orchestrate_objective" => self.orchestrate_objective(params).await,
            "spawn_agent" => self.spawn_agent(params).await,
            "create_objective" => self.create_objective(params).await,
            "list_agents" => self.list_agents(params).await,
            "terminate_agent" => self.terminate_agent(params).await,
            "continue_agent_session" => self.continue_agent_session(params).await,
            "cleanup_stale_agents" => self.cleanup_stale_agents(params).await,
            other => ToolResponse::bad_request(format!("unknown operation {other:?}")),
        }
    }

    async fn orchestrate_objective(&self, params: Value) -> ToolResponse {
        let params: OrchestrateObjectiveParams = match parse(params) {
            Ok(p) => p,
            Err(response) => return response,
        };
        let request = OrchestrationRequest {
            title: params.title,
            objective: params.objective,
            repository_path: params.repository_path,
            skip_research: params.skip_research,
            skip_monitor: params.skip_monitor,
            max_monitor_ms: None,
        };
        match self.orchestrator.start(request).await {
            Ok(id) => ToolResponse::ok(
                "orchestration started",
                json!({ "orchestration_id": id }),
            ),
            Err(e) => ToolResponse::err(&e),
        }
    }

    async fn spawn_agent(&self, params: Value) -> ToolResponse {
        let params: SpawnAgentParams = match parse(params) {
            Ok(p) => p,
            Err(response) => return response,
        };
        let agent_name = params
            .agent_name
            .unwrap_or_else(|| format!("{}-{}", params.agent_type, Uuid::now_v7().simple()));
        let request = CreateAgentRequest {
            agent_name,
            repository_path: params.repository_path,
            objective_description: params.objective_description.clone(),
            agent_type: Some(params.agent_type),
            capabilities: params.capabilities,
            depends_on: params.depends_on,
            metadata: None,
            auto_create_room: true,
            room_id: None,
            claude_config: ClaudeConfig {
                prompt: params.objective_description,
                model: params.model,
                session_id: None,
                environment_vars: std::collections::HashMap::new(),
                program: "claude".to_string(),
            },
        };
        match self.agents.create_agent(request).await {
            Ok(agent) => ToolResponse::ok(
                format!("agent {} spawned", agent.agent_name),
                json!({ "agent": agent }),
            ),
            Err(e) => ToolResponse::err(&e),
        }
    }

    async fn create_objective(&self, params: Value) -> ToolResponse {
        let params: CreateObjectiveParams = match parse(params) {
            Ok(p) => p,
            Err(response) => return response,
        };
        let Some(objective_type) = ObjectiveType::from_str(&params.objective_type) else {
            return ToolResponse::bad_request(format!(
                "unknown objective_type {:?}",
                params.objective_type
            ));
        };

        let description = if params.description.is_empty() {
            params.title
        } else {
            format!("{}: {}", params.title, params.description)
        };
        let request = CreateObjectiveRequest {
            repository_path: params.repository_path,
            objective_type,
            description,
            priority: params.priority,
            requirements: None,
            parent_objective_id: None,
        };
        match self.objectives.create(request).await {
            Ok(objective) => ToolResponse::ok(
                "objective created",
                json!({ "objective": objective }),
            ),
            Err(e) => ToolResponse::err(&e),
        }
    }

    async fn list_agents(&self, params: Value) -> ToolResponse {
        let params: ListAgentsParams = match parse(params) {
            Ok(p) => p,
            Err(response) => return response,
        };
        let status = match params.status.as_deref() {
            None => None,
            Some(raw) => match AgentStatus::from_str(raw) {
                Some(status) => Some(status),
                None => {
                    return ToolResponse::bad_request(format!("unknown status {raw:?}"));
                }
            },
        };

        let filter = AgentFilter {
            repository_path: params.repository_path,
            status,
            limit: params.limit,
            offset: params.offset,
        };
        match self.agents.list_agents(filter).await {
            Ok(page) => ToolResponse::ok(
                format!("{} agents", page.total),
                json!({
                    "agents": page.data,
                    "total": page.total,
                    "has_more": page.has_more,
                }),
            ),
            Err(e) => ToolResponse::err(&e),
        }
    }

    async fn terminate_agent(&self, params: Value) -> ToolResponse {
        let params: TerminateAgentParams = match parse(params) {
            Ok(p) => p,
            Err(response) => return response,
        };

        let mut terminated = Vec::new();
        let mut failures = Vec::new();
        for agent_id in params.agent_ids {
            match self.agents.terminate(agent_id).await {
                Ok(_) => terminated.push(agent_id),
                Err(e) => failures.push(json!({ "agent_id": agent_id, "error": e.to_string() })),
            }
        }

        if failures.is_empty() {
            ToolResponse::ok(
                format!("{} agents terminated", terminated.len()),
                json!({ "terminated": terminated }),
            )
        } else {
            ToolResponse {
                success: false,
                message: format!(
                    "{} terminated, {} failed",
                    terminated.len(),
                    failures.len()
                ),
                data: Some(json!({ "terminated": terminated })),
                error: Some(Value::Array(failures)),
            }
        }
    }

    async fn continue_agent_session(&self, params: Value) -> ToolResponse {
        let params: ContinueAgentSessionParams = match parse(params) {
            Ok(p) => p,
            Err(response) => return response,
        };
        match self
            .agents
            .continue_agent_session(
                params.agent_id,
                params.additional_instructions.as_deref(),
                params.new_objective_description.as_deref(),
                params.preserve_context,
                params.update_metadata,
            )
            .await
        {
            Ok(agent) => ToolResponse::ok(
                format!("agent {} resumed", agent.agent_name),
                json!({ "agent": agent }),
            ),
            Err(e) => ToolResponse::err(&e),
        }
    }

    async fn cleanup_stale_agents(&self, params: Value) -> ToolResponse {
        let params: CleanupStaleAgentsParams = match parse(params) {
            Ok(p) => p,
            Err(response) => return response,
        };
        let options = StaleAgentOptions {
            stale_minutes: params
                .stale_minutes
                .unwrap_or(self.cleanup_defaults.agent_stale_minutes),
            dry_run: params.dry_run,
            include_room_cleanup: params.include_room_cleanup,
            notify_participants: params.notify_participants,
        };
        match self.agents.cleanup_stale_agents(options).await {
            Ok(summary) => ToolResponse::ok(
                format!("{} agents terminated", summary.terminated_agents),
                json!({ "summary": summary }),
            ),
            Err(e) => ToolResponse::err(&e),
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolResponse> {
    serde_json::from_value(params)
        .map_err(|e| ToolResponse::bad_request(format!("invalid request: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_accept_both_namings() {
        let camel: OrchestrateObjectiveParams = serde_json::from_value(json!({
            "title": "t",
            "objective": "o",
            "repositoryPath": "/r",
        }))
        .unwrap();
        assert_eq!(camel.repository_path, "/r");

        let snake: OrchestrateObjectiveParams = serde_json::from_value(json!({
            "title": "t",
            "objective": "o",
            "repository_path": "/r",
        }))
        .unwrap();
        assert_eq!(snake.repository_path, "/r");
    }

    #[test]
    fn test_missing_required_field_is_reported() {
        let result: Result<OrchestrateObjectiveParams, _> =
            serde_json::from_value(json!({ "title": "t" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_continue_defaults_preserve_context() {
        let params: ContinueAgentSessionParams = serde_json::from_value(json!({
            "agent_id": Uuid::now_v7(),
        }))
        .unwrap();
        assert!(params.preserve_context);
    }
}
