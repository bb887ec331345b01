//! GansAuditor_Codex MCP server implementation.
//!
//! Exposes the synchronous audit workflow as a single `audit` tool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use rmcp::{
    ServerHandler, handler::server::router::tool::ToolRouter,
    model::{CallToolResult, Content, ErrorData, Implementation, Role, ServerCapabilities, ServerInfo},
    schemars::JsonSchema,
    tool, tool_handler, tool_router,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::completion::evaluate;
use crate::config::{Config, ThresholdConfig};
use crate::error::GanError;
use crate::judge::JudgeDriver;
use crate::observability::{ObservabilityPipe, Stream};
use crate::orchestrator::{AuditResponse, Orchestrator};
use crate::session::{AuditScope, ConfigOverride, Submission};
use crate::session_store::SessionStore;

/// Parameters for the `audit` tool, mirroring the RPC payload in spec §6.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct AuditParams {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub thought: String,
    #[serde(rename = "thoughtNumber")]
    pub thought_number: u32,
    #[serde(rename = "totalThoughts")]
    pub total_thoughts: u32,
    #[serde(rename = "branchId")]
    pub branch_id: Option<String>,
    #[serde(rename = "loopId")]
    pub loop_id: Option<String>,
    pub config: Option<ConfigOverride>,
}

static GAN_CONFIG_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```gan-config\s*\n([\s\S]*?)```").unwrap());

/// Parse the `gan-config` fenced block from a thought body (spec §6).
/// Invalid values are dropped rather than clamped; the caller applies
/// session defaults in their place and forwards `warnings` to observability.
fn extract_inline_config(thought: &str, bounds: &ThresholdConfig, warnings: &mut Vec<String>) -> Option<ConfigOverride> {
    let block = GAN_CONFIG_FENCE.captures(thought)?.get(1)?.as_str().to_string();
    let raw: serde_yaml::Value = match serde_yaml::from_str(&block) {
        Ok(v) => v,
        Err(e) => {
            warnings.push(format!("gan-config block is not valid YAML: {e}"));
            return None;
        }
    };

    let mut cfg = ConfigOverride::default();

    if let Some(task) = raw.get("task").and_then(|v| v.as_str()) {
        cfg.task = Some(task.to_string());
    }

    if let Some(v) = raw.get("threshold") {
        match v.as_u64() {
            Some(t) if (bounds.inline_threshold_min as u64..=bounds.inline_threshold_max as u64).contains(&t) => {
                cfg.threshold = Some(t as u8);
            }
            _ => warnings.push(format!("gan-config threshold {v:?} out of range, ignoring")),
        }
    }

    if let Some(v) = raw.get("maxCycles") {
        match v.as_u64() {
            Some(n) if (1..=bounds.inline_max_cycles_max as u64).contains(&n) => {
                cfg.max_cycles = Some(n as u32);
            }
            _ => warnings.push(format!("gan-config maxCycles {v:?} out of range, ignoring")),
        }
    }

    if let Some(v) = raw.get("scope").and_then(|v| v.as_str()) {
        cfg.scope = match v {
            "diff" => Some(AuditScope::Diff),
            "paths" => Some(AuditScope::Paths),
            "workspace" => Some(AuditScope::Workspace),
            other => {
                warnings.push(format!("gan-config scope '{other}' unrecognized, ignoring"));
                None
            }
        };
    }

    if let Some(seq) = raw.get("paths").and_then(|v| v.as_sequence()) {
        cfg.paths = Some(seq.iter().filter_map(|p| p.as_str().map(String::from)).collect());
    }

    Some(cfg)
}

fn merge_overrides(inline: Option<ConfigOverride>, explicit: Option<ConfigOverride>) -> Option<ConfigOverride> {
    match (inline, explicit) {
        (None, None) => None,
        (Some(i), None) => Some(i),
        (None, Some(e)) => Some(e),
        (Some(i), Some(e)) => Some(ConfigOverride {
            task: e.task.or(i.task),
            threshold: e.threshold.or(i.threshold),
            max_cycles: e.max_cycles.or(i.max_cycles),
            scope: e.scope.or(i.scope),
            paths: e.paths.or(i.paths),
        }),
    }
}

/// GansAuditor_Codex MCP server.
#[derive(Clone)]
pub struct GanAuditorServer {
    tool_router: ToolRouter<Self>,
    orchestrator: Arc<Orchestrator>,
    config: Arc<Config>,
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for GanAuditorServer {
    fn get_info(&self) -> ServerInfo {
        let instructions = r#"GansAuditor_Codex: synchronous, iterative, adversarial code-audit workflow.

Submit a candidate change or code artifact as `thought` and receive a structured
review. In synchronous mode the server loops internally: feeding reviewer
feedback back into the session until a tiered quality bar is met, a stagnation
or hard-stop condition fires, or a kill switch trips.

Only one tool is exposed:
- audit: submit one thought for the current sessionId/loopId and receive a Review
  plus completionStatus describing whether the session is done.

A submission's `thought` may carry a fenced ```gan-config block to override
task/threshold/maxCycles/scope/paths for this session.
"#;

        ServerInfo {
            server_info: Implementation {
                name: "gansauditor-codex".to_string(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                title: Some("GansAuditor Codex".to_string()),
                icons: None,
                website_url: None,
            },
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some(instructions.to_string()),
            ..Default::default()
        }
    }
}

#[tool_router(router = tool_router)]
impl GanAuditorServer {
    /// Auto-detect config, apply env overrides, and wire the core.
    pub fn new() -> Self {
        let base_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let config_path = Self::auto_detect_config(&base_dir);
        let config = Config::load_with_env(config_path.as_ref()).unwrap_or_default();
        Self::with_config(config)
    }

    /// Build the server from an already-resolved configuration.
    pub fn with_config(config: Config) -> Self {
        let config = Arc::new(config);

        let session_store = Arc::new(SessionStore::new(
            config.state.state_dir.clone(),
            config.concurrency.max_active_sessions,
            Duration::from_secs(config.state.max_session_age_secs),
            config.thresholds.clone(),
        ));
        let judge = Arc::new(JudgeDriver::new(config.judge.clone()));
        let observability =
            Arc::new(ObservabilityPipe::start(config.state.log_dir.clone(), &config.observability));
        let orchestrator =
            Arc::new(Orchestrator::new(&config, session_store, judge, observability));

        Self { tool_router: Self::tool_router(), orchestrator, config }
    }

    fn auto_detect_config(base_dir: &Path) -> Option<PathBuf> {
        let candidates = [
            base_dir.join(".gansauditor/config.yaml"),
            base_dir.join("gansauditor.yaml"),
            base_dir.join(".gansauditor.yaml"),
            base_dir.join("config/default.yaml"),
        ];
        candidates.into_iter().find(|p| p.exists())
    }

    fn overall_deadline(&self) -> Instant {
        let per_attempt = self.config.concurrency.audit_timeout_ms;
        let attempts = self.config.concurrency.audit_retry_attempts as u64 + 1;
        let queue_allowance_ms = 5_000;
        Instant::now() + Duration::from_millis(per_attempt.saturating_mul(attempts) + queue_allowance_ms)
    }

    /// Submit one thought for audit and return the review plus completion
    /// status (spec §6).
    #[tool(
        name = "audit",
        description = "Submit a thought (candidate change or code artifact) for adversarial review. In synchronous mode, repeated calls with the same sessionId/loopId loop until the session completes. A fenced ```gan-config block in `thought` may override task/threshold/maxCycles/scope/paths for this session."
    )]
    pub async fn audit(
        &self,
        params: rmcp::handler::server::wrapper::Parameters<AuditParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let params = params.0;

        let mut warnings = Vec::new();
        let inline = extract_inline_config(&params.thought, &self.config.thresholds, &mut warnings);
        let effective_config = merge_overrides(inline, params.config.clone());

        if !warnings.is_empty() {
            for w in &warnings {
                warn!(session_id = %params.session_id, "{w}");
            }
            self.orchestrator.observability().log_with_ids(
                Stream::Session,
                "gan_config_override_invalid",
                Some(params.session_id.clone()),
                params.loop_id.clone(),
                None,
                serde_json::json!({"warnings": warnings}),
            );
        }

        let submission = Submission {
            session_id: params.session_id.clone(),
            thought: params.thought,
            thought_number: params.thought_number,
            total_thoughts: params.total_thoughts,
            branch_id: params.branch_id,
            loop_id: params.loop_id,
            config: effective_config.clone(),
        };

        let deadline = self.overall_deadline();
        match self.orchestrator.submit(submission, deadline).await {
            Ok(response) => Ok(success_result(build_response_json(&response, &effective_config, &self.config.thresholds))),
            Err(err) => Ok(success_result(err.to_envelope())),
        }
    }
}

fn success_result(payload: serde_json::Value) -> CallToolResult {
    let text = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string());
    CallToolResult::success(vec![Content::text(text).with_audience(vec![Role::Assistant])])
}

/// Assemble the spec §6 response envelope from an orchestrator response.
fn build_response_json(
    response: &AuditResponse,
    config_override: &Option<ConfigOverride>,
    defaults: &ThresholdConfig,
) -> serde_json::Value {
    let session = &response.session_snapshot;
    let threshold = config_override.as_ref().and_then(|c| c.threshold).unwrap_or(defaults.tier1_score);
    let decision = evaluate(session);

    serde_json::json!({
        "thoughtNumber": session.history.last().map(|it| it.thought_number).unwrap_or(0),
        "totalThoughts": session.history.last().map(|it| it.total_thoughts).unwrap_or(0),
        "nextThoughtNeeded": response.next_thought_needed,
        "sessionId": session.id,
        "review": response.review,
        "completionStatus": {
            "isComplete": session.is_complete,
            "reason": session.completion_reason,
            "currentLoop": session.current_loop,
            "score": session.last_score(),
            "threshold": threshold,
            "decisionReason": decision.reason,
        },
    })
}

impl Default for GanAuditorServer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_valid_gan_config_block() {
        let thought = "do the thing\n```gan-config\nthreshold: 80\nmaxCycles: 5\nscope: diff\n```\nmore text";
        let mut warnings = Vec::new();
        let cfg = extract_inline_config(thought, &ThresholdConfig::default(), &mut warnings).unwrap();
        assert_eq!(cfg.threshold, Some(80));
        assert_eq!(cfg.max_cycles, Some(5));
        assert_eq!(cfg.scope, Some(AuditScope::Diff));
        assert!(warnings.is_empty());
    }

    #[test]
    fn out_of_range_threshold_is_dropped_with_warning() {
        let thought = "```gan-config\nthreshold: 10\n```";
        let mut warnings = Vec::new();
        let cfg = extract_inline_config(thought, &ThresholdConfig::default(), &mut warnings).unwrap();
        assert_eq!(cfg.threshold, None);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn missing_block_returns_none() {
        let mut warnings = Vec::new();
        assert!(extract_inline_config("plain thought, no block", &ThresholdConfig::default(), &mut warnings).is_none());
    }

    #[test]
    fn explicit_config_field_wins_over_inline_block() {
        let inline = Some(ConfigOverride { threshold: Some(60), ..ConfigOverride::default() });
        let explicit = Some(ConfigOverride { threshold: Some(90), ..ConfigOverride::default() });
        let merged = merge_overrides(inline, explicit).unwrap();
        assert_eq!(merged.threshold, Some(90));
    }
}
