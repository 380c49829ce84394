use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::error::AppError;
use crate::models::{ChatRequest, LanguageModel};
use crate::paths::is_valid_project_id;
use crate::record::{
    Evidence, LogEntry, LogKind, Message, PipelineState, Role, Step, StepStatus, Submission,
    SubmissionStatus, Summary, now_iso,
};
use crate::rpc::ToolBackend;
use crate::store::ProjectStore;

const PLANNER_SYSTEM_PROMPT: &str = "\
You are a GPU frame-capture planning model.
Given a user question and a capture path, choose exactly one inspection tool to call
from this set: iterate_actions, enumerate_counters, analyze_nan_inf, geometry_anomalies, get_pipeline_state.
Return a JSON object: { \"tool\": \"<name>\", \"arguments\": { ... } }.
The arguments object must be directly usable for the tool.";

const EXPLAINER_SYSTEM_PROMPT: &str = "\
You are a graphics debugging explainer.
Based on the user's question, the chosen tool call, and its JSON result,
explain what you see and what the user should look at next.
Return a concise analysis.";

/// Tool issued to read current pipeline attachment state for evidence.
const PROBE_TOOL: &str = "get_pipeline_state";

/// One diagnostic question against one capture.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnoseRequest {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub capture_path: String,
    pub project_id: Option<String>,
    pub planner_model: Option<String>,
    pub action_model: Option<String>,
    /// Per-request credential override; never persisted.
    pub credential_override: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPlan {
    pub tool: String,
    pub arguments: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnoseOutcome {
    pub plan: ToolPlan,
    pub tool_result: Value,
    pub explanation: String,
    pub submission: Submission,
    pub message: Message,
}

/// Per-stage result. Plan is the only stage that may be fatal; every other
/// stage degrades into data the explainer and the caller still see.
#[derive(Debug)]
pub enum StageOutcome<T> {
    Ok(T),
    Degraded(T),
    Fatal { code: &'static str, detail: String },
}

impl<T> StageOutcome<T> {
    fn into_result(self) -> Result<T, AppError> {
        match self {
            StageOutcome::Ok(value) | StageOutcome::Degraded(value) => Ok(value),
            StageOutcome::Fatal { code, detail } => Err(AppError::Upstream { code, detail }),
        }
    }
}

pub struct DiagnosePipeline {
    model: Arc<dyn LanguageModel>,
    tools: Arc<dyn ToolBackend>,
    store: Arc<dyn ProjectStore>,
}

impl DiagnosePipeline {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        tools: Arc<dyn ToolBackend>,
        store: Arc<dyn ProjectStore>,
    ) -> Self {
        Self { model, tools, store }
    }

    /// Run plan → execute → probe → explain strictly in order, then assemble
    /// and (when a project is attached) persist the submission.
    pub async fn diagnose(
        &self,
        config: &Config,
        req: DiagnoseRequest,
    ) -> Result<DiagnoseOutcome, AppError> {
        if req.question.trim().is_empty() {
            return Err(AppError::Validation("question is required".to_string()));
        }
        if req.capture_path.trim().is_empty() {
            return Err(AppError::Validation("capturePath is required".to_string()));
        }
        let api_key = req
            .credential_override
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| config.api_key.clone())
            .ok_or_else(|| AppError::Upstream {
                code: "planner_failed",
                detail: "model provider credential is not configured".to_string(),
            })?;

        let capture_path =
            self.store.resolve_capture_path(req.project_id.as_deref(), &req.capture_path);

        // Plan: the only stage allowed to abort the request.
        let planner_model =
            req.planner_model.clone().unwrap_or_else(|| config.planner_model.clone());
        let mut plan =
            self.plan(&planner_model, &api_key, &req.question, &capture_path).await.into_result()?;
        if let Some(arguments) = plan.arguments.as_object_mut() {
            arguments.insert("capture_path".to_string(), Value::String(capture_path.clone()));
        }

        // Execute: failures degrade into an ok:false result.
        let tool_result = self.execute(&plan).await.into_result()?;

        // Probe: best effort, independent of the execute outcome.
        let probe_state = match self.probe(&plan, &capture_path).await {
            StageOutcome::Ok(state) => state,
            StageOutcome::Degraded(_) | StageOutcome::Fatal { .. } => None,
        };

        // Explain: failures degrade into inline text.
        let action_model = req.action_model.clone().unwrap_or_else(|| config.action_model.clone());
        let explanation = self
            .explain(&action_model, &api_key, &req.question, &plan, &tool_result)
            .await
            .into_result()?;

        let status = if tool_ok(&tool_result) {
            SubmissionStatus::Resolved
        } else {
            SubmissionStatus::Warning
        };

        let submission = build_submission(&req.question, status, probe_state.as_ref());
        let message =
            build_message(&submission, &plan, &tool_result, probe_state.as_ref(), &explanation);

        if let Some(project_id) = req.project_id.as_deref().filter(|id| is_valid_project_id(id)) {
            match self.store.append_history(project_id, submission.clone(), message.clone()).await {
                Ok(()) => {}
                // An unknown project only skips persistence; the caller
                // still receives the full aggregate.
                Err(AppError::NotFound(_)) => {
                    tracing::warn!(project_id, "diagnosis not persisted; project does not exist");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(DiagnoseOutcome { plan, tool_result, explanation, submission, message })
    }

    async fn plan(
        &self,
        model: &str,
        api_key: &str,
        question: &str,
        capture_path: &str,
    ) -> StageOutcome<ToolPlan> {
        let user = json!({ "question": question, "capture_path": capture_path }).to_string();
        let request = ChatRequest {
            model: model.to_string(),
            system: PLANNER_SYSTEM_PROMPT.to_string(),
            user,
            json_object: true,
            api_key: api_key.to_string(),
        };
        let content = match self.model.generate(request).await {
            Ok(content) => content,
            Err(err) => {
                return StageOutcome::Fatal { code: "planner_failed", detail: err.to_string() };
            }
        };
        let parsed: Value = match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(err) => {
                return StageOutcome::Fatal {
                    code: "planner_failed",
                    detail: format!("planner returned invalid JSON: {err}"),
                };
            }
        };
        let tool = parsed.get("tool").and_then(Value::as_str).unwrap_or_default();
        let arguments = parsed.get("arguments").filter(|args| args.is_object());
        match (tool, arguments) {
            ("", _) | (_, None) => StageOutcome::Fatal {
                code: "planner_invalid_output",
                detail: format!("planner response missing tool or arguments: {parsed}"),
            },
            (tool, Some(arguments)) => StageOutcome::Ok(ToolPlan {
                tool: tool.to_string(),
                arguments: arguments.clone(),
            }),
        }
    }

    /// The plan's arguments already carry the resolved capture path by the
    /// time this runs; see `diagnose`.
    async fn execute(&self, plan: &ToolPlan) -> StageOutcome<Value> {
        match self.tools.call(&plan.tool, plan.arguments.clone()).await {
            Ok(response) => StageOutcome::Ok(response),
            Err(err) => {
                tracing::warn!(tool = %plan.tool, error = %err, "tool execution degraded");
                StageOutcome::Degraded(json!({ "ok": false, "error": err.to_string() }))
            }
        }
    }

    async fn probe(&self, plan: &ToolPlan, capture_path: &str) -> StageOutcome<Option<Value>> {
        let event_id = ["event_id", "eventId", "eventID"]
            .iter()
            .find_map(|key| plan.arguments.get(*key))
            .cloned()
            .unwrap_or(json!(1));
        let arguments = json!({ "capture_path": capture_path, "event_id": event_id });
        match self.tools.call(PROBE_TOOL, arguments).await {
            Ok(response) => {
                StageOutcome::Ok(response.get("result").filter(|r| !r.is_null()).cloned())
            }
            Err(err) => {
                tracing::debug!(error = %err, "pipeline-state probe failed; evidence omitted");
                StageOutcome::Degraded(None)
            }
        }
    }

    async fn explain(
        &self,
        model: &str,
        api_key: &str,
        question: &str,
        plan: &ToolPlan,
        tool_result: &Value,
    ) -> StageOutcome<String> {
        let user = json!({
            "question": question,
            "tool_call": plan,
            "tool_response": tool_result,
        })
        .to_string();
        let request = ChatRequest {
            model: model.to_string(),
            system: EXPLAINER_SYSTEM_PROMPT.to_string(),
            user,
            json_object: false,
            api_key: api_key.to_string(),
        };
        match self.model.generate(request).await {
            Ok(text) => StageOutcome::Ok(text),
            Err(err) => StageOutcome::Degraded(format!("Explainer failed: {err}")),
        }
    }
}

/// Submission status mirrors the tool outcome: an explicit `ok: false` is a
/// warning, anything else resolves.
fn tool_ok(tool_result: &Value) -> bool {
    tool_result.get("ok").and_then(Value::as_bool) != Some(false)
}

fn build_submission(
    question: &str,
    status: SubmissionStatus,
    probe_state: Option<&Value>,
) -> Submission {
    let pipeline_state = probe_state.map(pipeline_state_from_probe).unwrap_or_default();
    Submission {
        id: format!("sub-{}", Uuid::new_v4()),
        timestamp: now_iso(),
        title: question.to_string(),
        status,
        pipeline_state,
        evidence: Evidence::default(),
    }
}

fn pipeline_state_from_probe(value: &Value) -> PipelineState {
    PipelineState {
        highlight_stage: value
            .get("highlightStage")
            .and_then(|v| serde_json::from_value(v.clone()).ok()),
        warning_message: value
            .get("warningMessage")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn build_message(
    submission: &Submission,
    plan: &ToolPlan,
    tool_result: &Value,
    probe_state: Option<&Value>,
    explanation: &str,
) -> Message {
    let mut steps = vec![
        step("plan", format!("Planner selected {}", plan.tool), LogKind::Analysis, raw_json(plan)),
        step("tool", format!("Execute {}", plan.tool), LogKind::Tool, tool_result.to_string()),
    ];
    if let Some(state) = probe_state {
        steps.push(step(
            "canvas",
            "Pipeline attachments collected".to_string(),
            LogKind::Info,
            state.to_string(),
        ));
    }
    steps.push(step(
        "explain",
        "Explanation drafted".to_string(),
        LogKind::Analysis,
        explanation.to_string(),
    ));

    let title = match submission.status {
        SubmissionStatus::Warning => "WARNING",
        _ => "RESOLVED",
    };
    Message {
        id: format!("msg-{}", submission.id),
        role: Role::Agent,
        content: None,
        submission_id: Some(submission.id.clone()),
        status: Some(submission.status),
        steps: Some(steps),
        summary: Some(Summary {
            title: title.to_string(),
            description: explanation.to_string(),
            tag: submission.status.as_tag().to_string(),
        }),
    }
}

fn step(id: &str, title: String, kind: LogKind, content: String) -> Step {
    Step {
        id: id.to_string(),
        title,
        status: StepStatus::Completed,
        logs: vec![LogEntry { kind, content }],
    }
}

fn raw_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
