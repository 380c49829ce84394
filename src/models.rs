use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;

use crate::config::Config;

/// Upper bound on a single provider call. Tool RPC and filesystem work are
/// deliberately unbounded; only model calls get a deadline.
const MODEL_CALL_TIMEOUT: Duration = Duration::from_secs(60);

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// One prompt/response exchange. The credential travels with the request
/// because callers may override it per call.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub json_object: bool,
    pub api_key: String,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, req: ChatRequest) -> anyhow::Result<String>;
}

#[derive(Clone)]
pub struct OpenRouterClient {
    base_url: String,
    http: reqwest::Client,
}

impl OpenRouterClient {
    pub fn new() -> anyhow::Result<Self> {
        let base_url =
            std::env::var("OPENROUTER_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let http = reqwest::Client::builder().timeout(MODEL_CALL_TIMEOUT).build()?;
        Ok(Self { base_url, http })
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[async_trait]
impl LanguageModel for OpenRouterClient {
    async fn generate(&self, req: ChatRequest) -> anyhow::Result<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = ChatCompletionRequest {
            model: &req.model,
            messages: vec![
                json!({"role": "system", "content": req.system}),
                json!({"role": "user", "content": req.user}),
            ],
            response_format: req.json_object.then(|| json!({"type": "json_object"})),
        };
        let resp = self.http.post(url).bearer_auth(&req.api_key).json(&body).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("model call failed: {}", resp.status());
        }
        let parsed: ChatCompletionResponse = resp.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("model returned no choices"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    Planner,
    Action,
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOption {
    pub id: String,
    pub label: String,
    pub role: ModelRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCatalog {
    pub models: Vec<ModelOption>,
    pub default_planner: String,
    pub default_action: String,
}

/// Load the selectable-model catalog; when the file is absent or malformed,
/// derive a minimal catalog from the active configuration.
pub fn load_model_catalog(path: &Path, config: &Config) -> ModelCatalog {
    let fallback = ModelCatalog {
        models: vec![
            ModelOption {
                id: config.planner_model.clone(),
                label: config.planner_model.clone(),
                role: ModelRole::Planner,
            },
            ModelOption {
                id: config.action_model.clone(),
                label: config.action_model.clone(),
                role: ModelRole::Action,
            },
        ],
        default_planner: config.planner_model.clone(),
        default_action: config.action_model.clone(),
    };
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or(fallback)
}
