use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::flag::FlagRecord;
use crate::requestor::{build_client, read_json};

const SEMANTIC_PATCH_CONTENT_TYPE: &str =
    "application/json; domain-model=launchdarkly.semanticpatch";

/// One JSON patch operation (`{"op": "replace", "path": "/on", "value": true}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    pub op: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Body of a flag update sent to the management API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatchDocument {
    /// Plain JSON patch, sent as `application/json`.
    JsonPatch(Vec<PatchOperation>),
    /// Instruction list, sent with the semantic patch content type.
    Semantic {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
        #[serde(rename = "environmentKey")]
        environment_key: String,
        instructions: Vec<Value>,
    },
}

impl PatchDocument {
    /// Turn targeting on or off in one environment.
    pub fn toggle(environment_key: &str, on: bool) -> Self {
        let kind = if on { "turnFlagOn" } else { "turnFlagOff" };
        PatchDocument::Semantic {
            comment: None,
            environment_key: environment_key.to_string(),
            instructions: vec![json!({ "kind": kind })],
        }
    }

    pub fn replace(path: &str, value: Value) -> Self {
        PatchDocument::JsonPatch(vec![PatchOperation {
            op: "replace".to_string(),
            path: path.to_string(),
            value: Some(value),
        }])
    }

    pub fn with_comment(self, text: &str) -> Self {
        match self {
            PatchDocument::Semantic {
                environment_key,
                instructions,
                ..
            } => PatchDocument::Semantic {
                comment: Some(text.to_string()),
                environment_key,
                instructions,
            },
            other => other,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            PatchDocument::JsonPatch(_) => "application/json",
            PatchDocument::Semantic { .. } => SEMANTIC_PATCH_CONTENT_TYPE,
        }
    }
}

/// The remote flag management API. Failures carry the HTTP status code.
#[async_trait]
pub trait ManagementApi: Send + Sync {
    async fn get_feature_flag(&self, project_key: &str, flag_key: &str) -> Result<FlagRecord>;

    async fn patch_feature_flag(
        &self,
        project_key: &str,
        flag_key: &str,
        patch: &PatchDocument,
    ) -> Result<FlagRecord>;
}

/// reqwest-backed management API client, authorized by the API access token.
pub struct HttpManagementApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpManagementApi {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            client: build_client(config),
            base_url: config.base_url("/api/v2/flags"),
            token: config.api_token.clone().unwrap_or_default(),
        }
    }

    fn flag_url(&self, project_key: &str, flag_key: &str) -> String {
        format!("{}/{}/{}", self.base_url, project_key, flag_key)
    }
}

#[async_trait]
impl ManagementApi for HttpManagementApi {
    async fn get_feature_flag(&self, project_key: &str, flag_key: &str) -> Result<FlagRecord> {
        let response = self
            .client
            .get(self.flag_url(project_key, flag_key))
            .header("Authorization", &self.token)
            .send()
            .await?;
        read_json(response, flag_key).await
    }

    async fn patch_feature_flag(
        &self,
        project_key: &str,
        flag_key: &str,
        patch: &PatchDocument,
    ) -> Result<FlagRecord> {
        debug!(project = project_key, key = flag_key, "patching flag");
        let body = serde_json::to_vec(patch)
            .map_err(|e| crate::error::FlagSyncError::decode("patch document", e))?;
        let response = self
            .client
            .patch(self.flag_url(project_key, flag_key))
            .header("Authorization", &self.token)
            .header("Content-Type", patch.content_type())
            .body(body)
            .send()
            .await?;
        read_json(response, flag_key).await
    }
}
