// External collaborators: content extraction, artifact rendering, delivery.
// Plain request/response calls; the processor owns timeouts and retries.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AgentError, AgentResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredContent {
    #[serde(default)]
    pub title: Option<String>,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub id: String,
}

#[async_trait]
pub trait ContentExtractor: Send + Sync {
    /// `None` means the text holds nothing worth structuring.
    async fn extract(&self, raw_text: &str) -> AgentResult<Option<StructuredContent>>;
}

#[async_trait]
pub trait ArtifactRenderer: Send + Sync {
    async fn render(&self, content: &StructuredContent) -> AgentResult<ArtifactRef>;
}

#[async_trait]
pub trait DeliveryService: Send + Sync {
    async fn deliver(&self, artifact: &ArtifactRef, destination: &str) -> AgentResult<DeliveryAck>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub extractor: Arc<dyn ContentExtractor>,
    pub renderer: Arc<dyn ArtifactRenderer>,
    pub delivery: Arc<dyn DeliveryService>,
}

fn http_client() -> AgentResult<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(120))
        .connect_timeout(Duration::from_secs(10))
        .build()?)
}

async fn post_json(client: &Client, url: &str, body: &Value) -> AgentResult<Option<Value>> {
    let resp = client.post(url).json(body).send().await?;
    let status = resp.status();
    if status == StatusCode::NO_CONTENT {
        return Ok(None);
    }
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(AgentError::Extraction(format!(
            "{} returned {}: {}",
            url,
            status,
            text.chars().take(200).collect::<String>()
        )));
    }
    let value: Value = resp.json().await?;
    Ok(if value.is_null() { None } else { Some(value) })
}

pub struct HttpExtractor {
    client: Client,
    url: String,
}

impl HttpExtractor {
    pub fn new(url: &str) -> AgentResult<Self> {
        Ok(Self { client: http_client()?, url: url.to_string() })
    }
}

#[async_trait]
impl ContentExtractor for HttpExtractor {
    async fn extract(&self, raw_text: &str) -> AgentResult<Option<StructuredContent>> {
        let Some(value) = post_json(&self.client, &self.url, &json!({ "text": raw_text })).await? else {
            return Ok(None);
        };
        let content = value.get("content").cloned().unwrap_or(value);
        if content.is_null() {
            return Ok(None);
        }
        match serde_json::from_value::<StructuredContent>(content.clone()) {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => Ok(Some(StructuredContent { title: None, data: content })),
        }
    }
}

pub struct HttpRenderer {
    client: Client,
    url: String,
}

impl HttpRenderer {
    pub fn new(url: &str) -> AgentResult<Self> {
        Ok(Self { client: http_client()?, url: url.to_string() })
    }
}

#[async_trait]
impl ArtifactRenderer for HttpRenderer {
    async fn render(&self, content: &StructuredContent) -> AgentResult<ArtifactRef> {
        let value = post_json(&self.client, &self.url, &serde_json::to_value(content)?)
            .await?
            .ok_or_else(|| AgentError::Extraction("renderer returned no artifact".into()))?;
        Ok(serde_json::from_value(value)?)
    }
}

pub struct HttpDelivery {
    client: Client,
    url: String,
}

impl HttpDelivery {
    pub fn new(url: &str) -> AgentResult<Self> {
        Ok(Self { client: http_client()?, url: url.to_string() })
    }
}

#[async_trait]
impl DeliveryService for HttpDelivery {
    async fn deliver(&self, artifact: &ArtifactRef, destination: &str) -> AgentResult<DeliveryAck> {
        let body = json!({ "artifact": artifact, "destination": destination });
        let value = post_json(&self.client, &self.url, &body)
            .await?
            .ok_or_else(|| AgentError::Extraction("delivery returned no acknowledgement".into()))?;
        Ok(serde_json::from_value(value)?)
    }
}
