use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{GenerativeModel, Part};
use crate::{PipelineError, Result};

/// Google Generative Language REST client (`models/{model}:generateContent`)
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart {
    Text { text: String },
    File { file_data: FileData },
}

#[derive(Debug, Serialize)]
struct FileData {
    file_uri: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

impl GeminiClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }
}

fn build_request(parts: &[Part]) -> GenerateRequest {
    let parts = parts
        .iter()
        .map(|part| match part {
            Part::Text(text) => RequestPart::Text { text: text.clone() },
            Part::FileUri(uri) => RequestPart::File {
                file_data: FileData { file_uri: uri.clone() },
            },
        })
        .collect();

    GenerateRequest {
        contents: vec![Content { role: "user", parts }],
        generation_config: GenerationConfig {
            response_mime_type: "application/json",
        },
    }
}

fn response_text(body: &str) -> Result<String> {
    let parsed: GenerateResponse =
        serde_json::from_str(body).context("Failed to parse generateContent response")?;

    let text: String = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        anyhow::bail!("Model returned no text");
    }
    Ok(text)
}

#[async_trait]
impl GenerativeModel for GeminiClient {
    async fn generate_json(&self, model: &str, parts: &[Part]) -> Result<String> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);

        let response = self
            .http_client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&build_request(parts))
            .send()
            .await
            .context("Failed to send generateContent request")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read generateContent response")?;

        if !status.is_success() {
            return Err(PipelineError::Collaborator(format!(
                "generateContent failed with status {}: {}",
                status, body
            ))
            .into());
        }

        response_text(&body)
    }
}
