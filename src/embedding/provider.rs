use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::EmbeddingProviderConfig;
use crate::error::{Error, Result};

/// Source of embedding vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model(&self) -> &str;

    fn supports_batch(&self) -> bool {
        false
    }

    /// Largest batch the provider accepts when [`supports_batch`] is true.
    ///
    /// [`supports_batch`]: EmbeddingProvider::supports_batch
    fn batch_size(&self) -> usize {
        1
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// One vector per input, in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible `POST {endpoint}/embeddings`.
pub struct HttpEmbeddingProvider {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    batch_enabled: bool,
    batch_size: usize,
}

impl HttpEmbeddingProvider {
    pub fn new(config: &EmbeddingProviderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::External {
                service: "embedding".into(),
                status: None,
                message: e.to_string(),
            })?;
        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            batch_enabled: config.batch_enabled,
            batch_size: config.batch_size.max(1),
        })
    }

    async fn request(&self, input: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.endpoint);
        let mut req = self.http.post(&url).json(&EmbeddingRequest {
            model: &self.model,
            input,
        });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(|e| external(None, e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(external(Some(status.as_u16()), body));
        }
        let parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| external(Some(status.as_u16()), e.to_string()))?;
        if parsed.data.len() != input.len() {
            return Err(external(
                Some(status.as_u16()),
                format!(
                    "expected {} embeddings, got {}",
                    input.len(),
                    parsed.data.len()
                ),
            ));
        }

        let mut data = parsed.data;
        if data.iter().all(|d| d.index.is_some()) {
            data.sort_by_key(|d| d.index);
        }
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

fn external(status: Option<u16>, message: String) -> Error {
    Error::External {
        service: "embedding".into(),
        status,
        message,
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model(&self) -> &str {
        &self.model
    }

    fn supports_batch(&self) -> bool {
        self.batch_enabled
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.request(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| external(None, "empty embedding response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }
}

/// Little-endian `f32` BLOB layout of the `embedding` column.
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
