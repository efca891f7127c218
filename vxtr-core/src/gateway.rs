use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::debug;
use tracing::warn;

use crate::error::GatewayError;

/// Where the image bytes for a request come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Path(PathBuf),
    Url(String),
    Bytes(Vec<u8>),
}

/// One fully-rendered model request: system line, task instruction, and the
/// images the instruction talks about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub system: String,
    pub instruction: String,
    pub images: Vec<ImageSource>,
}

/// Raw model output, before any validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawModelOutput {
    pub text: String,
    pub token_count: u32,
}

/// Boundary to the vision model. The service never sees anything past this
/// trait, so backends (and test stubs) swap freely.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn generate(&self, message: &Message) -> Result<RawModelOutput, GatewayError>;
}

/// Connection settings for one model backend.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Requests admitted to the model at once; the rest queue in arrival
    /// order.
    pub concurrency: usize,
    pub num_predict: u32,
    /// When set, every call is written out as a JSON transcript file.
    pub transcript_dir: Option<PathBuf>,
}

/// Gateway speaking the Ollama `/api/chat` protocol with base64 image
/// attachments.
pub struct OllamaGateway {
    client: Client,
    settings: GatewaySettings,
    admission: Semaphore,
}

impl OllamaGateway {
    pub fn new(settings: GatewaySettings) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(|err| GatewayError::Unavailable {
                reason: format!("failed to build http client: {err}"),
            })?;

        let admission = Semaphore::new(settings.concurrency.max(1));

        Ok(Self {
            client,
            settings,
            admission,
        })
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    fn endpoint(&self) -> String {
        format!("{}/api/chat", self.settings.base_url.trim_end_matches('/'))
    }

    async fn encode_images(&self, images: &[ImageSource]) -> Result<Vec<String>, GatewayError> {
        let mut encoded = Vec::with_capacity(images.len());
        for image in images {
            let bytes = match image {
                ImageSource::Bytes(bytes) => bytes.clone(),
                ImageSource::Path(path) => {
                    tokio::fs::read(path)
                        .await
                        .map_err(|err| GatewayError::Unavailable {
                            reason: format!("failed to read image {}: {err}", path.display()),
                        })?
                }
                ImageSource::Url(url) => self.fetch_image(url).await?,
            };
            encoded.push(BASE64.encode(&bytes));
        }
        Ok(encoded)
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, GatewayError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| GatewayError::Unavailable {
                reason: format!("failed to fetch image {url}: {err}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Unavailable {
                reason: format!("image fetch from {url} returned {status}"),
            });
        }

        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|err| GatewayError::Unavailable {
                reason: format!("failed to read image body from {url}: {err}"),
            })
    }

    async fn send(&self, request: &ChatRequest<'_>) -> Result<ChatResponse, GatewayError> {
        let response = self
            .client
            .post(self.endpoint())
            .json(request)
            .send()
            .await
            .map_err(|err| GatewayError::Unavailable {
                reason: format!("request to {} failed: {err}", self.endpoint()),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.trim().chars().take(200).collect();
            return Err(GatewayError::Unavailable {
                reason: format!("backend returned {status}: {snippet}"),
            });
        }

        response
            .json::<ChatResponse>()
            .await
            .map_err(|err| GatewayError::Unavailable {
                reason: format!("unreadable backend response: {err}"),
            })
    }

    fn log_transcript(&self, message: &Message, output: &RawModelOutput) {
        if let Some(dir) = self.settings.transcript_dir.as_ref()
            && let Err(err) = self.try_log_transcript(dir, message, output)
        {
            warn!("failed to write gateway transcript: {err}");
        }
    }

    fn try_log_transcript(
        &self,
        dir: &Path,
        message: &Message,
        output: &RawModelOutput,
    ) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create transcript directory {}", dir.display()))?;

        let entry = TranscriptEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            model: self.settings.model.clone(),
            system: message.system.clone(),
            instruction: message.instruction.clone(),
            image_count: message.images.len(),
            response: output.text.clone(),
            token_count: output.token_count,
        };

        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let file_path = dir.join(format!("{stamp}_call.json"));

        let json =
            serde_json::to_string_pretty(&entry).context("failed to serialize transcript entry")?;
        fs::write(&file_path, json)
            .with_context(|| format!("failed to write transcript to {}", file_path.display()))?;

        Ok(())
    }
}

#[async_trait]
impl ModelGateway for OllamaGateway {
    async fn generate(&self, message: &Message) -> Result<RawModelOutput, GatewayError> {
        let timeout_ms = self.settings.timeout.as_millis() as u64;

        // Image IO happens before admission so queued requests do not hold
        // the model slot while reading files. It runs under the gateway
        // deadline: a remote image server that stalls mid-body must not
        // wedge the attempt.
        let images =
            match tokio::time::timeout(self.settings.timeout, self.encode_images(&message.images))
                .await
            {
                Ok(result) => result?,
                Err(_) => return Err(GatewayError::Timeout { timeout_ms }),
            };

        let _permit =
            self.admission
                .acquire()
                .await
                .map_err(|_| GatewayError::Unavailable {
                    reason: "admission queue closed".to_string(),
                })?;

        let request = ChatRequest {
            model: &self.settings.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &message.system,
                    images: Vec::new(),
                },
                ChatMessage {
                    role: "user",
                    content: &message.instruction,
                    images,
                },
            ],
            stream: false,
            options: ChatOptions {
                num_predict: self.settings.num_predict,
            },
        };

        debug!(model = %self.settings.model, endpoint = %self.endpoint(), "sending chat request");

        let response = match tokio::time::timeout(self.settings.timeout, self.send(&request)).await
        {
            Ok(result) => result?,
            Err(_) => return Err(GatewayError::Timeout { timeout_ms }),
        };

        let output = RawModelOutput {
            text: response.message.content,
            token_count: response.eval_count,
        };

        debug!(tokens = output.token_count, "chat response received");
        self.log_transcript(message, &output);

        Ok(output)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
    #[serde(default)]
    eval_count: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Serialize)]
struct TranscriptEntry {
    timestamp: String,
    model: String,
    system: String,
    instruction: String,
    image_count: usize,
    response: String,
    token_count: u32,
}
