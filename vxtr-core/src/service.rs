use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::config::ConfigBundle;
use crate::error::AttemptFailure;
use crate::error::ExtractError;
use crate::error::ExtractResult;
use crate::gateway::ImageSource;
use crate::gateway::ModelGateway;
use crate::gateway::OllamaGateway;
use crate::prompt;
use crate::schema::SchemaRegistry;
use crate::schema::TaskKind;
use crate::validate;
use crate::validate::Record;
use crate::validate::ValidationOutcome;

/// One extraction job: a task kind plus the image to read.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub task_kind: TaskKind,
    pub image: ImageSource,
    pub note: Option<String>,
    pub cancel: Option<CancellationToken>,
}

impl ExtractionRequest {
    pub fn new(task_kind: TaskKind, image: ImageSource) -> Self {
        Self {
            task_kind,
            image,
            note: None,
            cancel: None,
        }
    }

    /// Free-form context appended to the instruction, e.g. what app the
    /// screenshot comes from.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Drives the gateway and the validator until a request yields a
/// schema-valid record or its attempt budget runs out.
pub struct ExtractionService {
    registry: SchemaRegistry,
    gateway: Arc<dyn ModelGateway>,
    max_attempts: u32,
}

impl ExtractionService {
    /// Service wired from loaded configuration, talking to the configured
    /// backend.
    pub fn from_config(bundle: &ConfigBundle) -> anyhow::Result<Self> {
        let registry = SchemaRegistry::with_overrides(&bundle.config.schemas)?;
        let gateway = OllamaGateway::new(bundle.gateway_settings()?)?;
        Ok(Self::from_parts(
            registry,
            Arc::new(gateway),
            bundle.config.extraction.max_attempts,
        ))
    }

    /// Assemble a service from explicit parts. The attempt budget is clamped
    /// to at least one.
    pub fn from_parts(
        registry: SchemaRegistry,
        gateway: Arc<dyn ModelGateway>,
        max_attempts: u32,
    ) -> Self {
        Self {
            registry,
            gateway,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Replace the attempt budget, e.g. from a CLI flag.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run one request through the attempt loop.
    ///
    /// Transport failures retry with the unchanged message; content failures
    /// retry with a repair hint appended. Both draw on the same attempt
    /// budget, and cancellation is honored between attempts, never mid-call.
    pub async fn extract(&self, request: ExtractionRequest) -> ExtractResult<Record> {
        let schema = self.registry.get(request.task_kind)?;
        let note = request.note.as_deref();

        let mut message =
            prompt::build(request.task_kind, schema, request.image.clone(), note, None);
        let mut attempt = 1u32;

        loop {
            if let Some(token) = request.cancel.as_ref()
                && token.is_cancelled()
            {
                return Err(ExtractError::Cancelled);
            }

            let failure = match self.gateway.generate(&message).await {
                Ok(raw) => {
                    debug!(
                        task = %request.task_kind,
                        attempt,
                        tokens = raw.token_count,
                        "model responded"
                    );
                    match validate::validate(schema, &raw.text) {
                        ValidationOutcome::Accepted(record) => return Ok(record),
                        ValidationOutcome::Malformed { reason, raw_text } => {
                            AttemptFailure::Malformed { reason, raw_text }
                        }
                        ValidationOutcome::SchemaViolation {
                            field,
                            expected,
                            found,
                        } => AttemptFailure::SchemaViolation {
                            field,
                            expected,
                            found,
                        },
                    }
                }
                Err(err) => AttemptFailure::Gateway(err),
            };

            warn!(task = %request.task_kind, attempt, %failure, "attempt failed");

            if attempt >= self.max_attempts {
                return Err(ExtractError::RetryBudgetExhausted {
                    attempts: attempt,
                    last: failure,
                });
            }

            // A flaky transport is not the model's fault; only content
            // failures earn a repair hint.
            if !matches!(failure, AttemptFailure::Gateway(_)) {
                let hint = prompt::repair_hint(&failure);
                message = prompt::build(
                    request.task_kind,
                    schema,
                    request.image.clone(),
                    note,
                    Some(&hint),
                );
            }

            attempt += 1;
        }
    }

    /// Run many requests concurrently. Results come back in input order and
    /// every failure stays confined to its own slot.
    pub async fn extract_many(
        &self,
        requests: Vec<ExtractionRequest>,
    ) -> Vec<ExtractResult<Record>> {
        join_all(requests.into_iter().map(|request| self.extract(request))).await
    }
}
