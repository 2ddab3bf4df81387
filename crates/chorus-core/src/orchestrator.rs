//! GenerationOrchestrator: one user message in, one reply out.
//!
//! The request is fingerprinted and admitted through the deduplicator. A
//! follower waits for the leader's outcome. The leader resolves the effective
//! config, recalls memories, cuts history at the context epoch, submits a job
//! and awaits its result. The leader's work runs in its own task, so a caller
//! that gives up never cancels a job that was already dispatched.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::cascade::{EffectiveConfig, PartialConfig};
use crate::config::Config;
use crate::config_cache::{ConfigScope, ConfigService, ConfigWriter, LayerKey};
use crate::dedup::{Admission, RequestDeduplicator, RequestSignature};
use crate::error::{CoreError, Result};
use crate::history::{apply_epoch_filter, apply_window, ContextEpochs, Epoch};
use crate::jobs::{await_result, Job, JobQueue, JobResultStore, GENERATION_QUEUE};
use crate::memory::{MemoryStore, OwnerScope};
use crate::providers::Embedder;
use crate::types::{
    personality_key, GenerationPayload, GenerationReply, GenerationRequest, RequestStatus,
};

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub job_timeout: Duration,
    pub poll_interval: Duration,
    pub memory_query_timeout: Duration,
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            job_timeout: config.job_timeout(),
            poll_interval: config.job_poll_interval(),
            memory_query_timeout: config.memory_query_timeout(),
        }
    }
}

/// Collaborators the orchestrator is wired from.
pub struct Components {
    pub dedup: RequestDeduplicator<GenerationReply>,
    pub configs: ConfigService,
    pub config_writer: ConfigWriter,
    pub memories: Arc<dyn MemoryStore>,
    pub embedder: Arc<dyn Embedder>,
    pub epochs: Arc<ContextEpochs>,
    pub queue: Arc<dyn JobQueue>,
    pub results: Arc<dyn JobResultStore>,
}

struct Shared {
    parts: Components,
    settings: OrchestratorSettings,
}

#[derive(Clone)]
pub struct GenerationOrchestrator {
    shared: Arc<Shared>,
}

impl GenerationOrchestrator {
    pub fn new(parts: Components, settings: OrchestratorSettings) -> Self {
        Self {
            shared: Arc::new(Shared { parts, settings }),
        }
    }

    pub fn dedup(&self) -> &RequestDeduplicator<GenerationReply> {
        &self.shared.parts.dedup
    }

    /// Produce the reply for `request`, joining an identical in-flight
    /// request when there is one.
    pub async fn handle(&self, request: GenerationRequest) -> Result<GenerationReply> {
        let signature = RequestSignature::from_request(&request);
        match self.shared.parts.dedup.admit(&signature)? {
            Admission::Follower(handle) => {
                let mut reply = handle.wait().await?;
                reply.request_id = request.request_id;
                reply.shared = true;
                Ok(reply)
            }
            Admission::Leader(completer) => {
                let shared = Arc::clone(&self.shared);
                let task = tokio::spawn(async move {
                    let outcome = shared.generate(&request, &signature).await;
                    completer.complete(outcome.clone());
                    outcome
                });
                match task.await {
                    Ok(outcome) => outcome,
                    Err(e) => Err(CoreError::Closed(format!("generation task failed: {}", e))),
                }
            }
        }
    }

    /// Write one config layer and broadcast the invalidation.
    pub async fn write_config(&self, key: LayerKey, values: PartialConfig) -> Result<()> {
        self.shared.parts.config_writer.write(key, values).await
    }

    pub async fn write_config_bulk(&self, writes: Vec<(LayerKey, PartialConfig)>) -> Result<()> {
        self.shared.parts.config_writer.write_bulk(writes).await
    }

    pub async fn effective_config(&self, scope: &ConfigScope) -> Result<EffectiveConfig> {
        self.shared.parts.configs.effective(scope).await
    }

    pub fn reset_context(&self, persona_id: &str, personality: &str) -> Epoch {
        self.shared
            .parts
            .epochs
            .reset(persona_id, &personality_key(personality), Utc::now())
    }

    pub fn undo_context_reset(&self, persona_id: &str, personality: &str) -> Result<Epoch> {
        self.shared
            .parts
            .epochs
            .undo(persona_id, &personality_key(personality))
    }
}

impl Shared {
    async fn generate(
        &self,
        request: &GenerationRequest,
        signature: &RequestSignature,
    ) -> Result<GenerationReply> {
        let personality = personality_key(&request.personality);
        let scope = ConfigScope::new(&request.user_id, &personality, &request.channel_id);
        let config = self.parts.configs.effective(&scope).await?;

        let owner = OwnerScope::new(&request.persona_id, &personality);
        let memories = self.recall(request, &owner, &config).await;

        let epoch = self.parts.epochs.current(&request.persona_id, &personality);
        let history = apply_window(
            apply_epoch_filter(&request.history, epoch.reset_at),
            config.max_messages as usize,
            config.max_age_secs,
            Utc::now(),
        );

        let payload = GenerationPayload {
            request_id: request.request_id.clone(),
            personality: request.personality.clone(),
            user_id: request.user_id.clone(),
            channel_id: request.channel_id.clone(),
            content: request.content.clone(),
            history,
            memories,
            model: config.model.clone(),
            vision_model: config.vision_model.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
            max_images: config.max_images,
            extended_context: config.extended_context,
            show_thinking: config.show_thinking,
        };
        let job = Job::new(
            request.request_id.clone(),
            GENERATION_QUEUE,
            serde_json::to_value(&payload)?,
        );
        let job_id = self.parts.queue.submit(job).await?;
        info!(
            request_id = %request.request_id,
            %job_id,
            signature = %signature.short(),
            status = %RequestStatus::Sent,
            "generation job submitted"
        );

        let row = await_result(
            self.parts.results.as_ref(),
            &job_id,
            self.settings.poll_interval,
            self.settings.job_timeout,
        )
        .await
        .map_err(|e| {
            warn!(
                request_id = %request.request_id,
                %job_id,
                status = %RequestStatus::from_error(&e),
                "generation did not complete: {}",
                e
            );
            e
        })?;

        let Some(content) = row.result.get("content").and_then(|v| v.as_str()) else {
            warn!(request_id = %request.request_id, %job_id, "completed job has no content");
            return Err(CoreError::Failed {
                job_id,
                message: "completed result carries no text content".into(),
            });
        };
        let content = content.to_string();
        Ok(GenerationReply {
            request_id: request.request_id.clone(),
            job_id,
            status: RequestStatus::Succeeded,
            content,
            shared: false,
        })
    }

    /// Memories relevant to the message. Slow or failing lookups degrade to
    /// no memories rather than failing the request.
    async fn recall(
        &self,
        request: &GenerationRequest,
        owner: &OwnerScope,
        config: &EffectiveConfig,
    ) -> Vec<String> {
        if config.memory_limit == 0 {
            return Vec::new();
        }
        let lookup = async {
            let query = self
                .parts
                .embedder
                .embed(&request.content)
                .await
                .map_err(|e| CoreError::Provider(format!("{:#}", e)))?;
            self.parts
                .memories
                .retrieve(
                    owner,
                    &query,
                    config.memory_limit as usize,
                    config.memory_score_threshold,
                )
                .await
        };

        match tokio::time::timeout(self.settings.memory_query_timeout, lookup).await {
            Ok(Ok(hits)) => {
                debug!(request_id = %request.request_id, hits = hits.len(), "memories recalled");
                hits.into_iter().map(|hit| hit.memory.content).collect()
            }
            Ok(Err(e)) => {
                warn!(request_id = %request.request_id, "memory lookup failed: {}", e);
                Vec::new()
            }
            Err(_) => {
                warn!(
                    request_id = %request.request_id,
                    timeout_ms = self.settings.memory_query_timeout.as_millis() as u64,
                    "memory lookup timed out"
                );
                Vec::new()
            }
        }
    }
}
