//! Generation and rework: build the request, make the one provider call the
//! single-flight lock allows, then store the result.
//!
//! Storage happens in stages (artifact files, catalog entry, usage, receipt).
//! A [`PendingArtifact`] remembers which stages finished so that
//! [`Orchestrator::retry_persistence`] can resume without calling the provider
//! again or counting usage twice.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use folio_contracts::activity::Activity;
use folio_contracts::catalog::{Category, ImageEntry};
use folio_contracts::receipts::{
    artifact_digest, sanitize_payload, write_receipt, GenerationReceipt, RECEIPT_SCHEMA_VERSION,
};
use folio_contracts::settings::{AspectRatio, ImageSize};
use folio_contracts::usage::TokenUsage;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::assets::PersistedAsset;
use crate::error::GenerationError;
use crate::flight::{FlightGuard, FlightStatus, SingleFlight};
use crate::project::Project;
use crate::provider::{
    error_chain_text, extension_for_mime, ImageProvider, Part, ProviderRequest,
};
use crate::request::{rework_prompt_key, GenerationMode, GenerationRequest};

const ERROR_TEXT_LIMIT: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub entry: ImageEntry,
    pub full_res_path: PathBuf,
    pub thumbnail_path: PathBuf,
    /// Model the usage was attributed to.
    pub model: String,
    pub usage: Option<TokenUsage>,
    pub receipt_path: Option<PathBuf>,
    pub notes: Vec<String>,
}

/// A provider result that has not been fully stored yet.
#[derive(Clone)]
pub struct PendingArtifact {
    image: Vec<u8>,
    mime_type: Option<String>,
    category: Category,
    filename_hint: String,
    mode: GenerationMode,
    source_id: Option<String>,
    requested_model: String,
    reported_model: Option<String>,
    usage: Option<TokenUsage>,
    notes: Vec<String>,
    receipt: ReceiptDraft,
    asset: Option<PersistedAsset>,
    entry: Option<ImageEntry>,
    usage_recorded: bool,
}

#[derive(Debug, Clone)]
struct ReceiptDraft {
    subject: String,
    prompt: String,
    aspect_ratio: AspectRatio,
    image_size: ImageSize,
    attachments: Vec<String>,
    source_image: Option<String>,
    provider_request: Value,
    created_at: DateTime<Utc>,
}

impl PendingArtifact {
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn category(&self) -> Category {
        self.category
    }

    /// Model usage is attributed to: the one the provider reported, else the
    /// one requested.
    pub fn model(&self) -> &str {
        self.reported_model
            .as_deref()
            .unwrap_or(&self.requested_model)
    }

    pub fn files_written(&self) -> bool {
        self.asset.is_some()
    }

    pub fn cataloged(&self) -> bool {
        self.entry.is_some()
    }

    pub fn usage_recorded(&self) -> bool {
        self.usage_recorded
    }
}

impl fmt::Debug for PendingArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingArtifact")
            .field("bytes", &self.image.len())
            .field("mime_type", &self.mime_type)
            .field("category", &self.category)
            .field("filename_hint", &self.filename_hint)
            .field("model", &self.model())
            .field("asset", &self.asset.as_ref().map(|asset| &asset.relative_path))
            .field("entry", &self.entry.as_ref().map(|entry| &entry.id))
            .field("usage_recorded", &self.usage_recorded)
            .finish()
    }
}

/// Runs generation requests against one project and one provider.
#[derive(Clone)]
pub struct Orchestrator {
    project: Arc<Project>,
    provider: Arc<dyn ImageProvider>,
    flight: SingleFlight,
}

impl Orchestrator {
    pub fn new(project: Arc<Project>, provider: Arc<dyn ImageProvider>) -> Self {
        Self {
            project,
            provider,
            flight: SingleFlight::new(),
        }
    }

    pub fn project(&self) -> &Arc<Project> {
        &self.project
    }

    /// Whether a call is in flight and how many callers are waiting.
    pub fn status(&self) -> FlightStatus {
        self.flight.status()
    }

    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationOutcome, GenerationError> {
        if request.mode != GenerationMode::Create {
            return Err(GenerationError::Validation(
                "generate expects a create request".to_string(),
            ));
        }
        self.run(request).await
    }

    pub async fn rework(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationOutcome, GenerationError> {
        if request.mode != GenerationMode::Rework {
            return Err(GenerationError::Validation(
                "rework expects a rework request".to_string(),
            ));
        }
        self.run(request).await
    }

    /// Resumes storing a result whose persistence failed earlier.
    pub async fn retry_persistence(
        &self,
        pending: PendingArtifact,
    ) -> Result<GenerationOutcome, GenerationError> {
        let _guard = self.acquire().await?;
        self.persist(pending).await
    }

    async fn run(&self, request: GenerationRequest) -> Result<GenerationOutcome, GenerationError> {
        request.validate()?;
        let prepared = self.prepare(&request)?;

        let _guard = self.acquire().await?;
        info!(
            mode = request.mode.as_str(),
            subject = request.subject.as_str(),
            model = %prepared.provider_request.model,
            aspect_ratio = %prepared.provider_request.aspect_ratio,
            category = %prepared.category,
            images = prepared.provider_request.parts.iter().filter(|part| part.is_image()).count(),
            "generation started"
        );

        let timeout = Duration::from_secs(prepared.timeout_secs);
        let response = match tokio::time::timeout(
            timeout,
            self.provider.generate(&prepared.provider_request),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                let message = error_chain_text(&err, ERROR_TEXT_LIMIT);
                warn!(provider = self.provider.name(), error = %message, "generation failed");
                return Err(GenerationError::ExternalApi(message));
            }
            Err(_) => {
                warn!(provider = self.provider.name(), timeout_secs = prepared.timeout_secs, "generation timed out");
                return Err(GenerationError::ExternalApi(format!(
                    "{} did not answer within {}s",
                    self.provider.name(),
                    prepared.timeout_secs
                )));
            }
        };
        if response.image.is_empty() {
            return Err(GenerationError::ExternalApi(format!(
                "{} returned an empty image",
                self.provider.name()
            )));
        }

        let extension = extension_for_mime(response.mime_type.as_deref());
        let filename_hint = format!("{}.{extension}", prepared.stem);
        let pending = PendingArtifact {
            image: response.image,
            mime_type: response.mime_type,
            category: prepared.category,
            filename_hint,
            mode: request.mode,
            source_id: prepared.source.as_ref().map(|entry| entry.id.clone()),
            requested_model: prepared.provider_request.model.clone(),
            reported_model: response.model_name,
            usage: response.usage.to_token_usage(),
            notes: response.notes,
            receipt: ReceiptDraft {
                subject: request.subject.as_str().to_string(),
                prompt: request.prompt_text().to_string(),
                aspect_ratio: prepared.provider_request.aspect_ratio,
                image_size: prepared.provider_request.image_size,
                attachments: prepared.attachments,
                source_image: prepared.source.map(|entry| entry.relative_path),
                provider_request: sanitize_payload(&response.provider_request),
                created_at: Utc::now(),
            },
            asset: None,
            entry: None,
            usage_recorded: false,
        };
        self.persist(pending).await
    }

    async fn acquire(&self) -> Result<FlightGuard, GenerationError> {
        self.flight.acquire().await.map_err(|_| {
            GenerationError::ExternalApi("generation queue is shut down".to_string())
        })
    }

    /// Everything that must be known before the provider call. Reads the
    /// prompt table and settings; writes nothing.
    fn prepare(&self, request: &GenerationRequest) -> Result<Prepared, GenerationError> {
        let table = self
            .project
            .prompts()
            .resolve()
            .map_err(GenerationError::from_store)?;
        let settings = self.project.settings().map_err(GenerationError::from_store)?;

        let mut attachments = Vec::new();
        let mut parts = Vec::new();

        let (source, category, prompt_key, stem) = match request.mode {
            GenerationMode::Create => {
                let category = request
                    .target_category
                    .unwrap_or_else(|| request.subject.default_category());
                let stem = format!("generated_{}", Utc::now().format("%Y%m%dT%H%M%S%3fZ"));
                (None, category, request.subject.prompt_key(), stem)
            }
            GenerationMode::Rework => {
                let path = request
                    .source_image_path
                    .as_deref()
                    .ok_or_else(|| GenerationError::Validation("rework needs a source image".to_string()))?;
                let source = self
                    .project
                    .find_by_path(path)
                    .map_err(GenerationError::from_store)?
                    .ok_or_else(|| {
                        GenerationError::Validation(format!(
                            "{} is not an image of this project",
                            path.display()
                        ))
                    })?;
                let source_path = self.project.root().join(&source.relative_path);
                if !source_path.is_file() {
                    return Err(GenerationError::Validation(format!(
                        "source image {} is missing from the project folder",
                        source.relative_path
                    )));
                }
                let category = request.target_category.unwrap_or(source.category);
                let stem = format!(
                    "rework_{}_{}",
                    Utc::now().format("%Y%m%dT%H%M%SZ"),
                    source.stem()
                );
                (Some(source), category, rework_prompt_key(category), stem)
            }
        };

        if let Some(system) = table.system_prompt(prompt_key, &settings.system_prompt_overrides) {
            parts.push(Part::Text(system));
        }
        if let Some(style) = table.style_prefix(&request.style_prompt) {
            parts.push(Part::Text(style));
        }
        if let Some(source) = &source {
            let path = self.project.root().join(&source.relative_path);
            parts.push(image_part(&path)?);
            attachments.push(source.relative_path.clone());
        }
        for reference in &request.reference_image_paths {
            parts.push(image_part(reference)?);
            attachments.push(reference.display().to_string());
        }
        if let Some(sketch) = &request.sketch_path {
            parts.push(image_part(sketch)?);
            attachments.push(sketch.display().to_string());
        }
        parts.push(Part::Text(match request.mode {
            GenerationMode::Create => request.prompt_text().to_string(),
            GenerationMode::Rework => table.rework_instruction(request.prompt_text()),
        }));
        debug!(
            parts = ?parts,
            "provider request assembled"
        );

        Ok(Prepared {
            provider_request: ProviderRequest {
                model: table.image_model().to_string(),
                parts,
                aspect_ratio: request.aspect_ratio,
                image_size: request.image_size.unwrap_or(settings.image_size),
                top_p: settings.top_p,
                temperature: settings.temperature,
            },
            category,
            source,
            stem,
            attachments,
            timeout_secs: settings.request_timeout_secs,
        })
    }

    async fn persist(
        &self,
        mut pending: PendingArtifact,
    ) -> Result<GenerationOutcome, GenerationError> {
        let asset = match pending.asset.clone() {
            Some(asset) => asset,
            None => {
                let writer = self.project.assets().clone();
                let image = pending.image.clone();
                let category = pending.category;
                let hint = pending.filename_hint.clone();
                let written = tokio::task::spawn_blocking(move || {
                    writer.persist(&image, category, &hint)
                })
                .await;
                match written {
                    Ok(Ok(asset)) => {
                        pending.asset = Some(asset.clone());
                        asset
                    }
                    Ok(Err(err)) => return Err(persistence(format!("{err:#}"), pending)),
                    Err(join) => return Err(persistence(join.to_string(), pending)),
                }
            }
        };

        let entry = match pending.entry.clone() {
            Some(entry) => entry,
            None => match self
                .project
                .add_entry(ImageEntry::new(&asset.relative_path, pending.category))
            {
                Ok(entry) => {
                    pending.entry = Some(entry.clone());
                    entry
                }
                Err(err) => return Err(persistence(err.to_string(), pending)),
            },
        };

        let model = pending.model().to_string();
        if let (Some(usage), false) = (pending.usage, pending.usage_recorded) {
            if let Err(err) = self.project.record_usage(&model, usage) {
                return Err(persistence(err.to_string(), pending));
            }
            pending.usage_recorded = true;
        }

        let receipt_path = self.write_receipt(&pending, &asset, &entry);
        self.project.note(match pending.mode {
            GenerationMode::Create => Activity::ImageGenerated {
                image_id: entry.id.clone(),
                category: entry.category,
                path: entry.relative_path.clone(),
                model: model.clone(),
                usage: pending.usage,
            },
            GenerationMode::Rework => Activity::ImageReworked {
                image_id: entry.id.clone(),
                source_id: pending.source_id.clone().unwrap_or_default(),
                category: entry.category,
                path: entry.relative_path.clone(),
                model: model.clone(),
                usage: pending.usage,
            },
        });
        info!(
            id = %entry.id,
            path = %entry.relative_path,
            category = %entry.category,
            order = ?entry.order,
            model = %model,
            total_tokens = pending.usage.map(|usage| usage.total_tokens),
            "generation stored"
        );

        Ok(GenerationOutcome {
            entry,
            full_res_path: asset.full_res_path,
            thumbnail_path: asset.thumbnail_path,
            model,
            usage: pending.usage,
            receipt_path,
            notes: pending.notes,
        })
    }

    fn write_receipt(
        &self,
        pending: &PendingArtifact,
        asset: &PersistedAsset,
        entry: &ImageEntry,
    ) -> Option<PathBuf> {
        let draft = &pending.receipt;
        let receipt = GenerationReceipt {
            schema_version: RECEIPT_SCHEMA_VERSION,
            image_id: entry.id.clone(),
            mode: pending.mode.as_str().to_string(),
            subject: draft.subject.clone(),
            prompt: draft.prompt.clone(),
            aspect_ratio: draft.aspect_ratio.as_str().to_string(),
            image_size: draft.image_size.as_str().to_string(),
            attachments: draft.attachments.clone(),
            source_image: draft.source_image.clone(),
            requested_model: pending.requested_model.clone(),
            reported_model: pending.reported_model.clone(),
            usage: pending.usage,
            artifact_sha256: artifact_digest(&pending.image),
            provider_request: draft.provider_request.clone(),
            created_at: draft.created_at,
        };
        match write_receipt(self.project.root(), &asset.relative_path, &receipt) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(path = %asset.relative_path, error = %err, "receipt not written");
                None
            }
        }
    }
}

struct Prepared {
    provider_request: ProviderRequest,
    category: Category,
    source: Option<ImageEntry>,
    stem: String,
    attachments: Vec<String>,
    timeout_secs: u64,
}

fn image_part(path: &std::path::Path) -> Result<Part, GenerationError> {
    Part::image_from_path(path).map_err(|err| GenerationError::Validation(format!("{err:#}")))
}

fn persistence(reason: String, pending: PendingArtifact) -> GenerationError {
    warn!(reason = %reason, stage = ?pending, "generated image not fully stored");
    GenerationError::Persistence {
        reason,
        pending: Box::new(pending),
    }
}
