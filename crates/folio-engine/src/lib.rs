//! Generation orchestration for folio projects: provider plumbing, the asset
//! writer, the single-flight lock and the project facade they share.

pub mod assets;
pub mod dryrun;
mod error;
pub mod flight;
pub mod gemini;
pub mod orchestrator;
pub mod project;
pub mod provider;
pub mod request;

pub use assets::{AssetWriter, PersistedAsset};
pub use dryrun::DryrunProvider;
pub use error::GenerationError;
pub use gemini::GeminiProvider;
pub use orchestrator::{GenerationOutcome, Orchestrator, PendingArtifact};
pub use project::Project;
pub use provider::{ImageProvider, Part, ProviderRequest, ProviderResponse, ProviderUsage};
pub use request::{GenerationMode, GenerationRequest, Subject};
