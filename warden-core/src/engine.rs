use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use thiserror::Error;

use crate::{errors::ErrorCode, template::ConstraintTemplate};

/// Failures surfaced by the policy engine.
#[derive(Clone, Debug, Error)]
pub enum EngineError {
    /// The template source failed to parse.
    #[error("template source failed to parse: {0}")]
    Parse(String),
    /// The template could not be converted to the engine's internal
    /// representation.
    #[error("template conversion failed: {0}")]
    Conversion(String),
    /// The engine rejected the compiled program on ingestion.
    #[error("engine rejected template: {0}")]
    Ingest(String),
    /// Anything else inside the engine.
    #[error("engine failure: {0}")]
    Internal(String),
}

impl EngineError {
    /// Map an engine failure onto the status-row error taxonomy.
    #[must_use]
    pub fn status_code(&self) -> ErrorCode {
        match self {
            EngineError::Parse(_) => ErrorCode::ParseError,
            EngineError::Conversion(_) => ErrorCode::ConversionError,
            EngineError::Ingest(_) | EngineError::Internal(_) => ErrorCode::IngestError,
        }
    }
}

/// The policy engine the controller keeps in sync with templates.
///
/// The engine is the source of truth for which templates are live:
/// the teardown path consults [`Engine::get_template`] to learn what
/// to unwatch, and entry removal is always the final step so that a
/// failed teardown can be re-entered. Implementations must be safe to
/// call concurrently for distinct template names; operations on the
/// same name are serialized by the reconciler.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Derive the CRD-shaped schema a template's constraints will
    /// carry. Parsing the template source happens here, so a
    /// syntactically invalid program fails this call.
    async fn create_schema(
        &self,
        template: &ConstraintTemplate,
    ) -> Result<CustomResourceDefinition, EngineError>;

    /// Compile and install a template into the engine.
    async fn add_template(&self, template: &ConstraintTemplate) -> Result<(), EngineError>;

    /// Remove a template's entry. Removing an unknown name is a
    /// no-op.
    async fn remove_template(&self, name: &str) -> Result<(), EngineError>;

    /// The engine's copy of a template, if it has one.
    async fn get_template(&self, name: &str) -> Result<Option<ConstraintTemplate>, EngineError>;
}
