//! Typed error hierarchy for the engine host.
//!
//! Uses `thiserror` for library-grade errors.  Boundary adapters (CLI, FFI)
//! translate these into exit codes or negative return values.
//!
//! # Error codes
//!
//! Each variant maps to a stable integer code via [`EngineError::error_code`]
//! so hosts can branch on the failure class without string parsing.

use std::any::Any;
use std::path::PathBuf;

use crate::types::Handle;

/// All errors originating from the upscaling engine host.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EngineError {
    // ── Configuration ─────────────────────────────────────────────────
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Model asset not found: {}", path.display())]
    AssetMissing { path: PathBuf },

    // ── GPU / engine construction ─────────────────────────────────────
    #[error("GPU context error: {0}")]
    Resource(String),

    #[error("Engine load error: {0}")]
    Load(String),

    // ── Per-image ─────────────────────────────────────────────────────
    #[error("Image decode error: {0}")]
    Decode(String),

    #[error("Engine handle {0} not found (unknown or already released)")]
    NotFound(Handle),

    #[error("Engine process error: {0}")]
    Process(String),

    // ── Invariants ────────────────────────────────────────────────────
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // ── Boundary ──────────────────────────────────────────────────────
    #[error("Panic recovered in {stage}: {message}")]
    PanicRecovered {
        stage: &'static str,
        message: String,
    },
}

impl EngineError {
    /// Stable integer error code.
    ///
    /// Codes are grouped by category:
    /// - 1xx: configuration / assets
    /// - 2xx: GPU context / engine load
    /// - 3xx: input decode
    /// - 4xx: handle lookup / inference
    /// - 6xx: invariant
    /// - 7xx: boundary
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Configuration(_) => 100,
            Self::AssetMissing { .. } => 101,
            Self::Resource(_) => 200,
            Self::Load(_) => 201,
            Self::Decode(_) => 300,
            Self::NotFound(_) => 400,
            Self::Process(_) => 401,
            Self::InvariantViolation(_) => 600,
            Self::PanicRecovered { .. } => 700,
        }
    }

    /// Process exit status for this error.
    ///
    /// Unix keeps only the low 8 bits of a status, so the three-digit code
    /// is folded to `category * 10 + detail` (100 → 10, 401 → 41, 700 → 70).
    pub fn exit_code(&self) -> u8 {
        let code = self.error_code();
        ((code / 100) * 10 + code % 100) as u8
    }

    /// Whether the handle involved is still usable after this error.
    ///
    /// A failed decode or inference leaves the registry entry intact, and a
    /// missing handle is an expected outcome of concurrent release.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Decode(_) | Self::Process(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Turn a caught panic payload into [`EngineError::PanicRecovered`].
    pub fn from_panic(stage: &'static str, payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::PanicRecovered { stage, message }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;
