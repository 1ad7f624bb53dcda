//! Gateway error taxonomy.
//!
//! Every kind carries a stable snake_case code, a human-readable message and
//! an optional details map; the HTTP layer maps kinds to status codes.
//! Inside the dispatcher a terminal failure is a value, never a panic.

use serde::Serialize;
use serde_json::Value;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds the gateway raises, independent of transport.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input or unsupported combination.
    #[error("{0}")]
    Validation(String),

    /// Task, conversation, preset or idempotent predecessor absent.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate registration, or delete on a non-terminal task.
    #[error("{0}")]
    Conflict(String),

    /// Model unresolvable by registry or preset catalog.
    #[error("model '{model}' is not registered and has no preset")]
    ModelNotFound {
        /// The unresolvable model name.
        model: String,
    },

    /// Provider health check fails or the upstream refuses connections.
    #[error("{0}")]
    ProviderUnavailable(String),

    /// Upstream rejected the credentials.
    #[error("{0}")]
    ProviderAuthentication(String),

    /// Token quota exhausted.
    #[error("{0}")]
    TokenLimitExceeded(String),

    /// Prompt does not fit the model context window.
    #[error("{0}")]
    ContextLengthExceeded(String),

    /// Provider accepted the call but produced no usable result.
    #[error("{0}")]
    GenerationFailed(String),

    /// VRAM admission failed at the GPU guard.
    #[error("insufficient VRAM: required {required_mb} MB, available {available_mb} MB")]
    VramInsufficient {
        /// MB the task declared it needs.
        required_mb: u64,
        /// MB the monitor reports as allocatable.
        available_mb: u64,
    },

    /// GPU telemetry interface is inoperative.
    #[error("{0}")]
    GpuUnavailable(String),

    /// Key-value service error.
    #[error("{0}")]
    InfrastructureUnavailable(String),

    /// A bounded wait elapsed.
    #[error("{0}")]
    Timeout(String),

    /// Priority queue is at its configured capacity.
    #[error("task queue is full ({size}/{max})")]
    QueueFull {
        /// Current queue length.
        size: u64,
        /// Configured maximum.
        max: u64,
    },

    /// A probed extension capability is absent on this provider.
    #[error("capability '{capability}' is not supported by this provider")]
    NotSupported {
        /// The probed capability name.
        capability: String,
    },

    /// No quantization variant of the model fits the available VRAM.
    #[error("no quantization of '{model}' fits the available VRAM")]
    NoCompatibleQuantization {
        /// The rejected model name.
        model: String,
    },
}

impl Error {
    /// Stable snake_case code for this kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::ModelNotFound { .. } => "model_not_found",
            Error::ProviderUnavailable(_) => "provider_unavailable",
            Error::ProviderAuthentication(_) => "provider_authentication",
            Error::TokenLimitExceeded(_) => "token_limit_exceeded",
            Error::ContextLengthExceeded(_) => "context_length_exceeded",
            Error::GenerationFailed(_) => "generation_failed",
            Error::VramInsufficient { .. } => "vram_insufficient",
            Error::GpuUnavailable(_) => "gpu_unavailable",
            Error::InfrastructureUnavailable(_) => "infrastructure_unavailable",
            Error::Timeout(_) => "timeout",
            Error::QueueFull { .. } => "queue_full",
            Error::NotSupported { .. } => "not_supported",
            Error::NoCompatibleQuantization { .. } => "no_compatible_quantization",
        }
    }

    /// HTTP status this kind maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::NotFound(_) | Error::ModelNotFound { .. } => 404,
            Error::Conflict(_) => 409,
            Error::TokenLimitExceeded(_)
            | Error::ContextLengthExceeded(_)
            | Error::VramInsufficient { .. }
            | Error::NoCompatibleQuantization { .. } => 422,
            Error::ProviderAuthentication(_) => 401,
            Error::ProviderUnavailable(_)
            | Error::GpuUnavailable(_)
            | Error::InfrastructureUnavailable(_) => 503,
            Error::Timeout(_) => 504,
            Error::QueueFull { .. } => 429,
            Error::NotSupported { .. } => 400,
            Error::GenerationFailed(_) => 500,
        }
    }

    /// Optional structured details for the wire body.
    pub fn details(&self) -> Option<Value> {
        match self {
            Error::ModelNotFound { model } => Some(serde_json::json!({ "model": model })),
            Error::VramInsufficient {
                required_mb,
                available_mb,
            } => Some(serde_json::json!({
                "required_mb": required_mb,
                "available_mb": available_mb,
            })),
            Error::QueueFull { size, max } => {
                Some(serde_json::json!({ "size": size, "max": max }))
            }
            Error::NotSupported { capability } => {
                Some(serde_json::json!({ "capability": capability }))
            }
            Error::NoCompatibleQuantization { model } => {
                Some(serde_json::json!({ "model": model }))
            }
            _ => None,
        }
    }

    /// Wire representation `{error_code, message, details?}`.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error_code: self.code().to_string(),
            message: self.to_string(),
            details: self.details(),
        }
    }
}

/// Wire shape of an error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// Stable snake_case code.
    pub error_code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::InfrastructureUnavailable(format!("key-value store error: {err}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_snake_case_of_kind() {
        assert_eq!(
            Error::ModelNotFound {
                model: "m".into()
            }
            .code(),
            "model_not_found"
        );
        assert_eq!(
            Error::InfrastructureUnavailable("down".into()).code(),
            "infrastructure_unavailable"
        );
    }

    #[test]
    fn vram_error_carries_details() {
        let err = Error::VramInsufficient {
            required_mb: 8000,
            available_mb: 1000,
        };
        assert_eq!(err.status_code(), 422);
        let details = err.details().unwrap();
        assert_eq!(details["required_mb"], 8000);
    }

    #[test]
    fn body_shape_matches_wire_contract() {
        let body = Error::NotFound("task 'x' not found".into()).to_body();
        let wire = serde_json::to_value(&body).unwrap();
        assert_eq!(wire["error_code"], "not_found");
        assert!(wire.get("details").is_none());
    }
}
