//! Engine errors.
//!
//! Every variant records the backend that failed and the operation that was
//! running, so callers can always tell where a failure came from.

use thiserror::Error;

use crate::types::{Backend, Quantization};

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("{backend}.{operation}: validation failed: {message}")]
    Validation {
        backend: Backend,
        operation: &'static str,
        message: String,
    },

    #[error("{backend}.{operation}: dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        backend: Backend,
        operation: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{backend}.{operation}: quantization mismatch: stored {stored}, query {query}")]
    QuantizationMismatch {
        backend: Backend,
        operation: &'static str,
        stored: Quantization,
        query: Quantization,
    },

    #[error("{backend}.{operation}: not found: {what}")]
    NotFound {
        backend: Backend,
        operation: &'static str,
        what: String,
    },

    /// Dual-write split: one backend committed, `backend` did not.
    #[error("{operation}: partial write of {id}: {backend} backend failed: {reason}")]
    PartialWrite {
        backend: Backend,
        operation: &'static str,
        id: String,
        reason: String,
    },

    #[error("{backend}.{operation}: deadline of {deadline_ms}ms exceeded")]
    Timeout {
        backend: Backend,
        operation: &'static str,
        deadline_ms: u64,
    },

    #[error("{backend}.{operation}: configuration error: {message}")]
    Configuration {
        backend: Backend,
        operation: &'static str,
        message: String,
    },

    #[error("{backend}.{operation}: cancelled")]
    Cancelled {
        backend: Backend,
        operation: &'static str,
    },

    #[error("{backend}.{operation}: storage error: {message}")]
    Storage {
        backend: Backend,
        operation: &'static str,
        message: String,
    },

    #[error("{backend}.{operation}: serialization error: {message}")]
    Serialization {
        backend: Backend,
        operation: &'static str,
        message: String,
    },
}

impl MemoryError {
    pub fn validation(backend: Backend, operation: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            backend,
            operation,
            message: message.into(),
        }
    }

    pub fn storage(backend: Backend, operation: &'static str, message: impl ToString) -> Self {
        Self::Storage {
            backend,
            operation,
            message: message.to_string(),
        }
    }

    pub fn serialization(backend: Backend, operation: &'static str, message: impl ToString) -> Self {
        Self::Serialization {
            backend,
            operation,
            message: message.to_string(),
        }
    }

    pub fn configuration(backend: Backend, operation: &'static str, message: impl Into<String>) -> Self {
        Self::Configuration {
            backend,
            operation,
            message: message.into(),
        }
    }

    /// The backend the failure is attributed to.
    pub fn backend(&self) -> Backend {
        match self {
            Self::Validation { backend, .. }
            | Self::DimensionMismatch { backend, .. }
            | Self::QuantizationMismatch { backend, .. }
            | Self::NotFound { backend, .. }
            | Self::PartialWrite { backend, .. }
            | Self::Timeout { backend, .. }
            | Self::Configuration { backend, .. }
            | Self::Cancelled { backend, .. }
            | Self::Storage { backend, .. }
            | Self::Serialization { backend, .. } => *backend,
        }
    }

    /// The operation that was running when the failure happened.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Validation { operation, .. }
            | Self::DimensionMismatch { operation, .. }
            | Self::QuantizationMismatch { operation, .. }
            | Self::NotFound { operation, .. }
            | Self::PartialWrite { operation, .. }
            | Self::Timeout { operation, .. }
            | Self::Configuration { operation, .. }
            | Self::Cancelled { operation, .. }
            | Self::Storage { operation, .. }
            | Self::Serialization { operation, .. } => operation,
        }
    }

    /// Caller mistakes: fail fast, never retry.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::DimensionMismatch { .. }
                | Self::Configuration { .. }
                | Self::QuantizationMismatch { .. }
        )
    }

    /// Re-attribute the operation name, keeping everything else.
    pub fn in_operation(mut self, op: &'static str) -> Self {
        match &mut self {
            Self::Validation { operation, .. }
            | Self::DimensionMismatch { operation, .. }
            | Self::QuantizationMismatch { operation, .. }
            | Self::NotFound { operation, .. }
            | Self::PartialWrite { operation, .. }
            | Self::Timeout { operation, .. }
            | Self::Configuration { operation, .. }
            | Self::Cancelled { operation, .. }
            | Self::Storage { operation, .. }
            | Self::Serialization { operation, .. } => *operation = op,
        }
        self
    }
}
