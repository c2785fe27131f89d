// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the provisioning control plane
//!
//! Every failure a caller can observe is one of these variants with a
//! stable kind and message.  Nothing panics across the
//! pipeline/orchestrator boundary.

use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use uuid::Uuid;

/// An error that can be generated within the provisioning orchestrator
///
/// These may be generated while validating a caller's request, while
/// talking to the virtualization backend, or while running a pipeline.
/// Where possible we reuse existing variants rather than inventing new
/// ones to distinguish cases no programmatic consumer needs to
/// distinguish.
#[derive(Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize)]
pub enum Error {
    /// An object needed as part of this operation was not found.
    #[error("Object (of type {type_name:?}) not found: {lookup}")]
    ObjectNotFound { type_name: ResourceType, lookup: String },
    /// The request was missing a field, malformed, or not satisfiable
    /// given the current state of the system.
    #[error("Invalid Request: {message}")]
    InvalidRequest { message: String },
    /// The requester is not allowed to use the referenced object.
    #[error("Forbidden")]
    Forbidden,
    /// The requested resources exceed a per-VM or aggregate quota limit.
    #[error("Quota exceeded: {message}")]
    QuotaExceeded { message: String },
    /// The virtualization backend rejected or failed an operation.
    #[error("Backend operation failed: {message}")]
    BackendOperation { message: String },
    /// Polling a remote task exhausted its attempt budget.
    ///
    /// The remote operation may still be running; the orchestrator does
    /// not signal the backend to abort it.
    #[error("backend task \"{label}\" timed out after {attempts} poll attempts")]
    BackendTimeout { label: String, attempts: u32 },
    /// Best-effort cleanup after a failed pipeline itself failed.
    ///
    /// Never surfaced to callers as a pipeline's root cause; logged and
    /// swallowed by the pipeline that attempted the cleanup.
    #[error("cleanup failed: {message}")]
    Cleanup { message: String },

    /// The system encountered an unhandled operational error.
    #[error("Internal Error: {internal_message}")]
    InternalError { internal_message: String },
}

/// Identifies a type of object for an `ObjectNotFound` error
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub enum ResourceType {
    Template,
    Vm,
    ProvisioningTask,
    QuotaPlan,
    Tenant,
}

impl Error {
    /// Returns whether the error is likely transient and could
    /// reasonably be retried
    pub fn retryable(&self) -> bool {
        match self {
            Error::BackendOperation { .. } | Error::BackendTimeout { .. } => {
                true
            }

            Error::ObjectNotFound { .. }
            | Error::InvalidRequest { .. }
            | Error::Forbidden
            | Error::QuotaExceeded { .. }
            | Error::Cleanup { .. }
            | Error::InternalError { .. } => false,
        }
    }

    /// Generates an [`Error::ObjectNotFound`] error for a lookup by id.
    pub fn not_found_by_id(type_name: ResourceType, id: &Uuid) -> Error {
        Error::ObjectNotFound { type_name, lookup: id.to_string() }
    }

    /// Generates an [`Error::ObjectNotFound`] error for a lookup by an
    /// arbitrary label (name, (node, vm id) pair, etc.).
    pub fn not_found_by_label(type_name: ResourceType, label: &str) -> Error {
        Error::ObjectNotFound { type_name, lookup: label.to_owned() }
    }

    /// Generates an [`Error::InvalidRequest`] error with the specific
    /// message
    pub fn invalid_request(message: &str) -> Error {
        Error::InvalidRequest { message: message.to_owned() }
    }

    /// Generates an [`Error::QuotaExceeded`] error with the specific
    /// message
    pub fn quota_exceeded(message: &str) -> Error {
        Error::QuotaExceeded { message: message.to_owned() }
    }

    /// Generates an [`Error::BackendOperation`] error with the specific
    /// message
    pub fn backend_operation(message: &str) -> Error {
        Error::BackendOperation { message: message.to_owned() }
    }

    /// Generates an [`Error::InternalError`] error with the specific
    /// message
    ///
    /// InternalError should be used for operational conditions that
    /// should not happen but that we cannot reasonably handle at runtime
    /// (e.g., a task record mutated out of step order).
    pub fn internal_error(internal_message: &str) -> Error {
        Error::InternalError { internal_message: internal_message.to_owned() }
    }

    /// Given an [`Error`] with an internal message, return the same
    /// error with `context` prepended to it
    ///
    /// If the error has no internal message, it is returned unchanged.
    pub fn internal_context<C>(self, context: C) -> Error
    where
        C: Display + Send + Sync + 'static,
    {
        match self {
            Error::ObjectNotFound { .. }
            | Error::InvalidRequest { .. }
            | Error::Forbidden
            | Error::QuotaExceeded { .. }
            | Error::BackendTimeout { .. } => self,
            Error::BackendOperation { message } => Error::BackendOperation {
                message: format!("{}: {}", context, message),
            },
            Error::Cleanup { message } => Error::Cleanup {
                message: format!("{}: {}", context, message),
            },
            Error::InternalError { internal_message } => Error::InternalError {
                internal_message: format!("{}: {}", context, internal_message),
            },
        }
    }
}
