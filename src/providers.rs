//! Clients for the services the broker talks to.
//!
//! The `providers` module contains the outbound side of the broker. Two
//! interfaces are defined here:
//!
//! ## Compute Nodes
//!
//! Every node in the pool exposes an Ollama-compatible HTTP API. The
//! [`NodeClient`] trait captures the two operations the broker needs from a
//! node:
//! - Generate: run a single, non-streamed completion with a given backend model.
//! - Live models: list the models the node currently has available, used to
//!   reconcile a node's advertised offerings after it starts failing.
//!
//! ## Fallback
//!
//! When no node can serve a request, the broker hands it to a third-party
//! completion service through the [`Fallback`] trait. The fallback may be a
//! real service or a stub which always declines.
//!
//! ## Error Handling
//!
//! Each remote API reports failures in its own way. These are encapsulated in
//! [`Error`], and the [`ErrorKind`] enum provides an indication of the category
//! of error that was raised. The router treats every kind the same way (the
//! node failed) but the kind is recorded in the logs.

mod apireq;
mod fallback;
mod ollama;
mod pollinations;

pub(crate) mod providers;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::error::Error as StdError;
use std::fmt;

use self::providers::FallbackIdentifier;

/// This is a list specifying general categories of errors that
/// can be returned by a [`NodeClient`] or a [`Fallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorKind {
    /// Failed to connect to the remote service. This could be due
    /// to network issues like DNS resolution, connectivity issues,
    /// or an address which does not parse as a URL.
    Connection,
    /// A request timed out.
    TimedOut,
    /// The requested resource was not found. For a node this
    /// usually means the backend model is not loaded.
    NotFound,
    /// The request was malformed or is otherwise improper. This
    /// often corresponds to errors with HTTP status codes in
    /// the 400s.
    BadRequest,
    /// The server encountered an error. This often corresponds to
    /// errors with HTTP status codes in the 500s.
    InternalError,
    /// A response was unable to be deserialized, malformed,
    /// or otherwise violated the assumptions of the client.
    UnexpectedResponse,
    /// The service is not configured or not implemented.
    Unavailable,
    /// An error that does not fit into any of the other categories.
    UnspecifiedError,
}

#[derive(Debug)]
pub(crate) struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub(crate) fn from_kind(kind: ErrorKind) -> Error {
        Error { kind, source: None }
    }

    pub(crate) fn from_source(kind: ErrorKind, source: Box<dyn StdError + Send + Sync>) -> Error {
        Error {
            kind,
            source: Some(source),
        }
    }

    pub(crate) fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn message(&self) -> &'static str {
        match self.kind {
            ErrorKind::Connection => "failed to connect to the remote service",
            ErrorKind::TimedOut => "request timed out",
            ErrorKind::NotFound => "the requested resource was not found",
            ErrorKind::BadRequest => "the request was bad or malformed",
            ErrorKind::InternalError => "the server encountered an internal error",
            ErrorKind::UnexpectedResponse => "response was unexpected or malformed",
            ErrorKind::Unavailable => "the service is not available",
            ErrorKind::UnspecifiedError => "an unspecified error occurred",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())?;

        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_ref().map(|e| &**e as _)
    }
}

/// A single, non-streamed generation against one node.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GenerateRequest<'r> {
    /// The identifier the node's API expects, not the display name.
    pub backend_id: &'r str,
    pub prompt: &'r str,
    /// Caller-supplied parameters merged into the request body. They
    /// cannot override the model, the prompt, or streaming.
    pub options: &'r Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Generation {
    /// The generated text, exactly as the node returned it.
    pub text: String,
}

/// A trait implemented by clients of compute nodes.
#[async_trait]
pub(crate) trait NodeClient: Send + Sync {
    /// Runs one generation on the node at `address`.
    async fn generate(
        &self,
        address: &str,
        request: &GenerateRequest<'_>,
    ) -> Result<Generation, Error>;

    /// Returns the backend identifiers of the models the node reports as
    /// available.
    async fn live_models(&self, address: &str) -> Result<Vec<String>, Error>;
}

/// The completion service of last resort.
#[async_trait]
pub(crate) trait Fallback: Send + Sync {
    fn id(&self) -> FallbackIdentifier;

    /// Completes `prompt`. The model hint is the alias the caller asked for.
    async fn complete(&self, prompt: &str, model_hint: &str) -> Result<String, Error>;
}
