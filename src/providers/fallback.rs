use async_trait::async_trait;
use thiserror::Error;

use super::providers::FallbackIdentifier;
use super::{Error as ProviderError, ErrorKind, Fallback};

#[derive(Debug, Error)]
#[error("no fallback completion service is configured")]
struct NotImplemented;

/// A fallback which declines every request. Used when the fallback is
/// disabled or its credentials are missing.
#[derive(Debug, Default)]
pub(crate) struct Unavailable;

#[async_trait]
impl Fallback for Unavailable {
    fn id(&self) -> FallbackIdentifier {
        FallbackIdentifier::Disabled
    }

    async fn complete(&self, _prompt: &str, _model_hint: &str) -> Result<String, ProviderError> {
        Err(ProviderError::from_source(
            ErrorKind::Unavailable,
            Box::new(NotImplemented),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_declines() {
        let err = Unavailable.complete("hello", "micro").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert_eq!(
            err.to_string(),
            "the service is not available: no fallback completion service is configured"
        );
    }
}
