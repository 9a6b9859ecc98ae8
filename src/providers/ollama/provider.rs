use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::api;
use crate::providers::apireq::node_base_url;
use crate::providers::{Error, ErrorKind, GenerateRequest, Generation, NodeClient};

impl From<api::Error> for Error {
    fn from(value: api::Error) -> Self {
        let kind = match value {
            api::Error::RequestFailed(err) => return err.into(),
            api::Error::InternalError(_) => ErrorKind::InternalError,
            api::Error::InvalidApiBase(_) | api::Error::InvalidEndpoint(_) => {
                ErrorKind::Connection
            }
            api::Error::NotFound(_) => ErrorKind::NotFound,
            api::Error::BadRequest(_) => ErrorKind::BadRequest,
            api::Error::MalformedResponse(_) => ErrorKind::UnexpectedResponse,
            api::Error::UnspecifiedError(_) => ErrorKind::UnspecifiedError,
        };

        Error::from_source(kind, Box::new(value))
    }
}

/// Talks to the Ollama-compatible API of any node in the pool. A single
/// client is shared by every node so connections are pooled.
pub(crate) struct OllamaClient {
    client: Client,
    generate_timeout: Duration,
    tags_timeout: Duration,
}

impl OllamaClient {
    pub(crate) fn new(generate_timeout: Duration, tags_timeout: Duration) -> OllamaClient {
        OllamaClient {
            client: Client::new(),
            generate_timeout,
            tags_timeout,
        }
    }

    fn api(&self, address: &str) -> Result<api::OllamaApi, api::Error> {
        api::OllamaApi::with_api_base(self.client.clone(), &node_base_url(address))
    }
}

#[async_trait]
impl NodeClient for OllamaClient {
    async fn generate(
        &self,
        address: &str,
        request: &GenerateRequest<'_>,
    ) -> Result<Generation, Error> {
        let res = self
            .api(address)?
            .generate(
                request.backend_id,
                request.prompt,
                request.options,
                self.generate_timeout,
            )
            .await?;

        Ok(Generation {
            text: res.into_text()?,
        })
    }

    async fn live_models(&self, address: &str) -> Result<Vec<String>, Error> {
        let tags = self.api(address)?.tags(self.tags_timeout).await?;

        Ok(tags.into_iter().map(|tag| tag.name).collect())
    }
}
