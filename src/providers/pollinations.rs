//! A fallback backed by a hosted text-completion service.
//!
//! The service's response shape has varied over time, so the text is taken
//! from the first field that holds it. An unrecognized body is returned
//! verbatim as JSON rather than dropped.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::apireq::{ReqwestError, Url};
use super::providers::FallbackIdentifier;
use super::{Error as ProviderError, ErrorKind, Fallback};

#[derive(Debug, Error)]
#[error("the completion service responded with {status}: {body}")]
struct StatusError {
    status: StatusCode,
    body: String,
}

#[derive(Serialize, Debug)]
struct CompletionRequest<'r> {
    model: &'r str,
    prompt: &'r str,
    max_tokens: u32,
    temperature: f64,
}

pub(crate) struct Pollinations {
    client: Client,
    url: Url,
    api_key: String,
    default_model: String,
    max_tokens: u32,
    temperature: f64,
    timeout: Duration,
}

impl Pollinations {
    pub(crate) fn new(url: Url, api_key: String, default_model: String) -> Pollinations {
        Pollinations {
            client: Client::new(),
            url,
            api_key,
            default_model,
            max_tokens: 1500,
            temperature: 0.7,
            timeout: Duration::from_secs(45),
        }
    }

    pub(crate) fn with_sampling(mut self, max_tokens: u32, temperature: f64) -> Pollinations {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Pollinations {
        self.timeout = timeout;
        self
    }

    /// The service does not know about quantization tags, "andy-4:q8" is
    /// sent as "andy-4".
    fn model_for<'h>(&'h self, model_hint: &'h str) -> &'h str {
        let model = model_hint.split(':').next().unwrap_or_default().trim();

        if model.is_empty() {
            &self.default_model
        } else {
            model
        }
    }
}

fn status_kind(status: StatusCode) -> ErrorKind {
    match status.as_u16() {
        404 => ErrorKind::NotFound,
        400..=499 => ErrorKind::BadRequest,
        500..=599 => ErrorKind::InternalError,
        _ => ErrorKind::UnspecifiedError,
    }
}

/// Pulls the completion text out of a response body.
pub(super) fn extract_text(body: &Value) -> String {
    let candidates = [
        body.get("completion"),
        body.pointer("/choices/0/text"),
        body.pointer("/data/completion"),
        body.pointer("/data/text"),
    ];

    for candidate in candidates.into_iter().flatten() {
        if let Some(text) = candidate.as_str() {
            return text.to_string();
        }
    }

    warn!("completion service response structure not recognized");

    body.to_string()
}

#[async_trait]
impl Fallback for Pollinations {
    fn id(&self) -> FallbackIdentifier {
        FallbackIdentifier::Pollinations
    }

    async fn complete(&self, prompt: &str, model_hint: &str) -> Result<String, ProviderError> {
        let model = self.model_for(model_hint);

        debug!(url = %self.url, model, "calling fallback completion service");

        let res = self
            .client
            .post(self.url.clone())
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&CompletionRequest {
                model,
                prompt,
                max_tokens: self.max_tokens,
                temperature: self.temperature,
            })
            .send()
            .await
            .map_err(ReqwestError::from)?;

        let status = res.status();

        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();

            return Err(ProviderError::from_source(
                status_kind(status),
                Box::new(StatusError { status, body }),
            ));
        }

        let body: Value = res.json().await.map_err(ReqwestError::from)?;

        Ok(extract_text(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fallback(server: &MockServer) -> Pollinations {
        let url = Url::parse(&format!("{}/v1/text/completions", server.uri())).unwrap();

        Pollinations::new(url, "secret".to_string(), "openai".to_string())
    }

    #[test]
    fn extracts_known_shapes_in_order() {
        assert_eq!(extract_text(&json!({"completion": "a"})), "a");
        assert_eq!(extract_text(&json!({"choices": [{"text": "b"}]})), "b");
        assert_eq!(extract_text(&json!({"data": {"completion": "c"}})), "c");
        assert_eq!(extract_text(&json!({"data": {"text": "d"}})), "d");
        assert_eq!(
            extract_text(&json!({"completion": "first", "choices": [{"text": "second"}]})),
            "first"
        );
        assert_eq!(extract_text(&json!({"other": 1})), r#"{"other":1}"#);
    }

    #[tokio::test]
    async fn sends_bearer_key_and_untagged_model() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/text/completions"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(json!({
                "model": "andy-4",
                "prompt": "hello",
                "max_tokens": 1500,
                "temperature": 0.7,
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"choices": [{"text": "hi"}]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let text = fallback(&server)
            .complete("hello", "andy-4:q8_0")
            .await
            .unwrap();

        assert_eq!(text, "hi");
    }

    #[tokio::test]
    async fn empty_hint_uses_default_model() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(body_json(json!({
                "model": "openai",
                "prompt": "hello",
                "max_tokens": 10,
                "temperature": 0.0,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"completion": "ok"})))
            .expect(1)
            .mount(&server)
            .await;

        let text = fallback(&server)
            .with_sampling(10, 0.0)
            .complete("hello", "")
            .await
            .unwrap();

        assert_eq!(text, "ok");
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = fallback(&server).complete("hello", "micro").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InternalError);
        assert!(err.to_string().contains("overloaded"));
    }
}
