use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

use crate::providers::apireq::{self, Url};

const GENERATE_ENDPOINT: &str = "/api/generate";
const TAGS_ENDPOINT: &str = "/api/tags";

#[derive(Debug, Error)]
pub(super) enum Error {
    #[error("invalid ollama api base: {0}")]
    InvalidApiBase(url::ParseError),

    #[error("invalid ollama endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error("a request to ollama failed: {0}")]
    RequestFailed(#[from] apireq::ReqwestError),

    #[error("failed to query ollama resource: {0}")]
    NotFound(String),

    #[error("request to the ollama api failed: {0}")]
    BadRequest(String),

    #[error("ollama encountered an internal error: {0}")]
    InternalError(String),

    #[error("the ollama API returned an unspecified error: {0}")]
    UnspecifiedError(String),

    #[error("the generation response was malformed: {0}")]
    MalformedResponse(&'static str),
}

/* === IO === */

// Body of /api/generate. Caller options come first so the fixed fields win.
#[derive(Serialize, Debug)]
struct GenerateRequest<'m> {
    #[serde(flatten)]
    options: Map<String, Value>,
    model: &'m str,
    prompt: &'m str,
    stream: bool,
}

#[derive(Deserialize, Debug)]
pub(super) struct GenerateResponse {
    #[serde(default)]
    response: Option<Value>,
    #[serde(default)]
    done: bool,
}

impl GenerateResponse {
    /// The generated text. An empty string only counts as a completion when
    /// the node also reports `done`.
    pub(super) fn into_text(self) -> Result<String, Error> {
        match self.response {
            Some(Value::String(text)) if !text.is_empty() || self.done => Ok(text),
            Some(Value::String(_)) => Err(Error::MalformedResponse(
                "empty response before the generation finished",
            )),
            Some(_) => Err(Error::MalformedResponse("response is not a string")),
            None => Err(Error::MalformedResponse("response is missing")),
        }
    }
}

// Structures to deseralize /api/tags

#[derive(Debug, Deserialize)]
pub(super) struct Tag {
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct TagsList {
    #[serde(default)]
    models: Vec<Tag>,
}

// Errors
#[derive(Debug, Deserialize)]
struct ApiError {
    error: String,
}

pub(super) struct OllamaApi {
    client: Client,
    api_base: Url,
}

impl OllamaApi {
    pub(super) fn with_api_base(client: Client, api_base: &str) -> Result<OllamaApi, Error> {
        Ok(OllamaApi {
            client,
            api_base: Url::parse(api_base).map_err(Error::InvalidApiBase)?,
        })
    }

    /// Maps a non-2xx response onto an error. Nodes are not guaranteed to
    /// send a JSON error body, so the raw text is kept when it does not parse.
    pub(super) async fn maybe_parse_api_error(res: Response) -> Result<Response, Error> {
        let status = res.status();

        if status.is_success() {
            return Ok(res);
        }

        let body = res.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ApiError>(&body) {
            Ok(err) => err.error,
            Err(_) if body.is_empty() => status.to_string(),
            Err(_) => body,
        };

        match status {
            StatusCode::NOT_FOUND => Err(Error::NotFound(message)),
            code => match code.as_u16() {
                400..=499 => Err(Error::BadRequest(message)),
                500..=599 => Err(Error::InternalError(message)),
                _ => Err(Error::UnspecifiedError(message)),
            },
        }
    }

    pub(super) async fn tags(&self, timeout: Duration) -> Result<Vec<Tag>, Error> {
        let url = self.api_base.join(TAGS_ENDPOINT)?;

        let res = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::RequestFailed(e.into()))?;

        let res = Self::maybe_parse_api_error(res).await?;

        let tags: TagsList = res
            .json()
            .await
            .map_err(|e| Error::RequestFailed(e.into()))?;

        Ok(tags.models)
    }

    pub(super) async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<GenerateResponse, Error> {
        let url = self.api_base.join(GENERATE_ENDPOINT)?;

        let mut options = options.clone();
        for fixed in ["model", "prompt", "stream"] {
            options.remove(fixed);
        }

        let res = self
            .client
            .post(url)
            .timeout(timeout)
            .json(&GenerateRequest {
                options,
                model,
                prompt,
                stream: false,
            })
            .send()
            .await
            .map_err(|e| Error::RequestFailed(e.into()))?;

        let res = Self::maybe_parse_api_error(res).await?;

        res.json()
            .await
            .map_err(|e| Error::RequestFailed(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn api(server: &MockServer) -> OllamaApi {
        OllamaApi::with_api_base(Client::new(), &server.uri()).unwrap()
    }

    #[tokio::test]
    async fn generate_sends_fixed_fields_over_options() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_json(json!({
                "temperature": 0.2,
                "model": "hf.co/sweaterdog/Andy-4-micro:Q4_K_M",
                "prompt": "hello",
                "stream": false,
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"response": "hi", "done": true})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut options = Map::new();
        options.insert("temperature".to_string(), json!(0.2));
        options.insert("stream".to_string(), json!(true));
        options.insert("model".to_string(), json!("something-else"));

        let res = api(&server)
            .await
            .generate(
                "hf.co/sweaterdog/Andy-4-micro:Q4_K_M",
                "hello",
                &options,
                TIMEOUT,
            )
            .await
            .unwrap();

        assert_eq!(res.into_text().unwrap(), "hi");
    }

    #[test]
    fn empty_text_needs_done() {
        let done: GenerateResponse =
            serde_json::from_value(json!({"response": "", "done": true})).unwrap();
        assert_eq!(done.into_text().unwrap(), "");

        let unfinished: GenerateResponse =
            serde_json::from_value(json!({"response": "", "done": false})).unwrap();
        assert!(matches!(
            unfinished.into_text(),
            Err(Error::MalformedResponse(_))
        ));

        let missing: GenerateResponse = serde_json::from_value(json!({"done": true})).unwrap();
        assert!(matches!(missing.into_text(), Err(Error::MalformedResponse(_))));

        let number: GenerateResponse =
            serde_json::from_value(json!({"response": 42, "done": true})).unwrap();
        assert!(matches!(number.into_text(), Err(Error::MalformedResponse(_))));
    }

    #[tokio::test]
    async fn error_statuses_are_classified() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({"error": "model not found"})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500).set_body_string("out of memory"))
            .mount(&server)
            .await;

        let api = api(&server).await;
        let options = Map::new();

        match api.generate("m", "p", &options, TIMEOUT).await {
            Err(Error::NotFound(msg)) => assert_eq!(msg, "model not found"),
            other => panic!("expected not found, got {:?}", other),
        }

        match api.generate("m", "p", &options, TIMEOUT).await {
            Err(Error::InternalError(msg)) => assert_eq!(msg, "out of memory"),
            other => panic!("expected internal error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn slow_nodes_time_out() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"response": "late", "done": true}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let res = api(&server)
            .await
            .generate("m", "p", &Map::new(), Duration::from_millis(100))
            .await;

        match res {
            Err(Error::RequestFailed(err)) => {
                assert_eq!(err.kind(), apireq::ReqwestErrorKind::TimedOut)
            }
            other => panic!("expected a timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn tags_lists_backend_identifiers() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [
                    {"name": "hf.co/sweaterdog/Andy-4-micro:Q4_K_M", "size": 1678456656},
                    {"name": "llama3:8b"},
                ]
            })))
            .mount(&server)
            .await;

        let tags = api(&server).await.tags(TIMEOUT).await.unwrap();
        let names: Vec<_> = tags.into_iter().map(|t| t.name).collect();

        assert_eq!(names, ["hf.co/sweaterdog/Andy-4-micro:Q4_K_M", "llama3:8b"]);
    }
}
