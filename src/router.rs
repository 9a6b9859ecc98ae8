//! The routing engine.
//!
//! [`Router::complete`] walks the preferred display names of an alias in
//! order. For each name the eligible nodes are ranked afresh (fastest first,
//! then least loaded) and tried one by one until a node produces text. Nodes
//! at capacity or without a matching model are skipped without counting as
//! an attempt. Failures are recorded against the node; the failure that makes
//! a node suspect also starts a background reconciliation of its models.
//!
//! When no node can serve the request the prompt goes to the fallback. The
//! router never fails: the worst case is a diagnostic text.

mod reconcile;
mod think;

pub(crate) use reconcile::reconcile;
pub(crate) use think::strip_think_blocks;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::providers::{Fallback, GenerateRequest, NodeClient};
use crate::registry::{Admission, AliasTable, Registry};

/// The request parameter that selects the alias. It is never forwarded.
const ALIAS_PARAM: &str = "model";

/// Slack added to the attempt bound so tiny pools still get a few tries.
const EXTRA_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub(crate) enum Source {
    /// A node in the pool generated the text.
    Pool,
    /// The fallback service generated the text.
    Fallback,
    /// Nothing could serve the request, the text describes why.
    Unserved,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct Completion {
    pub text: String,
    pub source: Source,
    /// Address of the node that served the request, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

pub(crate) struct Router {
    registry: Arc<Registry>,
    nodes: Arc<dyn NodeClient>,
    fallback: Arc<dyn Fallback>,
    aliases: AliasTable,
}

impl Router {
    pub(crate) fn new(
        registry: Arc<Registry>,
        nodes: Arc<dyn NodeClient>,
        fallback: Arc<dyn Fallback>,
        aliases: AliasTable,
    ) -> Router {
        Router {
            registry,
            nodes,
            fallback,
            aliases,
        }
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub(crate) async fn complete(
        &self,
        prompt: &str,
        alias: &str,
        params: &Map<String, Value>,
    ) -> Completion {
        let names = match self.aliases.resolve(alias) {
            Some(names) => names,
            None => {
                info!(alias, "unknown alias");
                return self.fall_back(prompt, alias).await;
            }
        };

        let mut options = params.clone();
        options.remove(ALIAS_PARAM);

        let bound = self.registry.len() * names.len() + EXTRA_ATTEMPTS;
        let mut attempts = 0;

        for target in names {
            for address in self.registry.ranked(Utc::now()) {
                if attempts >= bound {
                    warn!(alias, attempts, "attempt bound reached");
                    return self.fall_back(prompt, alias).await;
                }

                let offering = match self.registry.try_admit(&address, target) {
                    Admission::Admitted(offering) => offering,
                    Admission::AtCapacity => {
                        debug!(address = %address, model = %target, "provider at capacity");
                        continue;
                    }
                    Admission::NoMatchingModel | Admission::Unknown => continue,
                };

                attempts += 1;

                let request = GenerateRequest {
                    backend_id: &offering.backend_id,
                    prompt,
                    options: &options,
                };

                match self.nodes.generate(&address, &request).await {
                    Ok(generation) => {
                        self.registry.record_success(&address);

                        debug!(
                            address = %address,
                            model = %offering.display_name,
                            attempts,
                            "served"
                        );

                        return Completion {
                            text: strip_think_blocks(&generation.text),
                            source: Source::Pool,
                            provider: Some(address),
                        };
                    }
                    Err(err) => {
                        warn!(
                            address = %address,
                            model = %offering.display_name,
                            attempt = attempts,
                            kind = ?err.kind(),
                            error = %err,
                            "generation failed"
                        );

                        if let Some(generation) = self.registry.record_failure(&address, Utc::now())
                        {
                            self.spawn_reconcile(address, generation);
                        }
                    }
                }
            }
        }

        self.fall_back(prompt, alias).await
    }

    fn spawn_reconcile(&self, address: String, generation: u64) {
        let registry = Arc::clone(&self.registry);
        let nodes = Arc::clone(&self.nodes);

        tokio::spawn(async move {
            reconcile(&registry, nodes.as_ref(), &address, generation).await;
        });
    }

    async fn fall_back(&self, prompt: &str, alias: &str) -> Completion {
        info!(alias, fallback = %self.fallback.id(), "no provider could serve the request");

        match self.fallback.complete(prompt, alias).await {
            Ok(text) => Completion {
                text: strip_think_blocks(&text),
                source: Source::Fallback,
                provider: None,
            },
            Err(err) => {
                warn!(alias, error = %err, "fallback failed");

                Completion {
                    text: format!(
                        "No provider could serve model \"{}\" and the fallback failed: {}",
                        alias, err
                    ),
                    source: Source::Unserved,
                    provider: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::providers::{FallbackIdentifier, Unavailable};
    use crate::providers::{Error, ErrorKind, Generation};
    use crate::registry::{ModelProfile, OfferedModel, ProfileTable, Registration, SuspicionPolicy};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeNodes {
        // address -> generated text, absent means the node fails
        replies: HashMap<String, String>,
        live: HashMap<String, Vec<String>>,
        calls: Mutex<Vec<(String, String, Map<String, Value>)>>,
    }

    impl FakeNodes {
        fn replying(mut self, address: &str, text: &str) -> Self {
            self.replies.insert(address.to_string(), text.to_string());
            self
        }

        fn serving(mut self, address: &str, backend_ids: &[&str]) -> Self {
            self.live.insert(
                address.to_string(),
                backend_ids.iter().map(|id| id.to_string()).collect(),
            );
            self
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(address, backend_id, _)| (address.clone(), backend_id.clone()))
                .collect()
        }
    }

    #[async_trait]
    impl NodeClient for FakeNodes {
        async fn generate(
            &self,
            address: &str,
            request: &GenerateRequest<'_>,
        ) -> Result<Generation, Error> {
            self.calls.lock().unwrap().push((
                address.to_string(),
                request.backend_id.to_string(),
                request.options.clone(),
            ));

            match self.replies.get(address) {
                Some(text) => Ok(Generation { text: text.clone() }),
                None => Err(Error::from_kind(ErrorKind::InternalError)),
            }
        }

        async fn live_models(&self, address: &str) -> Result<Vec<String>, Error> {
            self.live
                .get(address)
                .cloned()
                .ok_or_else(|| Error::from_kind(ErrorKind::Connection))
        }
    }

    struct Echo;

    #[async_trait]
    impl Fallback for Echo {
        fn id(&self) -> FallbackIdentifier {
            FallbackIdentifier::Pollinations
        }

        async fn complete(&self, prompt: &str, model_hint: &str) -> Result<String, Error> {
            Ok(format!("<think>hm</think> fallback {} for {}", prompt, model_hint))
        }
    }

    fn aliases() -> AliasTable {
        AliasTable::new(HashMap::from([
            (
                "micro".to_string(),
                vec!["Andy-4-micro-0516".to_string(), "Andy-4-micro".to_string()],
            ),
            ("tiny".to_string(), vec!["Andy-4-tiny".to_string()]),
        ]))
    }

    fn registry() -> Arc<Registry> {
        let profiles = ProfileTable::new(
            Vec::new(),
            ModelProfile {
                size_billion_params: 1.0,
                vram_per_instance_gb: 1.0,
                default_max_clients: 2,
            },
        );

        Arc::new(Registry::new(profiles, SuspicionPolicy::default()))
    }

    fn join(registry: &Registry, address: &str, models: &[&str], tps: f64) {
        registry
            .register(Registration {
                address: address.to_string(),
                models: models
                    .iter()
                    .map(|name| OfferedModel {
                        name: name.to_string(),
                        backend_id: format!("backend/{}", name),
                        quantization: "Q4_K_M".to_string(),
                        context_length: 8192,
                        release_date: Some("2025-05-16".to_string()),
                    })
                    .collect(),
                max_clients: None,
                avg_tokens_per_second: Some(tps),
                vram_gb: None,
                gpu_info: None,
            })
            .unwrap();
    }

    fn router(registry: &Arc<Registry>, nodes: &Arc<FakeNodes>) -> Router {
        Router::new(
            Arc::clone(registry),
            Arc::clone(nodes) as Arc<dyn NodeClient>,
            Arc::new(Echo),
            aliases(),
        )
    }

    #[tokio::test]
    async fn fastest_provider_is_tried_first() {
        let registry = registry();
        join(&registry, "slow:1", &["Andy-4-tiny"], 10.0);
        join(&registry, "fast:1", &["Andy-4-tiny"], 30.0);

        let nodes = Arc::new(
            FakeNodes::default()
                .replying("slow:1", "slow")
                .replying("fast:1", "<think>\nplan\n</think>\n  fast  "),
        );

        let completion = router(&registry, &nodes)
            .complete("hi", "tiny", &Map::new())
            .await;

        assert_eq!(completion.text, "fast");
        assert_eq!(completion.source, Source::Pool);
        assert_eq!(completion.provider.as_deref(), Some("fast:1"));
        assert_eq!(nodes.calls().len(), 1);
        assert_eq!(registry.provider("fast:1").unwrap().current_load, 0);
    }

    #[tokio::test]
    async fn second_preferred_name_matches() {
        let registry = registry();
        join(&registry, "a:1", &["Andy-4-micro"], 10.0);

        let nodes = Arc::new(FakeNodes::default().replying("a:1", "ok"));

        let completion = router(&registry, &nodes)
            .complete("hi", "micro", &Map::new())
            .await;

        assert_eq!(completion.text, "ok");
        assert_eq!(
            nodes.calls(),
            [("a:1".to_string(), "backend/Andy-4-micro".to_string())]
        );
    }

    #[tokio::test]
    async fn failure_moves_on_to_the_next_provider() {
        let registry = registry();
        join(&registry, "broken:1", &["Andy-4-tiny"], 50.0);
        join(&registry, "good:1", &["Andy-4-tiny"], 5.0);

        let nodes = Arc::new(FakeNodes::default().replying("good:1", "ok"));

        let completion = router(&registry, &nodes)
            .complete("hi", "tiny", &Map::new())
            .await;

        assert_eq!(completion.provider.as_deref(), Some("good:1"));

        let broken = registry.provider("broken:1").unwrap();
        assert_eq!(broken.failure_count, 1);
        assert_eq!(broken.current_load, 0);
        assert!(!broken.is_suspect);
    }

    #[tokio::test]
    async fn alias_parameter_is_not_forwarded() {
        let registry = registry();
        join(&registry, "a:1", &["Andy-4-tiny"], 10.0);

        let nodes = Arc::new(FakeNodes::default().replying("a:1", "ok"));

        let params = json!({"model": "tiny", "temperature": 0.3});
        let params = params.as_object().unwrap();

        router(&registry, &nodes).complete("hi", "tiny", params).await;

        let calls = nodes.calls.lock().unwrap();
        let (_, _, options) = &calls[0];
        assert!(!options.contains_key("model"));
        assert_eq!(options.get("temperature"), Some(&json!(0.3)));
    }

    #[tokio::test]
    async fn unknown_alias_goes_to_the_fallback() {
        let registry = registry();
        join(&registry, "a:1", &["Andy-4-tiny"], 10.0);

        let nodes = Arc::new(FakeNodes::default().replying("a:1", "ok"));

        let completion = router(&registry, &nodes)
            .complete("hi", "gigantic", &Map::new())
            .await;

        assert_eq!(completion.text, "fallback hi for gigantic");
        assert_eq!(completion.source, Source::Fallback);
        assert!(nodes.calls().is_empty());
    }

    #[tokio::test]
    async fn full_providers_are_skipped() {
        let registry = registry();
        join(&registry, "a:1", &["Andy-4-tiny"], 10.0);
        registry.update("a:1", |p| p.current_load = p.max_clients);

        let nodes = Arc::new(FakeNodes::default().replying("a:1", "ok"));

        let completion = router(&registry, &nodes)
            .complete("hi", "tiny", &Map::new())
            .await;

        assert_eq!(completion.source, Source::Fallback);
        assert!(nodes.calls().is_empty());
        assert_eq!(registry.provider("a:1").unwrap().current_load, 2);
    }

    #[tokio::test]
    async fn suspect_provider_is_never_selected() {
        let registry = registry();
        join(&registry, "a:1", &["Andy-4-tiny"], 10.0);
        registry.update("a:1", |p| {
            p.is_suspect = true;
            p.suspect_until = Some(Utc::now() + chrono::Duration::minutes(5));
        });

        let nodes = Arc::new(FakeNodes::default().replying("a:1", "ok"));

        let completion = router(&registry, &nodes)
            .complete("hi", "tiny", &Map::new())
            .await;

        assert_eq!(completion.source, Source::Fallback);
        assert!(nodes.calls().is_empty());
    }

    // Fails every request and registers another node each time it does
    struct Growing {
        registry: Arc<Registry>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl NodeClient for Growing {
        async fn generate(
            &self,
            _address: &str,
            _request: &GenerateRequest<'_>,
        ) -> Result<Generation, Error> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };

            join(&self.registry, &format!("extra:{}", n), &["Andy-4-tiny"], 10.0);

            Err(Error::from_kind(ErrorKind::InternalError))
        }

        async fn live_models(&self, _address: &str) -> Result<Vec<String>, Error> {
            Err(Error::from_kind(ErrorKind::Connection))
        }
    }

    #[tokio::test]
    async fn attempt_bound_stops_a_growing_pool() {
        let registry = registry();
        join(&registry, "a:1", &["Andy-4-tiny"], 10.0);

        let nodes = Arc::new(Growing {
            registry: Arc::clone(&registry),
            calls: Mutex::new(0),
        });

        let names = vec!["Andy-4-tiny".to_string(); 8];
        let router = Router::new(
            Arc::clone(&registry),
            Arc::clone(&nodes) as Arc<dyn NodeClient>,
            Arc::new(Echo),
            AliasTable::new(HashMap::from([("wide".to_string(), names)])),
        );

        let completion = router.complete("hi", "wide", &Map::new()).await;

        assert_eq!(completion.source, Source::Fallback);
        assert_eq!(completion.text, "fallback hi for wide");
        // One provider times eight names, plus the slack
        assert_eq!(*nodes.calls.lock().unwrap(), 8 + EXTRA_ATTEMPTS);
        assert!(registry.len() > 8 + EXTRA_ATTEMPTS);
    }

    #[tokio::test]
    async fn fallback_failure_yields_diagnostic_text() {
        let registry = registry();
        let nodes = Arc::new(FakeNodes::default());

        let router = Router::new(
            Arc::clone(&registry),
            nodes as Arc<dyn NodeClient>,
            Arc::new(Unavailable),
            aliases(),
        );

        let completion = router.complete("hi", "micro", &Map::new()).await;

        assert_eq!(completion.source, Source::Unserved);
        assert!(completion.text.contains("\"micro\""));
        assert!(completion.text.contains("not available"));
    }

    #[tokio::test]
    async fn third_failure_reconciles_the_provider() {
        let registry = registry();
        join(&registry, "a:1", &["Andy-4-tiny"], 10.0);

        // The node answers the tag listing without the advertised model
        let nodes = Arc::new(FakeNodes::default().serving("a:1", &["llama3:8b"]));
        let router = router(&registry, &nodes);

        for _ in 0..2 {
            router.complete("hi", "tiny", &Map::new()).await;
            assert!(!registry.provider("a:1").unwrap().is_suspect);
        }

        router.complete("hi", "tiny", &Map::new()).await;

        let provider = registry.provider("a:1").unwrap();
        assert!(provider.is_suspect);
        assert!(provider.suspect_until.unwrap() > Utc::now() + chrono::Duration::minutes(4));

        for _ in 0..100 {
            if registry.provider("a:1").unwrap().models.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let provider = registry.provider("a:1").unwrap();
        assert!(provider.models.is_empty());
        assert!(provider.is_suspect);

        // Excluded from routing from now on
        router.complete("hi", "tiny", &Map::new()).await;
        assert_eq!(nodes.calls().len(), 3);
    }

    #[tokio::test]
    async fn unreachable_suspect_is_left_alone() {
        let registry = registry();
        join(&registry, "a:1", &["Andy-4-tiny"], 10.0);

        for _ in 0..3 {
            registry.record_failure("a:1", Utc::now());
        }

        let generation = registry.provider("a:1").unwrap().generation;
        let nodes = FakeNodes::default();

        assert!(reconcile(&registry, &nodes, "a:1", generation).await.is_none());

        let provider = registry.provider("a:1").unwrap();
        assert_eq!(provider.models.len(), 1);
        assert_eq!(provider.failure_count, 3);
        assert!(provider.is_suspect);
    }
}
