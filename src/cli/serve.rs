use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use url::Url;

use crate::config::{self, read_config};
use crate::providers::providers::{OllamaClient, Pollinations, Unavailable};
use crate::providers::Fallback;
use crate::registry::Registry;
use crate::router::Router;
use crate::server;
use crate::ServeArgs;

use die::die;

/// Builds the fallback described by the config. A missing API key disables
/// the fallback rather than failing startup.
fn build_fallback(config: &config::Fallback, timeout: Duration) -> Arc<dyn Fallback> {
    if !config.enabled {
        info!("fallback disabled by configuration");
        return Arc::new(Unavailable);
    }

    let url = match Url::parse(&config.url) {
        Ok(url) => url,
        Err(err) => die!("invalid fallback url \"{}\": {}", config.url, err),
    };

    match config.api_key() {
        Some(api_key) => Arc::new(
            Pollinations::new(url, api_key, config.default_model.clone())
                .with_sampling(config.max_tokens, config.temperature)
                .with_timeout(timeout),
        ),
        None => {
            warn!(
                env = %config.api_key_env,
                "fallback API key is not set, requests no provider can serve will fail"
            );
            Arc::new(Unavailable)
        }
    }
}

pub(crate) async fn serve_cmd(args: &ServeArgs) {
    let config = match read_config(args.config.clone()) {
        Ok(config) => config,
        Err(err) => die!("{}", err),
    };

    let listen = args
        .listen
        .clone()
        .unwrap_or_else(|| config.server.listen.clone());

    let registry = Arc::new(Registry::new(
        config.profile_table(),
        config.suspicion_policy(),
    ));

    let nodes = Arc::new(OllamaClient::new(
        config.timeouts.generate(),
        config.timeouts.tags(),
    ));

    let fallback = build_fallback(&config.fallback, config.timeouts.fallback());

    let router = Arc::new(Router::new(
        registry,
        nodes,
        fallback,
        config.alias_table(),
    ));

    let listener = match TcpListener::bind(&listen).await {
        Ok(listener) => listener,
        Err(err) => die!("failed to listen on {}: {}", listen, err),
    };

    if let Err(err) = server::serve(listener, router).await {
        die!("server stopped: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::providers::FallbackIdentifier;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn disabled_fallback_is_unavailable() {
        let config = config::Fallback {
            enabled: false,
            ..Default::default()
        };

        assert_eq!(
            build_fallback(&config, TIMEOUT).id(),
            FallbackIdentifier::Disabled
        );
    }

    #[test]
    fn fallback_needs_a_key() {
        let mut config = config::Fallback {
            api_key_env: "ANDY_BROKER_TEST_UNSET_KEY".to_string(),
            ..Default::default()
        };

        assert_eq!(
            build_fallback(&config, TIMEOUT).id(),
            FallbackIdentifier::Disabled
        );

        std::env::set_var("ANDY_BROKER_TEST_FALLBACK_KEY", "secret");
        config.api_key_env = "ANDY_BROKER_TEST_FALLBACK_KEY".to_string();

        assert_eq!(
            build_fallback(&config, TIMEOUT).id(),
            FallbackIdentifier::Pollinations
        );
    }
}
