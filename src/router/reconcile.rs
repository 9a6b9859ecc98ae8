use std::collections::HashSet;
use tracing::{info, warn};

use crate::providers::NodeClient;
use crate::registry::{Reconciled, Registry};

/// Compares a suspect node's offerings with the models it reports as loaded
/// and drops the ones it no longer serves.
///
/// A node that cannot be reached is left as it is. `generation` is the
/// registration generation observed when the node turned suspect; if the node
/// re-registered in the meantime the result is discarded.
pub(crate) async fn reconcile(
    registry: &Registry,
    nodes: &dyn NodeClient,
    address: &str,
    generation: u64,
) -> Option<Reconciled> {
    let live: HashSet<String> = match nodes.live_models(address).await {
        Ok(models) => models.into_iter().collect(),
        Err(err) => {
            warn!(address, error = %err, "could not list models of suspect provider");
            return None;
        }
    };

    let reconciled = match registry.prune_to_live(address, generation, &live) {
        Some(reconciled) => reconciled,
        None => {
            info!(address, "provider re-registered during reconciliation, result discarded");
            return None;
        }
    };

    if reconciled.kept == 0 {
        warn!(
            address,
            dropped = ?reconciled.dropped,
            "provider serves none of its advertised models, it stays suspect"
        );
    } else {
        info!(
            address,
            kept = reconciled.kept,
            dropped = ?reconciled.dropped,
            "reconciled provider models"
        );
    }

    Some(reconciled)
}
