//! Extended invariant fuzz campaign for kernel-core, run out-of-band from
//! `cargo test` (it's unbounded — pass `--iterations` to extend it, or just
//! let it run for a while in CI as a nightly job).

use std::sync::Arc;

use kernel_core::{
    EndpointId, GcEngine, KOId, KRef, KernelStore, MemoryKv, Store,
};
use rand::Rng;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let iterations = parse_iterations();
    tracing::info!(iterations, "starting refcount/GC fuzz campaign");

    let mut failures = 0u64;
    for i in 0..iterations {
        if let Err(e) = run_one_round().await {
            failures += 1;
            tracing::error!(round = i, error = %e, "invariant violated");
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures}/{iterations} rounds violated an invariant");
    }
    tracing::info!(iterations, "all rounds held P1 (refcount consistency) and P6 (maybeFree drained)");
    Ok(())
}

/// One round: build a handful of objects, hammer their refcounts with a
/// random walk of increments/decrements/c-list churn, run GC, and check
/// that nothing panicked and the invariants that survive GC still hold.
async fn run_one_round() -> anyhow::Result<()> {
    let store: Arc<dyn Store> = Arc::new(KernelStore::new(Arc::new(MemoryKv::new())));
    let gc = GcEngine::new(store.clone());
    let owner = EndpointId::Vat(1);

    let object_count = rand::thread_rng().gen_range(1..8);
    let mut koids: Vec<KOId> = Vec::with_capacity(object_count);
    for _ in 0..object_count {
        koids.push(store.init_kernel_object(owner).await?);
    }

    let op_count = rand::thread_rng().gen_range(0..200);
    for _ in 0..op_count {
        let koid = koids[rand::thread_rng().gen_range(0..koids.len())];
        let kref = KRef::Object(koid);
        let only_recognizable = rand::thread_rng().gen_bool(0.3);
        if rand::thread_rng().gen_bool(0.5) {
            store.increment_ref_count(kref, only_recognizable).await?;
        } else {
            store.decrement_ref_count(kref, only_recognizable).await?;
        }

        let obj = store.get_kernel_object(koid).await?;
        if !obj.is_consistent() {
            anyhow::bail!("P1 violated: {koid} reachable={} recognizable={}", obj.reachable, obj.recognizable);
        }
    }

    gc.collect_garbage().await?;
    let leftover = store.take_maybe_free_krefs().await?;
    if !leftover.is_empty() {
        anyhow::bail!("P6 violated: {} krefs still pending after collect_garbage", leftover.len());
    }
    Ok(())
}

fn parse_iterations() -> u64 {
    let args: Vec<String> = std::env::args().collect();
    if let Some(n) = args.windows(2).find(|w| w[0] == "--iterations").and_then(|w| w[1].parse().ok()) {
        return n;
    }
    std::env::var("XTASK_ITERATIONS").ok().and_then(|v| v.parse().ok()).unwrap_or(500)
}
