use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kernel_core::{
    CapData, CrankExecutor, CrankResult, EndpointDirectory, EndpointHandle, EndpointId, ERef,
    GcEngine, KRef, KernelError, KernelStore, LocalDirectory, Message, MemoryKv, OneResolution,
    Router, RunQueueItem, ServiceManager, Store, Translator,
};
use tracing_subscriber::EnvFilter;

/// A vat stand-in that logs every delivery it receives and never replies
/// with syscalls of its own. Good enough to watch a crank actually run;
/// real vat code lives outside this crate entirely.
struct LoggingEndpoint {
    name: &'static str,
    deliveries: AtomicU64,
}

impl LoggingEndpoint {
    fn new(name: &'static str) -> Self {
        LoggingEndpoint { name, deliveries: AtomicU64::new(0) }
    }
}

#[async_trait]
impl EndpointHandle for LoggingEndpoint {
    async fn deliver_message(
        &self,
        target: ERef,
        message: Message<ERef, ERef>,
    ) -> Result<CrankResult, KernelError> {
        let n = self.deliveries.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(vat = self.name, %target, body = %message.methargs.body, delivery = n, "message delivered");
        Ok(CrankResult::empty())
    }

    async fn deliver_notify(&self, resolutions: Vec<OneResolution<ERef>>) -> Result<CrankResult, KernelError> {
        for r in &resolutions {
            tracing::info!(vat = self.name, target = %r.target, rejected = r.rejected, "promise settled");
        }
        Ok(CrankResult::empty())
    }

    async fn deliver_drop_exports(&self, erefs: Vec<ERef>) -> Result<CrankResult, KernelError> {
        tracing::debug!(vat = self.name, count = erefs.len(), "drop exports");
        Ok(CrankResult::empty())
    }

    async fn deliver_retire_exports(&self, erefs: Vec<ERef>) -> Result<CrankResult, KernelError> {
        tracing::debug!(vat = self.name, count = erefs.len(), "retire exports");
        Ok(CrankResult::empty())
    }

    async fn deliver_retire_imports(&self, erefs: Vec<ERef>) -> Result<CrankResult, KernelError> {
        tracing::debug!(vat = self.name, count = erefs.len(), "retire imports");
        Ok(CrankResult::empty())
    }

    async fn deliver_bring_out_your_dead(&self) -> Result<CrankResult, KernelError> {
        Ok(CrankResult::empty())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let message_count = parse_message_count();

    let store: Arc<dyn Store> = Arc::new(KernelStore::new(Arc::new(MemoryKv::new())));
    let translator = Arc::new(Translator::new(store.clone()));
    let directory = Arc::new(LocalDirectory::new());
    let service = Arc::new(ServiceManager::new(store.clone()));

    let alice = Arc::new(LoggingEndpoint::new("alice"));
    let bob = Arc::new(LoggingEndpoint::new("bob"));
    directory.register(EndpointId::Vat(1), alice);
    directory.register(EndpointId::Vat(2), bob);

    let router = Arc::new(Router::new(store.clone(), translator.clone(), directory.clone(), service));
    let gc = Arc::new(GcEngine::new(store.clone()));
    let executor = CrankExecutor::new(store.clone(), router, translator, gc, directory);

    let koid = store.init_kernel_object(EndpointId::Vat(2)).await?;
    let target = KRef::Object(koid);
    tracing::info!(%target, "bob exports an object, kernel starts sending to it");

    for i in 0..message_count {
        store.increment_ref_count(target, false).await?;
        store
            .enqueue_run(RunQueueItem::Send {
                target,
                message: Message { methargs: CapData::empty(format!("ping {i}")), result: None },
            })
            .await?;
    }

    executor.run_until_idle().await?;
    tracing::info!(sent = message_count, "demo cranks drained, exiting");
    Ok(())
}

fn parse_message_count() -> u64 {
    let args: Vec<String> = std::env::args().collect();
    if let Some(n) = args.windows(2).find(|w| w[0] == "--messages").and_then(|w| w[1].parse().ok()) {
        return n;
    }
    std::env::var("KERNEL_HOST_MESSAGES").ok().and_then(|v| v.parse().ok()).unwrap_or(3)
}
