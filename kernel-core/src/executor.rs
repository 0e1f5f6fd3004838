//! The crank executor (§4.5, §4.6): the single-threaded loop that drains the
//! run queue one item at a time, applies whatever syscalls the addressed
//! endpoint made during its turn, and runs GC after every commit.

use crate::endpoint::{EndpointDirectory, Syscall, TerminateInfo};
use crate::error::{KernelError, Result, Severity};
use crate::gc::GcEngine;
use crate::ids::{EndpointId, KRef};
use crate::model::RunQueueItem;
use crate::router::Router;
use crate::store::Store;
use crate::translator::{KernelResolution, KernelSyscall, Translator};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct CrankExecutor {
    store: Arc<dyn Store>,
    router: Arc<Router>,
    translator: Arc<Translator>,
    gc: Arc<GcEngine>,
    directory: Arc<dyn EndpointDirectory>,
    lock: Mutex<()>,
}

impl CrankExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        router: Arc<Router>,
        translator: Arc<Translator>,
        gc: Arc<GcEngine>,
        directory: Arc<dyn EndpointDirectory>,
    ) -> Self {
        CrankExecutor { store, router, translator, gc, directory, lock: Mutex::new(()) }
    }

    /// Drains the run queue. Holds the loop mutex for its whole duration, so
    /// external producers enqueueing messages never observe a half-run crank.
    pub async fn run_until_idle(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        while self.store.run_queue_length().await? > 0 {
            self.run_one_crank().await?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn run_one_crank(&self) -> Result<()> {
        let item = match self.store.dequeue_run().await? {
            Some(item) => item,
            None => return Ok(()),
        };
        tracing::trace!(?item, "crank start");

        self.store.start_crank().await;
        self.store.create_crank_savepoint("initial").await;

        match self.router.deliver(item).await {
            Ok(Some((endpoint, result))) if result.abort => {
                tracing::debug!(%endpoint, "endpoint aborted crank, rolling back");
                self.store.rollback_crank().await?;
            }
            Ok(Some((endpoint, result))) => {
                match self.apply_endpoint_syscalls(endpoint, result.syscalls.clone()).await {
                    Ok(()) => {
                        if let Some(terminate) = &result.terminate {
                            self.mark_vat_as_terminated(terminate).await?;
                        }
                        self.store.end_crank().await?;
                        tracing::trace!(%endpoint, "crank committed");
                    }
                    Err(e) if e.severity() == Severity::CrankFatal => {
                        tracing::warn!(%endpoint, error = %e, "crank fatal, reaping endpoint");
                        self.store.rollback_crank().await?;
                        self.store.schedule_reap(endpoint).await?;
                        self.directory.unregister(endpoint);
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::error!(%endpoint, error = %e, "engine fatal, halting");
                        self.store.rollback_crank().await?;
                        return Err(e);
                    }
                }
            }
            Ok(None) => {
                self.store.end_crank().await?;
            }
            Err(e) if e.severity() == Severity::Recoverable => {
                tracing::warn!(error = %e, "recoverable error, crank committed anyway");
                self.store.end_crank().await?;
            }
            Err(e) if e.severity() == Severity::CrankFatal => {
                tracing::warn!(error = %e, "crank fatal before dispatch, rolling back");
                self.store.rollback_crank().await?;
            }
            Err(e) => {
                tracing::error!(error = %e, "engine fatal, halting");
                self.store.rollback_crank().await?;
                return Err(e);
            }
        }

        self.gc.collect_garbage().await?;
        if let Some(reap) = self.gc.next_reap_action().await? {
            self.store.enqueue_run(reap).await?;
        }
        Ok(())
    }

    async fn mark_vat_as_terminated(&self, terminate: &TerminateInfo) -> Result<()> {
        self.store.schedule_reap(terminate.endpoint).await?;
        self.directory.unregister(terminate.endpoint);
        Ok(())
    }

    /// `applyEndpointSyscalls` (§4.6). Translates each syscall E→K, then
    /// applies it against the store in order; a failure here aborts the
    /// crank via the caller's rollback.
    async fn apply_endpoint_syscalls(&self, endpoint: EndpointId, syscalls: Vec<Syscall>) -> Result<()> {
        for syscall in syscalls {
            let translated = self.translator.translate_syscall_v_to_k(endpoint, syscall).await?;
            self.apply_one(endpoint, translated).await?;
        }
        Ok(())
    }

    async fn apply_one(&self, endpoint: EndpointId, syscall: KernelSyscall) -> Result<()> {
        match syscall {
            KernelSyscall::Send { target, message } => {
                self.store.increment_ref_count(target, false).await?;
                for slot in &message.methargs.slots {
                    self.store.increment_ref_count(*slot, false).await?;
                }
                if let Some(result) = message.result {
                    self.store.increment_ref_count(KRef::Promise(result), false).await?;
                }
                self.store.enqueue_run(RunQueueItem::Send { target, message }).await
            }
            KernelSyscall::Subscribe { promise } => {
                if self.store.subscribe_to_promise(promise, endpoint).await?.is_some() {
                    self.store.enqueue_run(RunQueueItem::Notify { endpoint, kpid: promise }).await?;
                }
                Ok(())
            }
            KernelSyscall::Resolve { resolutions } => {
                for KernelResolution { promise, rejected, value } in resolutions {
                    let current = self.store.get_kernel_promise(promise).await?;
                    let is_decider = matches!(
                        current.state,
                        crate::model::PromiseState::Unresolved { decider: Some(d), .. } if d == endpoint
                    );
                    if !is_decider {
                        return Err(KernelError::StateViolation(format!(
                            "{endpoint} is not the decider of {promise}"
                        )));
                    }
                    self.store.resolve_kernel_promise(promise, rejected, value).await?;
                }
                Ok(())
            }
            KernelSyscall::Exit { is_failure, info } => {
                self.store.schedule_reap(endpoint).await?;
                if is_failure {
                    return Err(KernelError::StateViolation(format!(
                        "{endpoint} exited with failure: {}",
                        info.body
                    )));
                }
                Ok(())
            }
            KernelSyscall::DropImports { krefs } => {
                for kref in krefs {
                    self.store.forget_kref(endpoint, kref).await?;
                    self.store.decrement_ref_count(kref, false).await?;
                }
                Ok(())
            }
            KernelSyscall::RetireImports { krefs } => {
                for kref in krefs {
                    self.store.forget_kref(endpoint, kref).await?;
                }
                Ok(())
            }
            KernelSyscall::RetireExports { krefs } => self.gc.retire_kernel_objects(krefs).await,
            KernelSyscall::AbandonExports { krefs } => {
                for kref in krefs {
                    self.store.decrement_ref_count(kref, true).await?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capdata::{CapData, Message, OneResolution};
    use crate::endpoint::{CrankResult, EndpointHandle, LocalDirectory};
    use crate::ids::{ERef, Polarity};
    use crate::kv::MemoryKv;
    use crate::service::ServiceManager;
    use crate::store::KernelStore;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct ScriptedEndpoint {
        reply_syscalls: StdMutex<Vec<Syscall>>,
    }

    #[async_trait]
    impl EndpointHandle for ScriptedEndpoint {
        async fn deliver_message(
            &self,
            _target: ERef,
            _message: Message<ERef, ERef>,
        ) -> std::result::Result<CrankResult, KernelError> {
            let syscalls = std::mem::take(&mut *self.reply_syscalls.lock().unwrap());
            Ok(CrankResult::with_syscalls(syscalls))
        }
        async fn deliver_notify(
            &self,
            _resolutions: Vec<OneResolution<ERef>>,
        ) -> std::result::Result<CrankResult, KernelError> {
            Ok(CrankResult::empty())
        }
        async fn deliver_drop_exports(&self, _erefs: Vec<ERef>) -> std::result::Result<CrankResult, KernelError> {
            Ok(CrankResult::empty())
        }
        async fn deliver_retire_exports(&self, _erefs: Vec<ERef>) -> std::result::Result<CrankResult, KernelError> {
            Ok(CrankResult::empty())
        }
        async fn deliver_retire_imports(&self, _erefs: Vec<ERef>) -> std::result::Result<CrankResult, KernelError> {
            Ok(CrankResult::empty())
        }
        async fn deliver_bring_out_your_dead(&self) -> std::result::Result<CrankResult, KernelError> {
            Ok(CrankResult::empty())
        }
    }

    fn build() -> (CrankExecutor, Arc<dyn Store>, Arc<ScriptedEndpoint>) {
        let store: Arc<dyn Store> = Arc::new(KernelStore::new(Arc::new(MemoryKv::new())));
        let translator = Arc::new(Translator::new(store.clone()));
        let directory = Arc::new(LocalDirectory::new());
        let service = Arc::new(ServiceManager::new(store.clone()));
        let endpoint = Arc::new(ScriptedEndpoint { reply_syscalls: StdMutex::new(Vec::new()) });
        directory.register(EndpointId::Vat(1), endpoint.clone());
        let router = Arc::new(Router::new(store.clone(), translator.clone(), directory.clone(), service));
        let gc = Arc::new(GcEngine::new(store.clone()));
        let executor = CrankExecutor::new(store.clone(), router, translator, gc, directory);
        (executor, store, endpoint)
    }

    #[tokio::test]
    async fn delivering_a_message_drains_the_queue() {
        let (executor, store, _endpoint) = build();
        let owner = EndpointId::Vat(1);
        let koid = store.init_kernel_object(owner).await.unwrap();
        let target = KRef::Object(koid);
        store.increment_ref_count(target, false).await.unwrap();
        store.enqueue_run(RunQueueItem::Send { target, message: Message { methargs: CapData::empty("hi"), result: None } }).await.unwrap();

        executor.run_until_idle().await.unwrap();
        assert_eq!(store.run_queue_length().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn endpoint_resolve_syscall_settles_promise_and_notifies_subscriber() {
        let (executor, store, endpoint) = build();
        let owner = EndpointId::Vat(1);
        let koid = store.init_kernel_object(owner).await.unwrap();
        let target = KRef::Object(koid);
        store.increment_ref_count(target, false).await.unwrap();

        let kpid = store.init_kernel_promise().await.unwrap();
        let message = Message { methargs: CapData::empty("call"), result: Some(kpid) };
        store.enqueue_run(RunQueueItem::Send { target, message }).await.unwrap();

        // Scripted reply: the vat sees kp1's result as p-1 (its first
        // imported promise) and immediately resolves it.
        let resolve = Syscall::Resolve {
            resolutions: vec![crate::endpoint::SyscallResolution {
                promise: ERef::local_promise(Polarity::Import, 1),
                rejected: false,
                value: CapData::empty("done"),
            }],
        };
        endpoint.reply_syscalls.lock().unwrap().push(resolve);

        executor.run_until_idle().await.unwrap();

        let promise = store.get_kernel_promise(kpid).await.unwrap();
        assert!(matches!(promise.state, crate::model::PromiseState::Fulfilled { .. }));
    }
}
