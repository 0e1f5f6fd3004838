//! Message routing and delivery (§4.4). Classifies a send target, then
//! performs the refcount bookkeeping and endpoint call the classification
//! implies. The executor calls [`Router::deliver`] once per dequeued item.

use crate::capdata::{CapData, Message, OneResolution};
use crate::endpoint::{CrankResult, EndpointDirectory};
use crate::error::{KernelError, Result};
use crate::gc::GcEngine;
use crate::ids::{EndpointId, KOId, KPId, KRef};
use crate::model::{GcActionKind, PromiseState, RunQueueItem};
use crate::service::ServiceManager;
use crate::store::Store;
use crate::translator::Translator;
use std::sync::Arc;

enum RouteOutcome {
    Splat { value: CapData<KRef> },
    Requeue { target: KRef },
    Send { koid: KOId },
}

pub struct Router {
    store: Arc<dyn Store>,
    translator: Arc<Translator>,
    directory: Arc<dyn EndpointDirectory>,
    service: Arc<ServiceManager>,
}

impl Router {
    pub fn new(
        store: Arc<dyn Store>,
        translator: Arc<Translator>,
        directory: Arc<dyn EndpointDirectory>,
        service: Arc<ServiceManager>,
    ) -> Self {
        Router { store, translator, directory, service }
    }

    /// Returns the endpoint that actually produced a [`CrankResult`], if any
    /// — the executor needs it to address `applyEndpointSyscalls` (§4.6).
    pub async fn deliver(&self, item: RunQueueItem) -> Result<Option<(EndpointId, CrankResult)>> {
        match item {
            RunQueueItem::Send { target, message } => self.deliver_send(target, message).await,
            RunQueueItem::Notify { endpoint, kpid } => self.deliver_notify(endpoint, kpid).await,
            RunQueueItem::GcAction { kind, endpoint, krefs } => {
                self.deliver_gc_action(kind, endpoint, krefs).await
            }
            RunQueueItem::BringOutYourDead { endpoint } => self.deliver_bring_out_your_dead(endpoint).await,
        }
    }

    #[tracing::instrument(skip(self))]
    async fn classify(&self, target: KRef) -> Result<RouteOutcome> {
        match target {
            KRef::Promise(kpid) => {
                let promise = self.store.get_kernel_promise(kpid).await?;
                match promise.state {
                    PromiseState::Unresolved { .. } => Ok(RouteOutcome::Requeue { target }),
                    PromiseState::Rejected { value } => {
                        tracing::warn!(%target, "send splatted: promise already rejected");
                        Ok(RouteOutcome::Splat { value })
                    }
                    PromiseState::Fulfilled { value } => {
                        if value.slots.len() != 1 {
                            tracing::warn!(%target, "send splatted: fulfilled value is not a single object");
                            return Ok(RouteOutcome::Splat { value: CapData::empty("no object") });
                        }
                        match value.slots[0] {
                            KRef::Promise(_) => Ok(RouteOutcome::Requeue { target: value.slots[0] }),
                            KRef::Object(koid) => Ok(RouteOutcome::Send { koid }),
                        }
                    }
                }
            }
            KRef::Object(koid) => {
                if self.store.is_revoked(koid).await? {
                    tracing::warn!(%target, "send splatted: object revoked");
                    return Ok(RouteOutcome::Splat { value: CapData::empty("revoked object") });
                }
                match self.store.get_owner(koid).await? {
                    None => {
                        tracing::warn!(%target, "send splatted: no owner");
                        Ok(RouteOutcome::Splat { value: CapData::empty("no endpoint") })
                    }
                    Some(_) => Ok(RouteOutcome::Send { koid }),
                }
            }
        }
    }

    async fn splat(&self, original_target: KRef, message: Message<KRef, KPId>, value: CapData<KRef>) -> Result<()> {
        self.store.decrement_ref_count(original_target, false).await?;
        for slot in message.methargs.slots {
            self.store.decrement_ref_count(slot, false).await?;
        }
        // A splat still consumes the pipeline's hold on its own result promise
        // — identical to `deliver_send_to_object`'s success path — before
        // settling it, so a splatted send doesn't leak a permanent ref.
        if let Some(result) = message.result {
            self.store.decrement_ref_count(KRef::Promise(result), false).await?;
            self.store.resolve_kernel_promise(result, true, value).await?;
        }
        Ok(())
    }

    async fn deliver_send(
        &self,
        target: KRef,
        message: Message<KRef, KPId>,
    ) -> Result<Option<(EndpointId, CrankResult)>> {
        match self.classify(target).await? {
            RouteOutcome::Splat { value } => {
                self.splat(target, message, value).await?;
                Ok(None)
            }
            RouteOutcome::Requeue { target: new_target } => {
                let KRef::Promise(kpid) = new_target else {
                    return Err(KernelError::StateViolation("requeue target must be a promise".into()));
                };
                self.store.enqueue_promise_message(kpid, message).await?;
                Ok(None)
            }
            RouteOutcome::Send { koid } => self.deliver_send_to_object(koid, target, message).await,
        }
    }

    async fn deliver_send_to_object(
        &self,
        koid: KOId,
        original_target: KRef,
        message: Message<KRef, KPId>,
    ) -> Result<Option<(EndpointId, CrankResult)>> {
        let owner = self.store.get_owner(koid).await?.ok_or_else(|| KernelError::NoOwner(koid.to_string()))?;

        if owner == EndpointId::Kernel {
            self.service.dispatch(koid, message.clone()).await?;
            self.store.decrement_ref_count(original_target, false).await?;
            for slot in message.methargs.slots {
                self.store.decrement_ref_count(slot, false).await?;
            }
            return Ok(None);
        }

        if let Some(result) = message.result {
            self.store.set_promise_decider(result, owner).await?;
            self.store.decrement_ref_count(KRef::Promise(result), false).await?;
        }
        self.store.decrement_ref_count(original_target, false).await?;
        for slot in &message.methargs.slots {
            self.store.decrement_ref_count(*slot, false).await?;
        }

        let e_target = self.translator.translate_ref_k_to_e(owner, original_target, true).await?;
        let e_message = self.translator.translate_message_k_to_e(owner, message.clone()).await?;

        let handle = self.directory.lookup(owner).ok_or_else(|| KernelError::UnknownEntity(owner.to_string()))?;
        match handle.deliver_message(e_target, e_message).await {
            Ok(result) => Ok(Some((owner, result))),
            Err(e) => {
                if let Some(result) = message.result {
                    self.store
                        .resolve_kernel_promise(result, true, CapData::empty(e.splat_body()))
                        .await?;
                }
                Ok(None)
            }
        }
    }

    /// `#deliverNotify`.
    async fn deliver_notify(
        &self,
        endpoint: EndpointId,
        kpid: KPId,
    ) -> Result<Option<(EndpointId, CrankResult)>> {
        let promise = self.store.get_kernel_promise(kpid).await?;
        let Some((value, _rejected)) = promise.state.settled_value() else {
            return Err(KernelError::StateViolation(format!("{kpid} notified while unresolved")));
        };
        let value = value.clone();

        if self.store.kref_to_eref(endpoint, KRef::Promise(kpid)).await?.is_none() {
            return Ok(None);
        }

        let gc = GcEngine::new(self.store.clone());
        let targets = gc.get_kpids_to_retire(kpid, &value).await?;
        if targets.is_empty() {
            return Ok(None);
        }

        let mut resolutions = Vec::with_capacity(targets.len());
        for (i, target_kpid) in targets.iter().enumerate() {
            let target_promise = self.store.get_kernel_promise(*target_kpid).await?;
            let Some((target_value, target_rejected)) = target_promise.state.settled_value() else {
                return Err(KernelError::StateViolation(format!("{target_kpid} not settled during notify")));
            };
            let eref = self
                .translator
                .translate_ref_k_to_e(endpoint, KRef::Promise(*target_kpid), true)
                .await?;
            let translated_value =
                self.translator.translate_capdata_k_to_e(endpoint, target_value.clone(), true).await?;
            resolutions.push(OneResolution { target: eref, rejected: target_rejected, value: translated_value });
            if i > 0 {
                self.store.decrement_ref_count(KRef::Promise(*target_kpid), false).await?;
            }
        }

        let handle = self.directory.lookup(endpoint).ok_or_else(|| KernelError::UnknownEntity(endpoint.to_string()))?;
        let result = handle.deliver_notify(resolutions).await?;
        self.store.decrement_ref_count(KRef::Promise(kpid), false).await?;
        Ok(Some((endpoint, result)))
    }

    async fn deliver_gc_action(
        &self,
        kind: GcActionKind,
        endpoint: EndpointId,
        krefs: Vec<KRef>,
    ) -> Result<Option<(EndpointId, CrankResult)>> {
        let mut erefs = Vec::with_capacity(krefs.len());
        for kref in &krefs {
            let eref = self
                .store
                .kref_to_eref(endpoint, *kref)
                .await?
                .ok_or_else(|| KernelError::InvalidRef(format!("{kref} not in {endpoint}'s c-list")))?;
            erefs.push(eref);
        }
        let handle = self.directory.lookup(endpoint).ok_or_else(|| KernelError::UnknownEntity(endpoint.to_string()))?;
        let result = match kind {
            GcActionKind::DropExports => handle.deliver_drop_exports(erefs).await?,
            GcActionKind::RetireExports => handle.deliver_retire_exports(erefs).await?,
            GcActionKind::RetireImports => handle.deliver_retire_imports(erefs).await?,
        };
        // DropExports only signals loss of reachability; the c-list entry
        // itself is forgotten once the terminal action for this kref lands.
        if matches!(kind, GcActionKind::RetireExports | GcActionKind::RetireImports) {
            for kref in krefs {
                self.store.forget_kref(endpoint, kref).await?;
            }
        }
        Ok(Some((endpoint, result)))
    }

    async fn deliver_bring_out_your_dead(
        &self,
        endpoint: EndpointId,
    ) -> Result<Option<(EndpointId, CrankResult)>> {
        let handle = self.directory.lookup(endpoint).ok_or_else(|| KernelError::UnknownEntity(endpoint.to_string()))?;
        Ok(Some((endpoint, handle.deliver_bring_out_your_dead().await?)))
    }
}
