//! The `Store` trait (§4.1): typed accessors over persistent kernel state,
//! layered on a [`crate::kv::KVStore`]. `KernelStore` is the only
//! implementation; it owns key-schema decisions so nothing else in the crate
//! formats a key string.

use crate::capdata::{CapData, Message};
use crate::error::{KernelError, Result};
use crate::ids::{Counter, EndpointId, ERef, KOId, KPId, KRef};
use crate::kv::KVStore;
use crate::model::{KernelObject, KernelPromise, PromiseState, RunQueueItem};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[async_trait]
pub trait Store: Send + Sync {
    async fn start_crank(&self);
    async fn end_crank(&self) -> Result<()>;
    async fn rollback_crank(&self) -> Result<()>;
    async fn create_crank_savepoint(&self, name: &str);
    async fn rollback_to_savepoint(&self, name: &str) -> Result<()>;
    async fn release_savepoint(&self, name: &str) -> Result<()>;

    async fn init_kernel_object(&self, owner: EndpointId) -> Result<KOId>;
    async fn init_kernel_promise(&self) -> Result<KPId>;
    async fn delete_kernel_object(&self, koid: KOId) -> Result<()>;
    async fn delete_kernel_promise(&self, kpid: KPId) -> Result<()>;

    async fn get_kernel_object(&self, koid: KOId) -> Result<KernelObject>;
    async fn get_kernel_promise(&self, kpid: KPId) -> Result<KernelPromise>;
    async fn put_kernel_promise(&self, kpid: KPId, promise: KernelPromise) -> Result<()>;

    async fn get_owner(&self, koid: KOId) -> Result<Option<EndpointId>>;
    async fn is_revoked(&self, koid: KOId) -> Result<bool>;
    async fn set_revoked(&self, koid: KOId, revoked: bool) -> Result<()>;
    async fn pin_object(&self, koid: KOId) -> Result<()>;
    async fn unpin_object(&self, koid: KOId) -> Result<()>;
    async fn pinned_objects(&self) -> Result<Vec<KOId>>;
    /// Marks `DropExports` as already synthesised for `koid`, so a later GC
    /// pass that re-examines it (because `recognizable` dropped afterward)
    /// doesn't queue a second one.
    async fn mark_exports_dropped(&self, koid: KOId) -> Result<()>;

    /// `onlyRecognizable`: bump `recognizable` alone, leaving `reachable`
    /// untouched (§4.1, used by export allocation).
    async fn increment_ref_count(&self, kref: KRef, only_recognizable: bool) -> Result<()>;
    /// Decrementing to zero schedules the kref for the next `collectGarbage`.
    async fn decrement_ref_count(&self, kref: KRef, only_recognizable: bool) -> Result<()>;
    async fn take_maybe_free_krefs(&self) -> Result<Vec<KRef>>;

    async fn add_c_list_entry(&self, endpoint: EndpointId, kref: KRef, eref: ERef) -> Result<()>;
    async fn forget_kref(&self, endpoint: EndpointId, kref: KRef) -> Result<()>;
    async fn forget_eref(&self, endpoint: EndpointId, eref: ERef) -> Result<()>;
    async fn has_c_list_entry(&self, endpoint: EndpointId, kref: KRef) -> Result<bool>;
    async fn kref_to_eref(&self, endpoint: EndpointId, kref: KRef) -> Result<Option<ERef>>;
    async fn eref_to_kref(&self, endpoint: EndpointId, eref: ERef) -> Result<Option<KRef>>;
    /// Every endpoint other than `owner` holding a c-list entry for `kref`.
    async fn importers_of(&self, kref: KRef, owner: EndpointId) -> Result<Vec<EndpointId>>;

    async fn enqueue_run(&self, item: RunQueueItem) -> Result<()>;
    async fn dequeue_run(&self) -> Result<Option<RunQueueItem>>;
    async fn run_queue_length(&self) -> Result<u64>;

    async fn enqueue_promise_message(&self, kpid: KPId, msg: Message<KRef, KPId>) -> Result<()>;
    async fn drain_promise_messages(&self, kpid: KPId) -> Result<Vec<Message<KRef, KPId>>>;

    /// Registers `decider` as the endpoint responsible for settling an
    /// unresolved promise. Fails if the promise is already settled.
    async fn set_promise_decider(&self, kpid: KPId, decider: EndpointId) -> Result<()>;
    /// Adds `subscriber` to an unresolved promise's subscriber set, or
    /// returns its settled state immediately if it already resolved.
    async fn subscribe_to_promise(
        &self,
        kpid: KPId,
        subscriber: EndpointId,
    ) -> Result<Option<(CapData<KRef>, bool)>>;

    /// Settles `kpid`, moves its pending messages back onto the run queue as
    /// fresh `Send` items (original order preserved), enqueues a `Notify`
    /// per subscriber, and returns those subscribers for the caller's own
    /// bookkeeping.
    async fn resolve_kernel_promise(
        &self,
        kpid: KPId,
        rejected: bool,
        value: CapData<KRef>,
    ) -> Result<Vec<EndpointId>>;

    async fn schedule_reap(&self, endpoint: EndpointId) -> Result<()>;
    async fn next_reap_action(&self) -> Result<Option<EndpointId>>;

    /// Next free local-number for a fresh import/export eref on `endpoint`,
    /// scoped per endpoint and per object/promise kind (`e.nextObjectId.<endpoint>`,
    /// `e.nextPromiseId.<endpoint>`).
    async fn alloc_local_number(&self, endpoint: EndpointId, kind: crate::ids::ERefKind) -> Result<Counter>;
}

fn obj_key(koid: KOId) -> String {
    format!("{koid}.object")
}

fn prom_key(kpid: KPId) -> String {
    format!("{kpid}.promise")
}

fn cle_key(endpoint: EndpointId, eref: ERef) -> String {
    format!("cle.{endpoint}.{eref}")
}

fn clk_key(endpoint: EndpointId, kref: KRef) -> String {
    format!("clk.{endpoint}.{kref}")
}

fn clk_prefix(endpoint: EndpointId) -> String {
    format!("clk.{endpoint}.")
}

/// `KVStore`-backed [`Store`]. `next_koid`/`next_kpid`/`crank_seq` live in
/// memory: they only ever grow and a rollback never needs to hand out a
/// smaller id again. The run queue's head/tail counters, by contrast, live in
/// the KV itself (`queue.run.head`/`queue.run.tail`, same shape as the reap
/// queue's `queue.reap.head`/`queue.reap.tail`) so that a `Send` enqueued mid
/// crank and then rolled back takes its tail bump with it instead of leaving
/// a hole at that index.
pub struct KernelStore<K: KVStore> {
    kv: Arc<K>,
    next_koid: AtomicU64,
    next_kpid: AtomicU64,
    crank_seq: AtomicU64,
}

impl<K: KVStore> KernelStore<K> {
    pub fn new(kv: Arc<K>) -> Self {
        KernelStore {
            kv,
            next_koid: AtomicU64::new(1),
            next_kpid: AtomicU64::new(1),
            crank_seq: AtomicU64::new(0),
        }
    }

    async fn put_object(&self, koid: KOId, obj: &KernelObject) -> Result<()> {
        let json = serde_json::to_string(obj)
            .map_err(|e| KernelError::StoreFailure(e.to_string()))?;
        self.kv.set(&obj_key(koid), &json).await;
        Ok(())
    }

    async fn read_object(&self, koid: KOId) -> Result<KernelObject> {
        let raw = self
            .kv
            .get(&obj_key(koid))
            .await
            .ok_or_else(|| KernelError::UnknownEntity(koid.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| KernelError::StoreFailure(e.to_string()))
    }

    async fn read_promise(&self, kpid: KPId) -> Result<KernelPromise> {
        let raw = self
            .kv
            .get(&prom_key(kpid))
            .await
            .ok_or_else(|| KernelError::UnknownEntity(kpid.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| KernelError::StoreFailure(e.to_string()))
    }

    async fn write_promise(&self, kpid: KPId, promise: &KernelPromise) -> Result<()> {
        let json = serde_json::to_string(promise)
            .map_err(|e| KernelError::StoreFailure(e.to_string()))?;
        self.kv.set(&prom_key(kpid), &json).await;
        Ok(())
    }

    async fn push_maybe_free(&self, kref: KRef) -> Result<()> {
        let mut pending: Vec<KRef> = match self.kv.get("crank.maybeFree").await {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| KernelError::StoreFailure(e.to_string()))?,
            None => Vec::new(),
        };
        pending.push(kref);
        let json = serde_json::to_string(&pending).map_err(|e| KernelError::StoreFailure(e.to_string()))?;
        self.kv.set("crank.maybeFree", &json).await;
        Ok(())
    }
}

#[async_trait]
impl<K: KVStore> Store for KernelStore<K> {
    async fn start_crank(&self) {
        self.kv.create_savepoint("crank").await;
    }

    async fn end_crank(&self) -> Result<()> {
        self.kv.release("crank").await?;
        self.kv.commit().await;
        Ok(())
    }

    async fn rollback_crank(&self) -> Result<()> {
        self.kv.rollback_to("crank").await
    }

    async fn create_crank_savepoint(&self, name: &str) {
        let n = self.crank_seq.fetch_add(1, Ordering::SeqCst);
        self.kv.create_savepoint(&format!("{name}-{n}")).await;
    }

    async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.kv.rollback_to(name).await
    }

    async fn release_savepoint(&self, name: &str) -> Result<()> {
        self.kv.release(name).await
    }

    async fn init_kernel_object(&self, owner: EndpointId) -> Result<KOId> {
        let n: Counter = self.next_koid.fetch_add(1, Ordering::SeqCst);
        let koid = KOId(n);
        self.put_object(koid, &KernelObject::new(owner)).await?;
        Ok(koid)
    }

    async fn init_kernel_promise(&self) -> Result<KPId> {
        let n: Counter = self.next_kpid.fetch_add(1, Ordering::SeqCst);
        let kpid = KPId(n);
        self.write_promise(kpid, &KernelPromise::new()).await?;
        Ok(kpid)
    }

    async fn delete_kernel_object(&self, koid: KOId) -> Result<()> {
        self.kv.delete(&obj_key(koid)).await;
        Ok(())
    }

    async fn delete_kernel_promise(&self, kpid: KPId) -> Result<()> {
        self.kv.delete(&prom_key(kpid)).await;
        for key in self.kv.keys(&format!("queue.{kpid}.")).await {
            self.kv.delete(&key).await;
        }
        Ok(())
    }

    async fn get_kernel_object(&self, koid: KOId) -> Result<KernelObject> {
        self.read_object(koid).await
    }

    async fn get_kernel_promise(&self, kpid: KPId) -> Result<KernelPromise> {
        self.read_promise(kpid).await
    }

    async fn put_kernel_promise(&self, kpid: KPId, promise: KernelPromise) -> Result<()> {
        self.write_promise(kpid, &promise).await
    }

    async fn get_owner(&self, koid: KOId) -> Result<Option<EndpointId>> {
        match self.kv.get(&obj_key(koid)).await {
            Some(raw) => {
                let obj: KernelObject =
                    serde_json::from_str(&raw).map_err(|e| KernelError::StoreFailure(e.to_string()))?;
                Ok(Some(obj.owner))
            }
            None => Ok(None),
        }
    }

    async fn is_revoked(&self, koid: KOId) -> Result<bool> {
        Ok(self.read_object(koid).await?.revoked)
    }

    async fn set_revoked(&self, koid: KOId, revoked: bool) -> Result<()> {
        let mut obj = self.read_object(koid).await?;
        obj.revoked = revoked;
        self.put_object(koid, &obj).await
    }

    async fn pin_object(&self, koid: KOId) -> Result<()> {
        let mut obj = self.read_object(koid).await?;
        obj.pinned = true;
        self.put_object(koid, &obj).await
    }

    async fn unpin_object(&self, koid: KOId) -> Result<()> {
        let mut obj = self.read_object(koid).await?;
        obj.pinned = false;
        self.put_object(koid, &obj).await
    }

    async fn mark_exports_dropped(&self, koid: KOId) -> Result<()> {
        let mut obj = self.read_object(koid).await?;
        obj.exports_dropped = true;
        self.put_object(koid, &obj).await
    }

    async fn pinned_objects(&self) -> Result<Vec<KOId>> {
        let mut out = Vec::new();
        for key in self.kv.keys("ko").await {
            if !key.ends_with(".object") {
                continue;
            }
            let id_part = key.trim_end_matches(".object");
            let koid: KOId = id_part.parse()?;
            if self.read_object(koid).await?.pinned {
                out.push(koid);
            }
        }
        Ok(out)
    }

    async fn increment_ref_count(&self, kref: KRef, only_recognizable: bool) -> Result<()> {
        match kref {
            KRef::Object(koid) => {
                let mut obj = self.read_object(koid).await?;
                obj.recognizable += 1;
                if !only_recognizable {
                    if obj.reachable == 0 {
                        obj.exports_dropped = false;
                    }
                    obj.reachable += 1;
                }
                self.put_object(koid, &obj).await
            }
            KRef::Promise(kpid) => {
                let mut p = self.read_promise(kpid).await?;
                p.ref_count += 1;
                self.write_promise(kpid, &p).await
            }
        }
    }

    async fn decrement_ref_count(&self, kref: KRef, only_recognizable: bool) -> Result<()> {
        let zero = match kref {
            KRef::Object(koid) => {
                let mut obj = self.read_object(koid).await?;
                if only_recognizable {
                    obj.recognizable = obj.recognizable.saturating_sub(1);
                } else {
                    obj.reachable = obj.reachable.saturating_sub(1);
                    obj.recognizable = obj.recognizable.saturating_sub(1);
                }
                // `reachable` hitting zero alone is enough to re-evaluate this
                // object for GC (dropExport fires on that alone; retireExport
                // additionally needs `recognizable` at zero too, §4.3 Phase 1).
                let zero = obj.reachable == 0;
                self.put_object(koid, &obj).await?;
                zero
            }
            KRef::Promise(kpid) => {
                let mut p = self.read_promise(kpid).await?;
                p.ref_count = p.ref_count.saturating_sub(1);
                let zero = p.ref_count == 0;
                self.write_promise(kpid, &p).await?;
                zero
            }
        };
        if zero {
            self.push_maybe_free(kref).await?;
        }
        Ok(())
    }

    async fn take_maybe_free_krefs(&self) -> Result<Vec<KRef>> {
        let pending: Vec<KRef> = match self.kv.get("crank.maybeFree").await {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| KernelError::StoreFailure(e.to_string()))?,
            None => Vec::new(),
        };
        self.kv.delete("crank.maybeFree").await;
        Ok(pending)
    }

    async fn add_c_list_entry(&self, endpoint: EndpointId, kref: KRef, eref: ERef) -> Result<()> {
        self.kv.set(&cle_key(endpoint, eref), &kref.to_string()).await;
        self.kv.set(&clk_key(endpoint, kref), &eref.to_string()).await;
        Ok(())
    }

    async fn forget_kref(&self, endpoint: EndpointId, kref: KRef) -> Result<()> {
        if let Some(eref) = self.kref_to_eref(endpoint, kref).await? {
            self.kv.delete(&cle_key(endpoint, eref)).await;
        }
        self.kv.delete(&clk_key(endpoint, kref)).await;
        Ok(())
    }

    async fn forget_eref(&self, endpoint: EndpointId, eref: ERef) -> Result<()> {
        if let Some(kref) = self.eref_to_kref(endpoint, eref).await? {
            self.kv.delete(&clk_key(endpoint, kref)).await;
        }
        self.kv.delete(&cle_key(endpoint, eref)).await;
        Ok(())
    }

    async fn has_c_list_entry(&self, endpoint: EndpointId, kref: KRef) -> Result<bool> {
        Ok(self.kv.get(&clk_key(endpoint, kref)).await.is_some())
    }

    async fn kref_to_eref(&self, endpoint: EndpointId, kref: KRef) -> Result<Option<ERef>> {
        match self.kv.get(&clk_key(endpoint, kref)).await {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    async fn eref_to_kref(&self, endpoint: EndpointId, eref: ERef) -> Result<Option<KRef>> {
        match self.kv.get(&cle_key(endpoint, eref)).await {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    async fn importers_of(&self, kref: KRef, owner: EndpointId) -> Result<Vec<EndpointId>> {
        let mut out = Vec::new();
        for key in self.kv.keys("clk.").await {
            // clk.<endpoint>.<kref>
            let rest = key.trim_start_matches("clk.");
            let Some((ep_str, kref_str)) = rest.split_once('.') else { continue };
            if kref_str != kref.to_string() {
                continue;
            }
            let ep: EndpointId = ep_str.parse()?;
            if ep != owner {
                out.push(ep);
            }
        }
        Ok(out)
    }

    async fn enqueue_run(&self, item: RunQueueItem) -> Result<()> {
        let n: u64 = match self.kv.get("queue.run.tail").await {
            Some(raw) => raw.parse().unwrap_or(0),
            None => 0,
        };
        let json = serde_json::to_string(&item).map_err(|e| KernelError::StoreFailure(e.to_string()))?;
        self.kv.set(&format!("queue.run.{n}"), &json).await;
        self.kv.set("queue.run.tail", &(n + 1).to_string()).await;
        Ok(())
    }

    async fn dequeue_run(&self) -> Result<Option<RunQueueItem>> {
        let head: u64 = match self.kv.get("queue.run.head").await {
            Some(raw) => raw.parse().unwrap_or(0),
            None => 0,
        };
        let tail: u64 = match self.kv.get("queue.run.tail").await {
            Some(raw) => raw.parse().unwrap_or(0),
            None => 0,
        };
        if head >= tail {
            return Ok(None);
        }
        let key = format!("queue.run.{head}");
        let raw = self.kv.get_required(&key).await?;
        self.kv.delete(&key).await;
        self.kv.set("queue.run.head", &(head + 1).to_string()).await;
        serde_json::from_str(&raw).map(Some).map_err(|e| KernelError::StoreFailure(e.to_string()))
    }

    async fn run_queue_length(&self) -> Result<u64> {
        let head: u64 = match self.kv.get("queue.run.head").await {
            Some(raw) => raw.parse().unwrap_or(0),
            None => 0,
        };
        let tail: u64 = match self.kv.get("queue.run.tail").await {
            Some(raw) => raw.parse().unwrap_or(0),
            None => 0,
        };
        Ok(tail - head)
    }

    async fn enqueue_promise_message(&self, kpid: KPId, msg: Message<KRef, KPId>) -> Result<()> {
        let tail_key = format!("queue.{kpid}.tail");
        let n: u64 = match self.kv.get(&tail_key).await {
            Some(raw) => raw.parse().unwrap_or(0),
            None => 0,
        };
        let json = serde_json::to_string(&msg).map_err(|e| KernelError::StoreFailure(e.to_string()))?;
        self.kv.set(&format!("queue.{kpid}.{n}"), &json).await;
        self.kv.set(&tail_key, &(n + 1).to_string()).await;
        Ok(())
    }

    async fn drain_promise_messages(&self, kpid: KPId) -> Result<Vec<Message<KRef, KPId>>> {
        let tail: u64 = match self.kv.get(&format!("queue.{kpid}.tail")).await {
            Some(raw) => raw.parse().unwrap_or(0),
            None => 0,
        };
        let mut out = Vec::new();
        for n in 0..tail {
            let key = format!("queue.{kpid}.{n}");
            if let Some(raw) = self.kv.get(&key).await {
                let msg = serde_json::from_str(&raw).map_err(|e| KernelError::StoreFailure(e.to_string()))?;
                out.push(msg);
                self.kv.delete(&key).await;
            }
        }
        self.kv.delete(&format!("queue.{kpid}.tail")).await;
        Ok(out)
    }

    async fn resolve_kernel_promise(
        &self,
        kpid: KPId,
        rejected: bool,
        value: CapData<KRef>,
    ) -> Result<Vec<EndpointId>> {
        let mut promise = self.read_promise(kpid).await?;
        let PromiseState::Unresolved { subscribers, .. } = promise.state.clone() else {
            return Err(KernelError::StateViolation(format!("{kpid} already settled")));
        };
        promise.state = if rejected {
            PromiseState::Rejected { value: value.clone() }
        } else {
            PromiseState::Fulfilled { value: value.clone() }
        };
        self.write_promise(kpid, &promise).await?;

        for msg in self.drain_promise_messages(kpid).await? {
            self.enqueue_run(RunQueueItem::Send { target: KRef::Promise(kpid), message: msg }).await?;
        }

        let subscribers: Vec<EndpointId> = subscribers.into_iter().collect();
        for endpoint in &subscribers {
            self.enqueue_run(RunQueueItem::Notify { endpoint: *endpoint, kpid }).await?;
        }
        Ok(subscribers)
    }

    async fn set_promise_decider(&self, kpid: KPId, decider: EndpointId) -> Result<()> {
        let mut promise = self.read_promise(kpid).await?;
        match &mut promise.state {
            PromiseState::Unresolved { decider: d, .. } => *d = Some(decider),
            _ => return Err(KernelError::StateViolation(format!("{kpid} already settled"))),
        }
        self.write_promise(kpid, &promise).await
    }

    async fn subscribe_to_promise(
        &self,
        kpid: KPId,
        subscriber: EndpointId,
    ) -> Result<Option<(CapData<KRef>, bool)>> {
        let mut promise = self.read_promise(kpid).await?;
        match &mut promise.state {
            PromiseState::Unresolved { subscribers, .. } => {
                subscribers.insert(subscriber);
                self.write_promise(kpid, &promise).await?;
                Ok(None)
            }
            PromiseState::Fulfilled { value } => Ok(Some((value.clone(), false))),
            PromiseState::Rejected { value } => Ok(Some((value.clone(), true))),
        }
    }

    async fn schedule_reap(&self, endpoint: EndpointId) -> Result<()> {
        let flag = format!("reap.pending.{endpoint}");
        if self.kv.get(&flag).await.is_some() {
            return Ok(());
        }
        self.kv.set(&flag, "1").await;
        let tail: u64 = match self.kv.get("queue.reap.tail").await {
            Some(raw) => raw.parse().unwrap_or(0),
            None => 0,
        };
        self.kv.set(&format!("queue.reap.{tail}"), &endpoint.to_string()).await;
        self.kv.set("queue.reap.tail", &(tail + 1).to_string()).await;
        Ok(())
    }

    async fn next_reap_action(&self) -> Result<Option<EndpointId>> {
        let head: u64 = match self.kv.get("queue.reap.head").await {
            Some(raw) => raw.parse().unwrap_or(0),
            None => 0,
        };
        let tail: u64 = match self.kv.get("queue.reap.tail").await {
            Some(raw) => raw.parse().unwrap_or(0),
            None => 0,
        };
        if head >= tail {
            return Ok(None);
        }
        let key = format!("queue.reap.{head}");
        let raw = self.kv.get_required(&key).await?;
        self.kv.delete(&key).await;
        self.kv.set("queue.reap.head", &(head + 1).to_string()).await;
        let endpoint: EndpointId = raw.parse()?;
        self.kv.delete(&format!("reap.pending.{endpoint}")).await;
        Ok(Some(endpoint))
    }

    async fn alloc_local_number(&self, endpoint: EndpointId, kind: crate::ids::ERefKind) -> Result<Counter> {
        let tag = match kind {
            crate::ids::ERefKind::Object => "nextObjectId",
            crate::ids::ERefKind::Promise => "nextPromiseId",
        };
        let key = format!("e.{tag}.{endpoint}");
        let n: Counter = match self.kv.get(&key).await {
            Some(raw) => raw.parse().map_err(|_| KernelError::StoreFailure(format!("corrupt counter `{key}`")))?,
            None => 1,
        };
        self.kv.set(&key, &(n + 1).to_string()).await;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn new_store() -> KernelStore<MemoryKv> {
        KernelStore::new(Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn object_lifecycle_round_trips() {
        let store = new_store();
        let owner = EndpointId::Vat(1);
        let koid = store.init_kernel_object(owner).await.unwrap();
        assert_eq!(store.get_owner(koid).await.unwrap(), Some(owner));
        assert!(!store.is_revoked(koid).await.unwrap());
        store.set_revoked(koid, true).await.unwrap();
        assert!(store.is_revoked(koid).await.unwrap());
    }

    #[tokio::test]
    async fn refcount_decrement_to_zero_marks_maybe_free() {
        let store = new_store();
        let koid = store.init_kernel_object(EndpointId::Vat(1)).await.unwrap();
        let kref = KRef::Object(koid);
        store.increment_ref_count(kref, false).await.unwrap();
        store.decrement_ref_count(kref, false).await.unwrap();
        let pending = store.take_maybe_free_krefs().await.unwrap();
        assert_eq!(pending, vec![kref]);
        // Draining clears it.
        assert!(store.take_maybe_free_krefs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn c_list_is_bidirectional() {
        let store = new_store();
        let endpoint = EndpointId::Vat(3);
        let koid = store.init_kernel_object(endpoint).await.unwrap();
        let kref = KRef::Object(koid);
        let eref = ERef::local_object(crate::ids::Polarity::Export, 1);
        store.add_c_list_entry(endpoint, kref, eref).await.unwrap();
        assert_eq!(store.kref_to_eref(endpoint, kref).await.unwrap(), Some(eref));
        assert_eq!(store.eref_to_kref(endpoint, eref).await.unwrap(), Some(kref));
        store.forget_kref(endpoint, kref).await.unwrap();
        assert_eq!(store.kref_to_eref(endpoint, kref).await.unwrap(), None);
        assert_eq!(store.eref_to_kref(endpoint, eref).await.unwrap(), None);
    }

    #[tokio::test]
    async fn run_queue_is_fifo() {
        let store = new_store();
        let kpid = store.init_kernel_promise().await.unwrap();
        for n in 0..3u64 {
            store
                .enqueue_run(RunQueueItem::Notify { endpoint: EndpointId::Vat(n), kpid })
                .await
                .unwrap();
        }
        assert_eq!(store.run_queue_length().await.unwrap(), 3);
        for n in 0..3u64 {
            match store.dequeue_run().await.unwrap().unwrap() {
                RunQueueItem::Notify { endpoint, .. } => assert_eq!(endpoint, EndpointId::Vat(n)),
                other => panic!("unexpected item: {other:?}"),
            }
        }
        assert!(store.dequeue_run().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolving_a_promise_requeues_pending_messages_in_order() {
        let store = new_store();
        let kpid = store.init_kernel_promise().await.unwrap();
        for n in 0..2u64 {
            let msg = Message { methargs: CapData::empty(format!("m{n}")), result: None };
            store.enqueue_promise_message(kpid, msg).await.unwrap();
        }
        store.resolve_kernel_promise(kpid, false, CapData::empty("ok")).await.unwrap();
        assert_eq!(store.run_queue_length().await.unwrap(), 2);
        match store.dequeue_run().await.unwrap().unwrap() {
            RunQueueItem::Send { message, .. } => assert_eq!(message.methargs.body, "m0"),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn crank_rollback_discards_mutations() {
        let store = new_store();
        let koid = store.init_kernel_object(EndpointId::Vat(1)).await.unwrap();
        store.start_crank().await;
        store.set_revoked(koid, true).await.unwrap();
        store.rollback_crank().await.unwrap();
        assert!(!store.is_revoked(koid).await.unwrap());
    }

    #[tokio::test]
    async fn pinned_objects_lists_only_pinned_koids() {
        let store = new_store();
        let a = store.init_kernel_object(EndpointId::Vat(1)).await.unwrap();
        let _unpinned = store.init_kernel_object(EndpointId::Vat(1)).await.unwrap();
        store.pin_object(a).await.unwrap();
        assert_eq!(store.pinned_objects().await.unwrap(), vec![a]);
        store.unpin_object(a).await.unwrap();
        assert!(store.pinned_objects().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reap_queue_deduplicates_pending_endpoints() {
        let store = new_store();
        let endpoint = EndpointId::Vat(5);
        store.schedule_reap(endpoint).await.unwrap();
        store.schedule_reap(endpoint).await.unwrap();
        assert_eq!(store.next_reap_action().await.unwrap(), Some(endpoint));
        assert_eq!(store.next_reap_action().await.unwrap(), None);
    }
}
