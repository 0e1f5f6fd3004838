//! The garbage collector (§4.3). Runs after every crank commits; never
//! inside one. Everything it produces is a synthesised run-queue item, never
//! a direct endpoint call.

use crate::capdata::CapData;
use crate::error::{KernelError, Result};
use crate::ids::{EndpointId, KPId, KRef};
use crate::model::{GcActionKind, RunQueueItem};
use crate::store::Store;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub struct GcEngine {
    store: Arc<dyn Store>,
}

impl GcEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        GcEngine { store }
    }

    /// Drains the crank's `maybeFreeKrefs` set and synthesises GC actions for
    /// whatever is still at zero. Idempotent if called with nothing pending.
    pub async fn collect_garbage(&self) -> Result<()> {
        let mut actions: BTreeMap<(EndpointId, GcActionKind), Vec<KRef>> = BTreeMap::new();

        // Cascading decrements (e.g. a collected promise's own slots) feed
        // fresh candidates back into `maybeFreeKrefs`; loop to a fixed point.
        loop {
            let candidates = self.store.take_maybe_free_krefs().await?;
            if candidates.is_empty() {
                break;
            }
            for kref in candidates {
                match kref {
                    KRef::Promise(kpid) => self.collect_promise(kpid).await?,
                    KRef::Object(koid) => self.collect_object(koid, &mut actions).await?,
                }
            }
        }

        for ((endpoint, kind), mut krefs) in actions {
            krefs.sort();
            self.store.enqueue_run(RunQueueItem::GcAction { kind, endpoint, krefs }).await?;
        }
        Ok(())
    }

    async fn collect_promise(&self, kpid: KPId) -> Result<()> {
        let promise = self.store.get_kernel_promise(kpid).await?;
        if promise.ref_count != 0 {
            return Ok(());
        }
        if let Some((value, _rejected)) = promise.state.settled_value() {
            for slot in value.slots.clone() {
                self.store.decrement_ref_count(slot, false).await?;
            }
        }
        self.store.delete_kernel_promise(kpid).await
    }

    /// Two-stage per §4.3 Phase 1: `reachable` hitting zero alone is enough to
    /// synthesise `DropExports` (the object may still be recognizable
    /// elsewhere); `RetireExports`/`RetireImports` and the actual delete only
    /// happen once `recognizable` has independently reached zero too. A kref
    /// can land here more than once while it sits in the gap between the two.
    async fn collect_object(
        &self,
        koid: crate::ids::KOId,
        actions: &mut BTreeMap<(EndpointId, GcActionKind), Vec<KRef>>,
    ) -> Result<()> {
        let kref = KRef::Object(koid);
        let obj = match self.store.get_kernel_object(koid).await {
            Ok(obj) => obj,
            Err(KernelError::UnknownEntity(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if obj.pinned || obj.owner == EndpointId::Kernel {
            return Ok(());
        }
        if obj.reachable != 0 {
            return Ok(());
        }

        if !obj.exports_dropped {
            actions.entry((obj.owner, GcActionKind::DropExports)).or_default().push(kref);
            self.store.mark_exports_dropped(koid).await?;
        }

        if obj.recognizable != 0 {
            return Ok(());
        }

        actions.entry((obj.owner, GcActionKind::RetireExports)).or_default().push(kref);
        for importer in self.store.importers_of(kref, obj.owner).await? {
            actions.entry((importer, GcActionKind::RetireImports)).or_default().push(kref);
        }
        // c-list entries stay in place until the synthesised actions above are
        // actually delivered (each runs as its own later crank and still
        // needs `kref_to_eref` to translate); `Router::deliver_gc_action`
        // forgets them once RetireExports/RetireImports land.
        self.store.delete_kernel_object(koid).await
    }

    /// `retireKernelObjects`: force-retire already-dead krefs toward every
    /// importer, independent of the normal zero-refcount path. Used when an
    /// owning endpoint is torn down and its exports must be cleaned up in bulk.
    pub async fn retire_kernel_objects(&self, krefs: Vec<KRef>) -> Result<()> {
        let mut actions: BTreeMap<EndpointId, Vec<KRef>> = BTreeMap::new();
        for kref in krefs {
            let owner = match kref {
                KRef::Object(koid) => self.store.get_owner(koid).await?.unwrap_or(EndpointId::Kernel),
                KRef::Promise(_) => EndpointId::Kernel,
            };
            for importer in self.store.importers_of(kref, owner).await? {
                actions.entry(importer).or_default().push(kref);
            }
        }
        for (endpoint, mut krefs) in actions {
            krefs.sort();
            self.store
                .enqueue_run(RunQueueItem::GcAction { kind: GcActionKind::RetireImports, endpoint, krefs })
                .await?;
        }
        Ok(())
    }

    /// `getKpidsToRetire`: `orig_kpid` plus every promise-typed slot reachable
    /// transitively through settled values, cycle-safe.
    pub async fn get_kpids_to_retire(&self, orig_kpid: KPId, value: &CapData<KRef>) -> Result<Vec<KPId>> {
        let mut seen: BTreeSet<KPId> = BTreeSet::new();
        seen.insert(orig_kpid);
        let mut stack: Vec<KPId> =
            value.slots.iter().filter_map(|s| if let KRef::Promise(p) = s { Some(*p) } else { None }).collect();

        while let Some(kpid) = stack.pop() {
            if !seen.insert(kpid) {
                continue;
            }
            let promise = self.store.get_kernel_promise(kpid).await?;
            if let Some((v, _)) = promise.state.settled_value() {
                for slot in &v.slots {
                    if let KRef::Promise(p) = slot {
                        if !seen.contains(p) {
                            stack.push(*p);
                        }
                    }
                }
            }
        }
        Ok(seen.into_iter().collect())
    }

    pub async fn schedule_reap(&self, endpoint: EndpointId) -> Result<()> {
        self.store.schedule_reap(endpoint).await
    }

    pub async fn next_reap_action(&self) -> Result<Option<RunQueueItem>> {
        Ok(self.store.next_reap_action().await?.map(|endpoint| RunQueueItem::BringOutYourDead { endpoint }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ERef, Polarity};
    use crate::kv::MemoryKv;
    use crate::store::KernelStore;

    fn engine() -> (GcEngine, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(KernelStore::new(Arc::new(MemoryKv::new())));
        (GcEngine::new(store.clone()), store)
    }

    #[tokio::test]
    async fn dead_object_synthesises_drop_and_retire_export() {
        let (gc, store) = engine();
        let owner = EndpointId::Vat(1);
        let koid = store.init_kernel_object(owner).await.unwrap();
        let kref = KRef::Object(koid);
        store.add_c_list_entry(owner, kref, ERef::local_object(Polarity::Export, 1)).await.unwrap();
        store.increment_ref_count(kref, false).await.unwrap();
        store.decrement_ref_count(kref, false).await.unwrap();

        gc.collect_garbage().await.unwrap();
        assert_eq!(store.run_queue_length().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unreachable_but_recognizable_object_only_drops_exports() {
        let (gc, store) = engine();
        let owner = EndpointId::Vat(1);
        let koid = store.init_kernel_object(owner).await.unwrap();
        let kref = KRef::Object(koid);
        store.add_c_list_entry(owner, kref, ERef::local_object(Polarity::Export, 1)).await.unwrap();

        // One ordinary hold (bumps both counters) plus one recognizable-only
        // hold (export allocation), then release the ordinary hold: reachable
        // hits zero while recognizable is still held.
        store.increment_ref_count(kref, false).await.unwrap();
        store.increment_ref_count(kref, true).await.unwrap();
        store.decrement_ref_count(kref, false).await.unwrap();

        gc.collect_garbage().await.unwrap();
        assert_eq!(store.run_queue_length().await.unwrap(), 1);
        match store.dequeue_run().await.unwrap().unwrap() {
            RunQueueItem::GcAction { kind, .. } => assert_eq!(kind, GcActionKind::DropExports),
            other => panic!("unexpected item: {other:?}"),
        }
        assert!(store.get_kernel_object(koid).await.is_ok(), "object must survive while recognizable");

        // Releasing the recognizable-only hold finishes the job.
        store.decrement_ref_count(kref, true).await.unwrap();
        gc.collect_garbage().await.unwrap();
        assert_eq!(store.run_queue_length().await.unwrap(), 1);
        match store.dequeue_run().await.unwrap().unwrap() {
            RunQueueItem::GcAction { kind, .. } => assert_eq!(kind, GcActionKind::RetireExports),
            other => panic!("unexpected item: {other:?}"),
        }
        assert!(store.get_kernel_object(koid).await.is_err());
    }

    #[tokio::test]
    async fn pinned_object_survives_zero_refcount() {
        let (gc, store) = engine();
        let owner = EndpointId::Vat(1);
        let koid = store.init_kernel_object(owner).await.unwrap();
        store.pin_object(koid).await.unwrap();
        let kref = KRef::Object(koid);
        store.increment_ref_count(kref, false).await.unwrap();
        store.decrement_ref_count(kref, false).await.unwrap();

        gc.collect_garbage().await.unwrap();
        assert_eq!(store.run_queue_length().await.unwrap(), 0);
        assert!(store.get_kernel_object(koid).await.is_ok());
    }

    #[tokio::test]
    async fn kpids_to_retire_handles_cycles() {
        let (gc, store) = engine();
        let a = store.init_kernel_promise().await.unwrap();
        let b = store.init_kernel_promise().await.unwrap();
        store.put_kernel_promise(a, {
            let mut p = store.get_kernel_promise(a).await.unwrap();
            p.state = crate::model::PromiseState::Fulfilled { value: CapData::new("x", vec![KRef::Promise(b)]) };
            p
        }).await.unwrap();
        store.put_kernel_promise(b, {
            let mut p = store.get_kernel_promise(b).await.unwrap();
            p.state = crate::model::PromiseState::Fulfilled { value: CapData::new("y", vec![KRef::Promise(a)]) };
            p
        }).await.unwrap();

        let value = CapData::new("x", vec![KRef::Promise(b)]);
        let retire = gc.get_kpids_to_retire(a, &value).await.unwrap();
        assert_eq!(retire.len(), 2);
        assert!(retire.contains(&a) && retire.contains(&b));
    }
}
