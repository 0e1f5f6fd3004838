//! Property-based checks for the universal invariants a production store
//! must hold regardless of which sequence of operations produced it.

use kernel_core::{EndpointId, ERef, KOId, KRef, KernelStore, MemoryKv, Polarity, Store};
use proptest::prelude::*;
use std::sync::Arc;

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(fut)
}

fn fresh_object_store() -> (Arc<dyn Store>, KOId) {
    block_on(async {
        let store: Arc<dyn Store> = Arc::new(KernelStore::new(Arc::new(MemoryKv::new())));
        let koid = store.init_kernel_object(EndpointId::Vat(1)).await.unwrap();
        (store, koid)
    })
}

#[derive(Clone, Copy, Debug)]
enum RefOp {
    Inc { only_recognizable: bool },
    Dec { only_recognizable: bool },
}

fn ref_op() -> impl Strategy<Value = RefOp> {
    prop_oneof![
        any::<bool>().prop_map(|r| RefOp::Inc { only_recognizable: r }),
        any::<bool>().prop_map(|r| RefOp::Dec { only_recognizable: r }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// P1: `reachable <= recognizable` holds after any sequence of
    /// increments/decrements, and decrementing below zero never panics —
    /// it clamps (§4.1's "already at zero" edge case).
    #[test]
    fn refcount_stays_consistent_under_any_op_sequence(ops in proptest::collection::vec(ref_op(), 0..40)) {
        let (store, koid) = fresh_object_store();
        let kref = KRef::Object(koid);
        block_on(async {
            for op in ops {
                match op {
                    RefOp::Inc { only_recognizable } => {
                        store.increment_ref_count(kref, only_recognizable).await.unwrap();
                    }
                    RefOp::Dec { only_recognizable } => {
                        store.decrement_ref_count(kref, only_recognizable).await.unwrap();
                    }
                }
                let obj = store.get_kernel_object(koid).await.unwrap();
                prop_assert!(obj.is_consistent(), "reachable {} > recognizable {}", obj.reachable, obj.recognizable);
            }
            Ok(())
        })?;
    }

    /// P3: a c-list entry always resolves the same in both directions, and
    /// forgetting it clears both directions together — never a dangling
    /// half-entry.
    #[test]
    fn c_list_entries_resolve_both_ways_and_vanish_together(
        endpoint_n in 1u64..5,
        local_n in 1u64..20,
        polarity_is_export in any::<bool>(),
        forget in any::<bool>(),
    ) {
        let (store, koid) = fresh_object_store();
        let kref = KRef::Object(koid);
        let endpoint = EndpointId::Vat(endpoint_n);
        let polarity = if polarity_is_export { Polarity::Export } else { Polarity::Import };
        let eref = ERef::local_object(polarity, local_n);

        block_on(async {
            store.add_c_list_entry(endpoint, kref, eref).await.unwrap();
            prop_assert_eq!(store.kref_to_eref(endpoint, kref).await.unwrap(), Some(eref));
            prop_assert_eq!(store.eref_to_kref(endpoint, eref).await.unwrap(), Some(kref));
            prop_assert!(store.has_c_list_entry(endpoint, kref).await.unwrap());

            if forget {
                store.forget_kref(endpoint, kref).await.unwrap();
            } else {
                store.forget_eref(endpoint, eref).await.unwrap();
            }
            prop_assert_eq!(store.kref_to_eref(endpoint, kref).await.unwrap(), None);
            prop_assert_eq!(store.eref_to_kref(endpoint, eref).await.unwrap(), None);
            prop_assert!(!store.has_c_list_entry(endpoint, kref).await.unwrap());
            Ok(())
        })?;
    }

    /// P5: rolling back a crank restores every mutation made inside it,
    /// however many operations were nested.
    #[test]
    fn rollback_restores_pre_crank_refcounts(
        pre_increments in 0u64..10,
        in_crank_ops in proptest::collection::vec(ref_op(), 0..20),
    ) {
        let (store, koid) = fresh_object_store();
        let kref = KRef::Object(koid);

        block_on(async {
            for _ in 0..pre_increments {
                store.increment_ref_count(kref, false).await.unwrap();
            }
            let before = store.get_kernel_object(koid).await.unwrap();

            store.start_crank().await;
            store.create_crank_savepoint("initial").await;
            for op in in_crank_ops {
                match op {
                    RefOp::Inc { only_recognizable } => {
                        store.increment_ref_count(kref, only_recognizable).await.unwrap();
                    }
                    RefOp::Dec { only_recognizable } => {
                        store.decrement_ref_count(kref, only_recognizable).await.unwrap();
                    }
                }
            }
            store.rollback_crank().await.unwrap();

            let after = store.get_kernel_object(koid).await.unwrap();
            prop_assert_eq!(after.reachable, before.reachable);
            prop_assert_eq!(after.recognizable, before.recognizable);
            Ok(())
        })?;
    }

    /// P6: `maybeFreeKrefs` is always empty at the start of a fresh crank —
    /// whatever a prior crank's GC pass produced was drained before it ended.
    #[test]
    fn maybe_free_krefs_is_empty_at_crank_start(decrements in 1u64..6) {
        let (store, koid) = fresh_object_store();
        let kref = KRef::Object(koid);
        let gc = kernel_core::GcEngine::new(store.clone());

        block_on(async {
            store.increment_ref_count(kref, false).await.unwrap();
            store.start_crank().await;
            store.create_crank_savepoint("initial").await;
            for _ in 0..decrements {
                store.decrement_ref_count(kref, false).await.unwrap();
            }
            store.end_crank().await.unwrap();
            gc.collect_garbage().await.unwrap();

            store.start_crank().await;
            store.create_crank_savepoint("initial").await;
            let pending = store.take_maybe_free_krefs().await.unwrap();
            prop_assert!(pending.is_empty());
            store.end_crank().await.unwrap();
            Ok(())
        })?;
    }
}
