//! Persistent entity shapes (§3): objects, promises, c-list entries,
//! run-queue items, and subclusters. These are plain data; all mutation goes
//! through [`crate::store::Store`].

use crate::capdata::{CapData, Message};
use crate::ids::{EndpointId, KOId, KPId, KRef, SubclusterId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An object owned by exactly one endpoint (§3 `KernelObject`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KernelObject {
    pub owner: EndpointId,
    pub revoked: bool,
    pub pinned: bool,
    pub reachable: u64,
    pub recognizable: u64,
    /// Whether `DropExports` has already been synthesised for this object
    /// since `reachable` last hit zero. Keeps a lingering `recognizable`
    /// count (an object that's unreachable but still recognizable, §4.3
    /// Phase 1) from getting a second `DropExports` queued every time GC
    /// re-examines it.
    pub exports_dropped: bool,
}

impl KernelObject {
    pub fn new(owner: EndpointId) -> Self {
        KernelObject { owner, revoked: false, pinned: false, reachable: 0, recognizable: 0, exports_dropped: false }
    }

    /// Invariant: `0 <= reachable <= recognizable`.
    pub fn is_consistent(&self) -> bool {
        self.reachable <= self.recognizable
    }

    pub fn is_live(&self) -> bool {
        !self.revoked
    }
}

/// The closed sum type a [`KernelPromise`] occupies (§3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PromiseState {
    Unresolved { decider: Option<EndpointId>, subscribers: BTreeSet<EndpointId> },
    Fulfilled { value: CapData<KRef> },
    Rejected { value: CapData<KRef> },
}

impl PromiseState {
    pub fn unresolved() -> Self {
        PromiseState::Unresolved { decider: None, subscribers: BTreeSet::new() }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self, PromiseState::Unresolved { .. })
    }

    /// The value of a settled promise, or `None` if still unresolved.
    pub fn settled_value(&self) -> Option<(&CapData<KRef>, bool)> {
        match self {
            PromiseState::Fulfilled { value } => Some((value, false)),
            PromiseState::Rejected { value } => Some((value, true)),
            PromiseState::Unresolved { .. } => None,
        }
    }
}

/// A promise tracked by the kernel. Its pending message queue lives in the
/// store's queue namespace (`queue.<kpid>.*`), not inline here, matching the
/// fact it is accessed through `enqueuePromiseMessage`/`drainPromiseMessages`
/// rather than as a struct field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KernelPromise {
    pub state: PromiseState,
    pub ref_count: u64,
}

impl KernelPromise {
    pub fn new() -> Self {
        KernelPromise { state: PromiseState::unresolved(), ref_count: 0 }
    }
}

impl Default for KernelPromise {
    fn default() -> Self {
        Self::new()
    }
}

/// Which synthesised GC notification a [`RunQueueItem::GcAction`] carries (§4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GcActionKind {
    DropExports,
    RetireExports,
    RetireImports,
}

/// The closed sum type occupying a run-queue slot (§3). Exhaustively matched
/// everywhere it's consumed; an unknown discriminant decoded off the wire is
/// a [`crate::error::KernelError::ProtocolError`], never silently dropped.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RunQueueItem {
    Send { target: KRef, message: Message<KRef, KPId> },
    Notify { endpoint: EndpointId, kpid: KPId },
    GcAction { kind: GcActionKind, endpoint: EndpointId, krefs: Vec<KRef> },
    BringOutYourDead { endpoint: EndpointId },
}

/// A group of vats launched/terminated as a unit (§3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subcluster {
    pub id: SubclusterId,
    pub config: crate::platform::SubclusterConfig,
    pub vats: Vec<EndpointId>,
}
