//! The `EndpointHandle` collaborator (§6) and the syscall/result shapes that
//! cross it. An endpoint is a local sandbox or a remote peer; the kernel
//! only ever sees it through this trait.

use crate::capdata::{CapData, Message, OneResolution};
use crate::error::KernelError;
use crate::ids::{EndpointId, ERef};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The endpoint-local syscall union (§4.2, §4.6). Translated E→K by
/// [`crate::translator::Translator::translate_syscall`] before the executor
/// applies it against the kernel store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Syscall {
    Send { target: ERef, message: Message<ERef, ERef> },
    Subscribe { promise: ERef },
    Resolve { resolutions: Vec<SyscallResolution> },
    Exit { is_failure: bool, info: CapData<ERef> },
    DropImports { erefs: Vec<ERef> },
    RetireImports { erefs: Vec<ERef> },
    RetireExports { erefs: Vec<ERef> },
    AbandonExports { erefs: Vec<ERef> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyscallResolution {
    pub promise: ERef,
    pub rejected: bool,
    pub value: CapData<ERef>,
}

/// Set by a `syscall.exit`; processed by the executor after syscall
/// application (§4.6).
#[derive(Clone, Debug)]
pub struct TerminateInfo {
    pub endpoint: EndpointId,
    pub reject: bool,
    pub info: CapData<ERef>,
}

/// What an endpoint returned for one delivery (§6 `CrankResult`). The wire
/// contract also carries an opaque KV checkpoint of the endpoint's private
/// state; the core treats it as an opaque blob it never interprets, since
/// the sandbox's own persistence is out of scope (§1).
#[derive(Clone, Debug, Default)]
pub struct CrankResult {
    pub did_delivery: Option<EndpointId>,
    pub abort: bool,
    pub terminate: Option<TerminateInfo>,
    pub syscalls: Vec<Syscall>,
    pub checkpoint: Vec<u8>,
}

impl CrankResult {
    pub fn empty() -> Self {
        CrankResult { did_delivery: None, abort: false, terminate: None, syscalls: Vec::new(), checkpoint: Vec::new() }
    }

    pub fn with_syscalls(syscalls: Vec<Syscall>) -> Self {
        CrankResult { syscalls, ..Self::empty() }
    }
}

/// A live, addressable endpoint (§6). The only source of `.await` suspension
/// besides the store's commit (§5).
#[async_trait]
pub trait EndpointHandle: Send + Sync {
    async fn deliver_message(&self, target: ERef, message: Message<ERef, ERef>) -> Result<CrankResult, KernelError>;

    async fn deliver_notify(&self, resolutions: Vec<OneResolution<ERef>>) -> Result<CrankResult, KernelError>;

    async fn deliver_drop_exports(&self, erefs: Vec<ERef>) -> Result<CrankResult, KernelError>;

    async fn deliver_retire_exports(&self, erefs: Vec<ERef>) -> Result<CrankResult, KernelError>;

    async fn deliver_retire_imports(&self, erefs: Vec<ERef>) -> Result<CrankResult, KernelError>;

    async fn deliver_bring_out_your_dead(&self) -> Result<CrankResult, KernelError>;
}

/// The router's view of which endpoints are currently live. A host registers
/// and unregisters handles as vats launch and terminate; the router never
/// allocates or tears one down itself.
pub trait EndpointDirectory: Send + Sync {
    fn lookup(&self, endpoint: EndpointId) -> Option<std::sync::Arc<dyn EndpointHandle>>;
    fn register(&self, endpoint: EndpointId, handle: std::sync::Arc<dyn EndpointHandle>);
    fn unregister(&self, endpoint: EndpointId);
}

/// In-memory directory backed by a `Mutex<HashMap>`. Sufficient for a
/// single-process kernel; a multi-process deployment would replace this with
/// something that proxies to remote workers.
#[derive(Default)]
pub struct LocalDirectory {
    handles: std::sync::Mutex<std::collections::HashMap<EndpointId, std::sync::Arc<dyn EndpointHandle>>>,
}

impl LocalDirectory {
    pub fn new() -> Self {
        LocalDirectory { handles: std::sync::Mutex::new(std::collections::HashMap::new()) }
    }
}

impl EndpointDirectory for LocalDirectory {
    fn lookup(&self, endpoint: EndpointId) -> Option<std::sync::Arc<dyn EndpointHandle>> {
        self.handles.lock().unwrap().get(&endpoint).cloned()
    }

    fn register(&self, endpoint: EndpointId, handle: std::sync::Arc<dyn EndpointHandle>) {
        self.handles.lock().unwrap().insert(endpoint, handle);
    }

    fn unregister(&self, endpoint: EndpointId) {
        self.handles.lock().unwrap().remove(&endpoint);
    }
}
