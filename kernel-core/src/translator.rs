//! Kernel ↔ endpoint reference translation (§4.2). Every ref that crosses an
//! endpoint boundary passes through here; nothing else in the crate formats
//! or allocates a c-list entry directly.

use crate::capdata::{CapData, Message};
use crate::endpoint::{Syscall, SyscallResolution};
use crate::error::{KernelError, Result};
use crate::ids::{ERef, ERefKind, EndpointId, KPId, KRef, Polarity};
use crate::store::Store;
use std::sync::Arc;

/// The endpoint-level [`Syscall`] union, re-expressed over kernel refs. The
/// executor applies this directly against the store (§4.6); the translator
/// never mutates refcounts or c-lists except the allocation that naturally
/// happens when a new reference is crossed for the first time.
#[derive(Clone, Debug)]
pub enum KernelSyscall {
    Send { target: KRef, message: Message<KRef, KPId> },
    Subscribe { promise: KPId },
    Resolve { resolutions: Vec<KernelResolution> },
    Exit { is_failure: bool, info: CapData<KRef> },
    DropImports { krefs: Vec<KRef> },
    RetireImports { krefs: Vec<KRef> },
    RetireExports { krefs: Vec<KRef> },
    AbandonExports { krefs: Vec<KRef> },
}

#[derive(Clone, Debug)]
pub struct KernelResolution {
    pub promise: KPId,
    pub rejected: bool,
    pub value: CapData<KRef>,
}

pub struct Translator {
    store: Arc<dyn Store>,
}

impl Translator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Translator { store }
    }

    /// `translateRefKtoE`. Looks up the endpoint's c-list; allocates a fresh
    /// import-polarity entry when absent and `import_if_needed`. Remote
    /// endpoints see the mirror-image polarity (§3).
    pub async fn translate_ref_k_to_e(
        &self,
        endpoint: EndpointId,
        kref: KRef,
        import_if_needed: bool,
    ) -> Result<ERef> {
        let stored = if let Some(eref) = self.store.kref_to_eref(endpoint, kref).await? {
            eref
        } else {
            if !import_if_needed {
                return Err(KernelError::InvalidRef(format!("{kref} not in {endpoint}'s c-list")));
            }
            let kind = match kref {
                KRef::Object(_) => ERefKind::Object,
                KRef::Promise(_) => ERefKind::Promise,
            };
            let number = self.store.alloc_local_number(endpoint, kind).await?;
            let mut eref = match kind {
                ERefKind::Object => ERef::local_object(Polarity::Import, number),
                ERefKind::Promise => ERef::local_promise(Polarity::Import, number),
            };
            eref.remote = endpoint.is_remote();
            // Stored unflipped, same as `export_from_endpoint`'s verbatim
            // storage — the c-list's canonical form never depends on which
            // direction first crossed it. The mirror-image polarity a remote
            // endpoint actually sees is applied below, on every lookup.
            self.store.add_c_list_entry(endpoint, kref, eref).await?;
            eref
        };
        Ok(if endpoint.is_remote() { stored.flipped() } else { stored })
    }

    /// `translateRefEtoK`. An absent entry must be export-polarity, which
    /// triggers [`Self::export_from_endpoint`].
    pub async fn translate_ref_e_to_k(&self, endpoint: EndpointId, eref: ERef) -> Result<KRef> {
        if let Some(kref) = self.store.eref_to_kref(endpoint, eref).await? {
            return Ok(kref);
        }
        if eref.polarity != Polarity::Export {
            return Err(KernelError::InvalidRef(format!("{eref} not in {endpoint}'s c-list")));
        }
        self.export_from_endpoint(endpoint, eref).await
    }

    /// Allocates a fresh kernel object or promise for a first-seen
    /// export-polarity eref. Promises start with `onlyRecognizable`
    /// semantics: the emitting endpoint becomes decider, recognizable is
    /// positive, but nobody is granted reachability yet (§4.2).
    async fn export_from_endpoint(&self, endpoint: EndpointId, eref: ERef) -> Result<KRef> {
        let kref = match eref.kind {
            ERefKind::Object => {
                let koid = self.store.init_kernel_object(endpoint).await?;
                KRef::Object(koid)
            }
            ERefKind::Promise => {
                let kpid = self.store.init_kernel_promise().await?;
                KRef::Promise(kpid)
            }
        };
        self.store.add_c_list_entry(endpoint, kref, eref).await?;
        self.store.increment_ref_count(kref, true).await?;
        Ok(kref)
    }

    pub async fn translate_capdata_k_to_e(
        &self,
        endpoint: EndpointId,
        data: CapData<KRef>,
        import_if_needed: bool,
    ) -> Result<CapData<ERef>> {
        let mut slots = Vec::with_capacity(data.slots.len());
        for kref in data.slots {
            slots.push(self.translate_ref_k_to_e(endpoint, kref, import_if_needed).await?);
        }
        Ok(CapData { body: data.body, slots })
    }

    pub async fn translate_capdata_e_to_k(
        &self,
        endpoint: EndpointId,
        data: CapData<ERef>,
    ) -> Result<CapData<KRef>> {
        let mut slots = Vec::with_capacity(data.slots.len());
        for eref in data.slots {
            slots.push(self.translate_ref_e_to_k(endpoint, eref).await?);
        }
        Ok(CapData { body: data.body, slots })
    }

    pub async fn translate_message_k_to_e(
        &self,
        endpoint: EndpointId,
        message: Message<KRef, KPId>,
    ) -> Result<Message<ERef, ERef>> {
        let methargs = self.translate_capdata_k_to_e(endpoint, message.methargs, true).await?;
        let result = match message.result {
            Some(kpid) => Some(self.translate_ref_k_to_e(endpoint, KRef::Promise(kpid), true).await?),
            None => None,
        };
        Ok(Message { methargs, result })
    }

    pub async fn translate_message_e_to_k(
        &self,
        endpoint: EndpointId,
        message: Message<ERef, ERef>,
    ) -> Result<Message<KRef, KPId>> {
        let methargs = self.translate_capdata_e_to_k(endpoint, message.methargs).await?;
        let result = match message.result {
            Some(eref) => match self.translate_ref_e_to_k(endpoint, eref).await? {
                KRef::Promise(kpid) => Some(kpid),
                KRef::Object(_) => {
                    return Err(KernelError::ProtocolError("result ref must be a promise".into()))
                }
            },
            None => None,
        };
        Ok(Message { methargs, result })
    }

    /// `translateSyscallVtoK`. Exhaustive over the syscall union; any
    /// variant not representable here (`callNow`, `vatstore*`) simply cannot
    /// be constructed as a [`Syscall`] in the first place.
    pub async fn translate_syscall_v_to_k(
        &self,
        endpoint: EndpointId,
        syscall: Syscall,
    ) -> Result<KernelSyscall> {
        match syscall {
            Syscall::Send { target, message } => {
                let target = self.translate_ref_e_to_k(endpoint, target).await?;
                let message = self.translate_message_e_to_k(endpoint, message).await?;
                Ok(KernelSyscall::Send { target, message })
            }
            Syscall::Subscribe { promise } => match self.translate_ref_e_to_k(endpoint, promise).await? {
                KRef::Promise(kpid) => Ok(KernelSyscall::Subscribe { promise: kpid }),
                KRef::Object(_) => Err(KernelError::ProtocolError("subscribe target must be a promise".into())),
            },
            Syscall::Resolve { resolutions } => {
                let mut out = Vec::with_capacity(resolutions.len());
                for SyscallResolution { promise, rejected, value } in resolutions {
                    let promise = match self.translate_ref_e_to_k(endpoint, promise).await? {
                        KRef::Promise(kpid) => kpid,
                        KRef::Object(_) => {
                            return Err(KernelError::ProtocolError("resolve target must be a promise".into()))
                        }
                    };
                    let value = self.translate_capdata_e_to_k(endpoint, value).await?;
                    out.push(KernelResolution { promise, rejected, value });
                }
                Ok(KernelSyscall::Resolve { resolutions: out })
            }
            Syscall::Exit { is_failure, info } => {
                let info = self.translate_capdata_e_to_k(endpoint, info).await?;
                Ok(KernelSyscall::Exit { is_failure, info })
            }
            Syscall::DropImports { erefs } => {
                Ok(KernelSyscall::DropImports { krefs: self.translate_many_e_to_k(endpoint, erefs).await? })
            }
            Syscall::RetireImports { erefs } => {
                Ok(KernelSyscall::RetireImports { krefs: self.translate_many_e_to_k(endpoint, erefs).await? })
            }
            Syscall::RetireExports { erefs } => {
                Ok(KernelSyscall::RetireExports { krefs: self.translate_many_e_to_k(endpoint, erefs).await? })
            }
            Syscall::AbandonExports { erefs } => {
                Ok(KernelSyscall::AbandonExports { krefs: self.translate_many_e_to_k(endpoint, erefs).await? })
            }
        }
    }

    async fn translate_many_e_to_k(&self, endpoint: EndpointId, erefs: Vec<ERef>) -> Result<Vec<KRef>> {
        let mut out = Vec::with_capacity(erefs.len());
        for eref in erefs {
            out.push(self.translate_ref_e_to_k(endpoint, eref).await?);
        }
        Ok(out)
    }
}
