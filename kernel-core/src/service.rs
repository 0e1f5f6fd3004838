//! The kernel-service pseudo-endpoint (§4.7). Hosts named objects exposed to
//! every other endpoint through ordinary sends; registration pins the
//! backing `KOId` so normal GC accounting never touches it.

use crate::capdata::{CapData, Message};
use crate::error::{KernelError, Result};
use crate::ids::{EndpointId, KOId, KPId, KRef};
use crate::store::Store;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[async_trait]
pub trait ServiceObject: Send + Sync {
    async fn invoke(&self, args: CapData<KRef>) -> Result<CapData<KRef>>;
}

pub struct ServiceManager {
    store: Arc<dyn Store>,
    objects: Mutex<HashMap<KOId, Arc<dyn ServiceObject>>>,
}

impl ServiceManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        ServiceManager { store, objects: Mutex::new(HashMap::new()) }
    }

    /// Allocates a pinned `KOId` owned by `"kernel"` and binds it to `object`.
    pub async fn register(&self, object: Arc<dyn ServiceObject>) -> Result<KOId> {
        let koid = self.store.init_kernel_object(EndpointId::Kernel).await?;
        self.store.pin_object(koid).await?;
        self.objects.lock().unwrap().insert(koid, object);
        Ok(koid)
    }

    /// Invokes the named object directly and resolves `message.result` (if
    /// any) with the outcome; a thrown error becomes a rejection rather than
    /// aborting the crank, matching an ordinary recoverable delivery.
    pub async fn dispatch(&self, target: KOId, message: Message<KRef, KPId>) -> Result<()> {
        let object = self
            .objects
            .lock()
            .unwrap()
            .get(&target)
            .cloned()
            .ok_or_else(|| KernelError::NoObject(target.to_string()))?;

        let outcome = object.invoke(message.methargs).await;
        if let Some(result) = message.result {
            match outcome {
                Ok(value) => {
                    self.store.resolve_kernel_promise(result, false, value).await?;
                }
                Err(e) => {
                    self.store.resolve_kernel_promise(result, true, CapData::empty(e.to_string())).await?;
                }
            }
        }
        Ok(())
    }
}
