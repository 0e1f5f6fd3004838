//! Configuration surface and the `PlatformServices` collaborator (§6). The
//! kernel never parses an outer host format — these are plain serde types a
//! host deserialises and hands in.

use crate::error::KernelError;
use crate::ids::EndpointId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a vat's code is located. Exactly one variant is populated, matching
/// the source's `{sourceSpec}|{bundleSpec}|{bundleName}` union.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VatSource {
    SourceSpec(String),
    BundleSpec(String),
    BundleName(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VatConfig {
    pub source: VatSource,
    #[serde(default)]
    pub creation_options: serde_json::Value,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub platform_config: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub bootstrap: String,
    pub vats: BTreeMap<String, VatConfig>,
    #[serde(default)]
    pub force_reset: bool,
}

/// A group of vats launched/terminated together (§3 `Subcluster`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubclusterConfig {
    pub name: String,
    #[serde(default)]
    pub vats: BTreeMap<String, VatConfig>,
}

/// Endpoint lifecycle and remote transport, injected by the host (§6). The
/// core depends only on these signatures; WASM loading, process spawning,
/// and wire transport are all external.
#[async_trait]
pub trait PlatformServices: Send + Sync {
    async fn launch(&self, endpoint: EndpointId, config: VatConfig) -> Result<(), KernelError>;
    async fn terminate(&self, endpoint: EndpointId) -> Result<(), KernelError>;
    async fn terminate_all(&self) -> Result<(), KernelError>;

    /// Send a kernel-originated payload to a remote peer's transport. Local
    /// vats never go through this path — only `EndpointId::Remote` targets.
    async fn send_remote_message(
        &self,
        remote: EndpointId,
        payload: Vec<u8>,
    ) -> Result<(), KernelError>;

    async fn initialize_remote_comms(&self, remote: EndpointId) -> Result<(), KernelError>;
}
