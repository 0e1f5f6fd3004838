//! A capability-secure message kernel: persistent store, GC engine, router,
//! translator, and a single-threaded crank executor. The core has no
//! knowledge of how endpoints are hosted, how their code runs, or how the
//! KV store persists to disk — those are collaborators supplied by a host
//! (see [`kv::KVStore`], [`endpoint::EndpointHandle`], [`platform::PlatformServices`]).

pub mod capdata;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod gc;
pub mod ids;
pub mod kv;
pub mod model;
pub mod platform;
pub mod router;
pub mod service;
pub mod store;
pub mod subcluster;
pub mod translator;

pub use capdata::{CapData, Message, OneResolution};
pub use endpoint::{CrankResult, EndpointDirectory, EndpointHandle, LocalDirectory, Syscall, SyscallResolution, TerminateInfo};
pub use error::{KernelError, Result, Severity};
pub use executor::CrankExecutor;
pub use gc::GcEngine;
pub use ids::{Counter, EndpointId, ERef, ERefKind, KOId, KPId, KRef, Polarity, SubclusterId};
pub use kv::{KVStore, MemoryKv};
pub use model::{GcActionKind, KernelObject, KernelPromise, PromiseState, RunQueueItem, Subcluster};
pub use platform::{ClusterConfig, PlatformServices, SubclusterConfig, VatConfig, VatSource};
pub use router::Router;
pub use service::{ServiceManager, ServiceObject};
pub use store::{KernelStore, Store};
pub use subcluster::SubclusterManager;
pub use translator::{KernelResolution, KernelSyscall, Translator};
