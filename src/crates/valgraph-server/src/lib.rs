//! # valgraph-server
//!
//! Serving layer of the valgraph engine: the streaming dispatcher, the
//! thread registry and the HTTP/SSE boundary.
//!
//! One process hosts one [`Engine`]: a fixed graph deployment, a durable
//! checkpoint store and an artifact store. Callers POST a message or a
//! resume value to `/stream` and read a versioned, strictly-sequenced
//! event stream back; everything else (`/threads/{id}`, `/history`,
//! `/cancel`, `/state`) exists so clients can reattach, inspect and fork
//! without holding a connection open.

pub mod api;
pub mod artifacts;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod envelope;
pub mod mapper;
pub mod registry;

pub use api::create_router;
pub use artifacts::{ArtifactRef, ArtifactStore, FsArtifactStore, MemoryArtifactStore};
pub use config::{EngineConfig, PROTOCOL_VERSION};
pub use dispatch::ThreadDispatcher;
pub use engine::Engine;
pub use envelope::EventEnvelope;
pub use mapper::{FieldProjection, MapperRegistry, StateMapper};
pub use registry::{GraphDeployment, RegistryError, ThreadRegistry, ThreadStatus, ThreadView};
