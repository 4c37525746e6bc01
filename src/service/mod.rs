//! Server side: handler registry, version resolution and dispatch.

pub mod call;
pub mod dispatch;
pub mod registry;
pub mod reply;
pub mod session;
pub mod signature;
pub mod version;

pub use call::{Call, CallEnv, CallOrigin};
pub use dispatch::{DispatchConfig, Dispatcher};
pub use registry::{
    Handler, HandlerRegistry, HandlerVariant, RegistryBuilder, RegistryError, Route, ServiceDef,
    HEALTH_PATH,
};
pub use reply::{Payload, Record, Reply, ReplyService};
pub use session::{MemorySessionStore, SessionConfig, SessionError, SessionStore};
pub use signature::{expected_signature, SignConfig};
pub use version::{compare_versions, resolve, version_matches};
