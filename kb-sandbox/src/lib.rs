//! Runtime capability facades, the harden layer, the IPC transport (both ends), the
//! context factory, and the sandbox bootstrap entrypoint run inside a spawned plugin
//! child. Depends only on `kb-core`.

#[cfg(unix)]
pub mod adapters;
pub mod bootstrap;
pub mod context;
pub mod facade;
pub mod harden;
pub mod transport;

pub use context::{build_context, BuiltContext, Context, ContextInputs};
pub use harden::{EnforcementMode, Harden, ViolationSink};
pub use transport::{IpcClient, IpcServer, TransportError};

#[cfg(unix)]
pub use adapters::{IpcEventSink, IpcInvoker, IpcStateCache};
