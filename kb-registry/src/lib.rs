#![forbid(unsafe_code)]

//! Command Registry & Router (C7) and the manifest Registration Pipeline (C8).
//! Depends only on `kb-core`; knows nothing about sandboxed execution (`kb-sandbox`)
//! or process spawning (`kb-host`).

pub mod pipeline;
pub mod registry;
pub mod types;

pub use pipeline::{run_registration_pipeline, PipelineEnv, PipelineOutcome, SkippedEntry};
pub use registry::{CommandKind, CommandRegistry, Lookup, Routed};
pub use types::{
    CommandGroup, DiscoveryResult, DiscoverySource, PluginLifecycle, RegisteredCommand, SystemCommand,
    SystemInvocation,
};
