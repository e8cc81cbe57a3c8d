#![forbid(unsafe_code)]

//! Host Executor (C9) and the process-global Platform Container (spec.md §4.9, §5):
//! spawns and supervises the sandboxed child for one plugin command invocation, and
//! serves the `state`/`events`/`invoke` adapters it calls back into over IPC.
//! Depends on `kb-core` (wire types, error taxonomy) and `kb-sandbox` (the IPC
//! transport); knows nothing about the Command Registry (`kb-registry`) or CLI
//! wiring (`kb-cli`) — `InvokeDispatch` is the seam that lets `kb-cli` glue registry
//! lookup and recursive execution together without a circular dependency.

pub mod executor;
pub mod platform;
pub mod services;

pub use executor::{ExecuteRequest, ExecutorConfig, HostExecutor, InvocationOutcome, InvocationState};
pub use platform::{InvokeDispatch, PlatformContainer};
pub use services::{EventsAdapterService, InvokeAdapterService, StateAdapterService};
