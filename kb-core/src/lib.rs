#![forbid(unsafe_code)]

//! Shared data model, permission policy engine, error taxonomy, wire types, and
//! configuration for the `kb` plugin host. Depended on by `kb-sandbox`, `kb-registry`,
//! `kb-host`, and `kb-cli`; has no dependency on any of them.

pub mod config;
pub mod error;
pub mod manifest;
pub mod model;
pub mod policy;
pub mod protocol;

pub use config::Config;
pub use error::{Error, ErrorCode, ErrorEnvelope, PermissionDenial, Result};
pub use manifest::{CliCommandSpec, Manifest, ManifestValidationError};
pub use model::{CleanupStack, Descriptor, HostKind, Trace, ViolationEvent};
pub use policy::{Decision, Policy};
