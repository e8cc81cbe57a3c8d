//! Built-in system commands (spec.md §4.7 "system" kind): `health`, `config show`,
//! `plugin list`/`plugin install`. Registered in-process, never cross the sandbox
//! boundary.

pub mod config;
pub mod health;
pub mod plugin;
