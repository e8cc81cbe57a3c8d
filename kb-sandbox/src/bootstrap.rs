//! Sandbox Bootstrap (C6, spec.md §4.6): the sequence a spawned child runs.
//!
//! A plugin "module" is a cdylib exporting one entrypoint, `kb_plugin_execute`, and a
//! matching `kb_plugin_free_result` to release the string it returns. The entrypoint
//! receives a `*const Context` and a JSON input string, and returns a JSON envelope
//! `{"exitCode": i32, "result"?: value, "meta"?: value}` as a C string. This is the
//! closest Rust equivalent of "import the handler module by path... require a member
//! execute(ctx, input)" (spec.md §4.6 step 8): there is no dynamic `import()` in a
//! compiled binary, so the handler is a `.so`/`.dll`/`.dylib` resolved by
//! `libloading::Library::new`, and the only two symbols crossing that boundary are
//! this pair. Handler crates must be built against the same `kb-sandbox` version as
//! the host — `Context`'s layout is not a stable ABI, only an internal contract within
//! one matched toolchain (documented assumption, spec.md §9 is silent on handler
//! packaging).

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::Path;

use kb_core::error::{Error, ErrorEnvelope, Result};
use kb_core::model::CleanupFailure;
use serde::Deserialize;
use serde_json::Value;

use crate::context::Context;
use crate::harden::EnforcementMode;

pub const ENTRY_SYMBOL: &[u8] = b"kb_plugin_execute\0";
pub const FREE_SYMBOL: &[u8] = b"kb_plugin_free_result\0";

type ExecuteFn = unsafe extern "C" fn(ctx: *const Context, input_json: *const c_char) -> *mut c_char;
type FreeFn = unsafe extern "C" fn(ptr: *mut c_char);

#[derive(Debug, Deserialize)]
pub struct HandlerOutcome {
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub meta: Option<Value>,
}

/// Load the handler at `handler_path` and invoke it with `ctx`/`input` (spec.md §4.6
/// steps 8-10). `input.flags` is flattened into top-level input keys first (step 9).
pub fn run_handler(handler_path: &Path, ctx: &Context, mut input: Value) -> Result<HandlerOutcome> {
    flatten_flags(&mut input);
    let input_json = serde_json::to_string(&input)?;
    let input_c = CString::new(input_json).map_err(|e| Error::Internal(e.to_string()))?;

    // SAFETY: `handler_path` names a file the manifest registration pipeline (C8)
    // already validated exists and is readable; loading it can still fail (bad ELF,
    // missing symbols), which we surface as `Error::InvalidHandler` rather than panic.
    let library = unsafe { libloading::Library::new(handler_path) }
        .map_err(|e| Error::InvalidHandler(format!("failed to load '{}': {e}", handler_path.display())))?;

    // SAFETY: `ENTRY_SYMBOL`/`FREE_SYMBOL` are fixed, NUL-terminated byte strings; the
    // symbol's function-pointer type is the ABI contract documented on this module.
    // A handler lacking either symbol fails cleanly via `libloading`'s own error path.
    let execute: libloading::Symbol<ExecuteFn> = unsafe { library.get(ENTRY_SYMBOL) }
        .map_err(|e| Error::InvalidHandler(format!("missing {} export: {e}", String::from_utf8_lossy(ENTRY_SYMBOL))))?;
    let free: libloading::Symbol<FreeFn> = unsafe { library.get(FREE_SYMBOL) }
        .map_err(|e| Error::InvalidHandler(format!("missing {} export: {e}", String::from_utf8_lossy(FREE_SYMBOL))))?;

    // SAFETY: `ctx` outlives this call (caller owns it on the stack); `input_c` is a
    // valid, NUL-terminated C string for the call's duration.
    let raw_result = unsafe { execute(ctx as *const Context, input_c.as_ptr()) };
    if raw_result.is_null() {
        return Err(Error::InvalidHandler("handler returned a null result".to_string()));
    }

    // SAFETY: `raw_result` was just returned by `execute` and is non-null; it is read
    // before being handed back to the handler's own `free` to release.
    let outcome_json = unsafe { CStr::from_ptr(raw_result) }.to_string_lossy().into_owned();
    // SAFETY: `raw_result` came from this same library's allocator via `execute`, and
    // `free` is the matching deallocator it exported for exactly this pointer.
    unsafe { free(raw_result) };

    let outcome: HandlerOutcome =
        serde_json::from_str(&outcome_json).map_err(|e| Error::InvalidHandler(format!("handler returned invalid envelope: {e}")))?;
    Ok(outcome)
}

/// `input.flags` keys surface as top-level input keys (spec.md §4.6 step 9).
fn flatten_flags(input: &mut Value) {
    let Some(obj) = input.as_object_mut() else { return };
    let Some(Value::Object(flags)) = obj.remove("flags") else { return };
    for (k, v) in flags {
        obj.entry(k).or_insert(v);
    }
}

/// Resolve the enforcement mode for this child from the environment (spec.md §4.6
/// step 3: "enforce default, override by KB_SANDBOX_MODE").
pub fn mode_from_env() -> EnforcementMode {
    std::env::var("KB_SANDBOX_MODE").ok().map(|s| EnforcementMode::from_env_str(&s)).unwrap_or(EnforcementMode::Enforce)
}

/// Everything the bootstrap must do on every exit path, success or failure
/// (spec.md §4.6 step 12): clear any context singleton the caller installed, drain
/// the cleanup stack, and report any drain failures (logged, not fatal).
pub async fn finalize(cleanup: kb_core::model::CleanupStack, release_timeout: std::time::Duration) -> Vec<CleanupFailure> {
    cleanup.drain(release_timeout).await
}

/// Wrap a handler failure into the `error` control message envelope (spec.md §4.6
/// step 11): typed `Error`s keep their code, everything else defaults to
/// `INTERNAL_ERROR`.
pub fn envelope_for(err: &Error) -> ErrorEnvelope {
    ErrorEnvelope::wrap(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_flags_surfaces_top_level_keys() {
        let mut input = serde_json::json!({ "flags": { "verbose": true }, "name": "demo" });
        flatten_flags(&mut input);
        assert_eq!(input["verbose"], serde_json::json!(true));
        assert_eq!(input["name"], serde_json::json!("demo"));
        assert!(input.get("flags").is_none());
    }

    #[test]
    fn flatten_flags_does_not_override_existing_key() {
        let mut input = serde_json::json!({ "flags": { "name": "from-flag" }, "name": "explicit" });
        flatten_flags(&mut input);
        assert_eq!(input["name"], serde_json::json!("explicit"));
    }

    #[test]
    fn mode_from_env_defaults_to_enforce_when_unset() {
        std::env::remove_var("KB_SANDBOX_MODE");
        assert_eq!(mode_from_env(), EnforcementMode::Enforce);
    }

    #[test]
    fn unresolvable_handler_path_reports_invalid_handler() {
        let ctx_err = Error::InvalidHandler("failed to load 'missing.so': not found".to_string());
        let envelope = envelope_for(&ctx_err);
        assert_eq!(envelope.code, "INVALID_HANDLER");
    }
}
