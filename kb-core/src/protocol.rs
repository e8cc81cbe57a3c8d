//! Wire types for the host↔sandbox control channel and data channel (spec.md §4.4/§6).
//! Pure serde types; the sockets/processes that carry them live in `kb-sandbox` (child
//! side) and `kb-host` (host side).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ErrorEnvelope;
use crate::model::Descriptor;

/// Host -> child control message: spawn-time instructions (spec.md §4.6 step 2, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlToChild {
    #[serde(rename = "execute")]
    Execute {
        descriptor: Descriptor,
        #[serde(rename = "handlerPath")]
        handler_path: String,
        input: serde_json::Value,
        #[serde(rename = "socketPath")]
        socket_path: PathBuf,
    },
    #[serde(rename = "abort")]
    Abort,
}

/// Child -> host control message (spec.md §4.6 steps 10-11, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlToHost {
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "result")]
    Result {
        #[serde(rename = "exitCode")]
        exit_code: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<serde_json::Value>,
    },
    #[serde(rename = "error")]
    Error { error: ErrorEnvelope },
}

/// Request on the IPC data channel, child -> host (spec.md §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterCallRequest {
    #[serde(rename = "type")]
    pub kind: AdapterCallKind,
    pub request_id: String,
    pub adapter: String,
    pub method: String,
    pub args: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterCallKind {
    #[serde(rename = "adapter:call")]
    Call,
}

/// Response on the IPC data channel, host -> child (spec.md §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterCallResponse {
    #[serde(rename = "type")]
    pub kind: AdapterResponseKind,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterResponseKind {
    #[serde(rename = "adapter:response")]
    Response,
}

impl AdapterCallRequest {
    /// `requestId` is globally unique per client: `"rpc-<monotonic>-<random>"` (spec.md §4.4).
    pub fn new_id(counter: u64) -> String {
        format!("rpc-{counter}-{:06x}", fastrand_like(counter))
    }
}

/// Deterministic, dependency-free stand-in for a small random suffix (avoids pulling
/// in `rand` just for an IPC id tiebreaker).
fn fastrand_like(seed: u64) -> u32 {
    let mut x = seed.wrapping_mul(0x9E3779B97F4A7C15).wrapping_add(0xABCDEF);
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    (x & 0xFFFFFF) as u32
}

/// Serialise one frame as a `\n`-terminated JSON line, the framing spec.md §4.4 mandates.
pub fn encode_line<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let mut s = serde_json::to_string(value)?;
    s.push('\n');
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_execute_round_trips() {
        let msg = ControlToChild::Execute {
            descriptor: Descriptor {
                host: crate::model::HostKind::Cli,
                parent_request_id: None,
                plugin_id: "p".into(),
                plugin_version: "1.0.0".into(),
                tenant_id: None,
                cwd: "/tmp".into(),
                outdir: None,
                permissions: Default::default(),
                config: serde_json::json!({}),
                host_context: serde_json::json!({}),
            },
            handler_path: "dist/handler.so".into(),
            input: serde_json::json!({"flags": {"foo": 1}}),
            socket_path: "/tmp/kb.sock".into(),
        };
        let line = encode_line(&msg).expect("encode");
        assert!(line.ends_with('\n'));
        let parsed: ControlToChild = serde_json::from_str(line.trim_end()).expect("decode");
        match parsed {
            ControlToChild::Execute { handler_path, .. } => assert_eq!(handler_path, "dist/handler.so"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn adapter_call_request_ids_are_unique_per_counter() {
        let a = AdapterCallRequest::new_id(1);
        let b = AdapterCallRequest::new_id(2);
        assert_ne!(a, b);
        assert!(a.starts_with("rpc-1-"));
    }
}
