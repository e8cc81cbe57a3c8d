//! `kb health`: a trivial always-available system command for scripted liveness checks.

use std::sync::Arc;

use kb_registry::SystemCommand;

pub fn command() -> SystemCommand {
    SystemCommand {
        id: "health".into(),
        describe: Some("Report the host binary's build version.".into()),
        aliases: vec![],
        handler: Arc::new(|_inv| {
            Ok(serde_json::json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
            }))
        }),
    }
}
