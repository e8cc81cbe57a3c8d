//! Hidden `--sandbox-child` entrypoint: the other end of `kb-host::executor`'s
//! control channel (spec.md §4.6). Re-exec's this same binary; never invoked
//! directly by a user.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use kb_core::protocol::{encode_line, ControlToChild, ControlToHost};
use kb_sandbox::adapters::{IpcEventSink, IpcInvoker, IpcStateCache};
use kb_sandbox::bootstrap;
use kb_sandbox::context::{build_context, ContextInputs};
use kb_sandbox::harden::Harden;
use kb_sandbox::transport::IpcClient;

pub async fn run() -> anyhow::Result<()> {
    send_control(&ControlToHost::Ready).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut line = String::new();
    if stdin.read_line(&mut line).await? == 0 {
        // Host closed the pipe before sending anything; nothing to do.
        return Ok(());
    }

    let message: ControlToChild = serde_json::from_str(line.trim_end())?;
    let (descriptor, handler_path, input, socket_path) = match message {
        ControlToChild::Execute { descriptor, handler_path, input, socket_path } => (descriptor, handler_path, input, socket_path),
        ControlToChild::Abort => return Ok(()),
    };

    let harden = std::sync::Arc::new(Harden::install(bootstrap::mode_from_env()));

    let client = std::sync::Arc::new(IpcClient::connect(&socket_path).await?);
    let inputs = ContextInputs {
        state_cache: std::sync::Arc::new(IpcStateCache::new(client.clone())),
        event_sink: Some(std::sync::Arc::new(IpcEventSink::new(client.clone()))),
        invoker: Some(std::sync::Arc::new(IpcInvoker::new(client.clone()))),
        harden,
    };
    let built = build_context(descriptor, inputs);
    let context = built.context;
    let cleanup = built.cleanup;
    let handler_path_owned = std::path::PathBuf::from(handler_path);

    let outcome = tokio::task::spawn_blocking(move || bootstrap::run_handler(&handler_path_owned, &context, input)).await;

    let failures = bootstrap::finalize(cleanup, Duration::from_secs(5)).await;
    for failure in &failures {
        tracing::warn!(index = failure.index, message = %failure.message, "cleanup callback failed");
    }

    client.close().await;

    match outcome {
        Ok(Ok(result)) => {
            send_control(&ControlToHost::Result { exit_code: result.exit_code, result: result.result, meta: result.meta }).await?;
        }
        Ok(Err(err)) => {
            send_control(&ControlToHost::Error { error: bootstrap::envelope_for(&err) }).await?;
        }
        Err(join_err) => {
            let err = kb_core::error::Error::Internal(format!("handler task panicked: {join_err}"));
            send_control(&ControlToHost::Error { error: bootstrap::envelope_for(&err) }).await?;
        }
    }

    Ok(())
}

async fn send_control(message: &ControlToHost) -> anyhow::Result<()> {
    let line = encode_line(message)?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}
