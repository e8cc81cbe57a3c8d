//! Top-level argv dispatch: resolve a command name against the registry (longest
//! word-prefix first, so multi-word composites like `plugin list` beat a bare
//! `plugin` match), then run it in-process (system) or hand it to the host executor
//! (plugin).

use std::sync::Arc;

use kb_core::model::HostKind;
use kb_host::{ExecuteRequest, ExecutorConfig, HostExecutor, PlatformContainer};
use kb_registry::{CommandRegistry, Lookup, SystemInvocation};

use crate::argv;
use crate::invoke_dispatch::Dispatcher;
use crate::registry_setup::{self, TOP_LEVEL_NAMES};

pub async fn run(args: Vec<String>) -> anyhow::Result<i32> {
    let cwd = std::env::current_dir()?;
    let config = Arc::new(kb_core::Config::load_or_default(cwd.join("kb.toml"))?);
    let built = registry_setup::build(&cwd, config);

    for err in &built.pipeline_outcome.errors {
        tracing::warn!(%err, "registration pipeline error");
    }

    if args.is_empty() {
        println!("usage: kb <command> [--flag value ...]");
        println!("commands: {}", TOP_LEVEL_NAMES.join(", "));
        return Ok(0);
    }

    let (words, flag_tokens) = argv::split_command_and_flags(&args);
    if words.is_empty() {
        anyhow::bail!("expected a command name, got only flags: {:?}", flag_tokens);
    }
    let flags = argv::parse_flags(&flag_tokens);

    let Some((lookup_len, lookup)) = resolve(&built.registry, &words) else {
        eprintln!("kb: unknown command '{}'", words.join(" "));
        return Ok(1);
    };
    let leftover = words[lookup_len..].to_vec();

    match lookup {
        Lookup::Group(group) => {
            println!("{}", group.describe.clone().unwrap_or_default());
            for cmd in &group.commands {
                println!("  {} {}", group.name, cmd.id);
            }
            Ok(0)
        }
        Lookup::System(cmd) => {
            let invocation = SystemInvocation { argv: leftover, flags };
            match (cmd.handler)(&invocation) {
                Ok(value) => {
                    println!("{}", serde_json::to_string_pretty(&value)?);
                    Ok(0)
                }
                Err(err) => {
                    eprintln!("kb: {err}");
                    Ok(1)
                }
            }
        }
        Lookup::Plugin(cmd) => {
            if !leftover.is_empty() {
                anyhow::bail!("plugin command '{}' takes flags only, got extra arguments: {:?}", cmd.id, leftover);
            }
            if !cmd.available {
                eprintln!(
                    "kb: command '{}' is unavailable: {}",
                    cmd.id,
                    cmd.unavailable_reason.clone().unwrap_or_default()
                );
                if let Some(hint) = &cmd.hint {
                    eprintln!("hint: {hint}");
                }
                return Ok(2);
            }

            let child_exe = std::env::current_exe()?;
            let sandbox_mode = config.effective_sandbox_mode();
            let dispatcher = Arc::new(Dispatcher {
                registry: built.registry.clone(),
                cwd: cwd.clone(),
                child_exe: child_exe.clone(),
                sandbox_mode,
            });
            let platform = Arc::new(PlatformContainer::new().with_invoke_dispatch(dispatcher));
            let executor = HostExecutor::new(ExecutorConfig::new(child_exe).with_sandbox_mode(sandbox_mode), platform);

            let req = ExecuteRequest {
                plugin_id: cmd.id.clone(),
                plugin_version: cmd.plugin_version.clone(),
                tenant_id: None,
                parent_request_id: None,
                host: HostKind::Cli,
                cwd: cwd.clone(),
                outdir: None,
                permissions: cmd.permissions.clone(),
                config: serde_json::Value::Null,
                host_context: serde_json::Value::Null,
                pkg_root: cmd.pkg_root.clone(),
                handler_path: cmd.handler_path.clone(),
                input: serde_json::json!({ "flags": flags }),
            };

            let outcome = executor.execute(req).await;
            match outcome.error {
                Some(envelope) => {
                    eprintln!("kb: {}", envelope.message);
                    Ok(outcome.exit_code)
                }
                None => {
                    if let Some(result) = outcome.result {
                        println!("{}", serde_json::to_string_pretty(&result)?);
                    }
                    Ok(outcome.exit_code)
                }
            }
        }
    }
}

/// Try progressively shorter prefixes of `words` (longest first) against the
/// registry, so `plugin list extra` resolves `plugin list` before falling back to
/// the bare `plugin` group.
fn resolve<'a>(registry: &'a CommandRegistry, words: &[String]) -> Option<(usize, Lookup<'a>)> {
    for len in (1..=words.len()).rev() {
        let candidate = words[..len].join(" ");
        if let Some(lookup) = registry.lookup(&candidate) {
            return Some((len, lookup));
        }
    }
    None
}
