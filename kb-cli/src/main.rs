//! `kb`: argv entrypoint. A leading `--sandbox-child` flag branches into the hidden
//! sandbox child before any normal CLI setup runs (spec.md §4.6) — the child re-uses
//! this same binary, spawned by `kb-host::executor::HostExecutor`.

mod argv;
mod commands;
mod discovery;
mod dispatch;
mod invoke_dispatch;
mod registry_setup;
mod sandbox_child;

use std::process::ExitCode;

fn main() -> ExitCode {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    if args.first().map(String::as_str) == Some("--sandbox-child") {
        args.remove(0);
        let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                eprintln!("kb: failed to start sandbox child runtime: {e}");
                return ExitCode::from(1);
            }
        };
        return match runtime.block_on(sandbox_child::run()) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("kb: sandbox child error: {e}");
                ExitCode::from(1)
            }
        };
    }

    let cwd = std::env::current_dir().unwrap_or_default();
    let config = kb_core::Config::load_or_default(cwd.join("kb.toml")).unwrap_or_default();
    init_tracing(&config);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("kb: failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(dispatch::run(args)) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("kb: {e}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(config: &kb_core::Config) {
    let filter = tracing_subscriber::EnvFilter::try_new(config.effective_log_level())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
