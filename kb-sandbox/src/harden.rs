#![forbid(unsafe_code)]

//! Sandbox Harden Layer (C3, spec.md §4.3).
//!
//! The original design intercepts ambient globals — a module loader, global `fetch`,
//! the process env view, `process.exit`/`chdir` — and swaps in policy-gated proxies for
//! the lifetime of one invocation. A compiled Rust plugin has no such ambient surface to
//! monkey-patch: there is no module loader to intercept (`libloading` resolves a fixed
//! path the host already chose) and no global mutable `fetch`/`env` object a handler can
//! reach around the facades in [`crate::facade`]. So here "installing the harden layer"
//! means committing to an [`EnforcementMode`] and a [`ViolationSink`] before the handler
//! runs, and every facade operation in `kb-sandbox::facade` consults both; there is
//! nothing left to restore on teardown because nothing was ever replaced.
//!
//! What does carry over: the three-mode posture (enforce/compat/warn) and violation
//! reporting (spec.md §4.3) are real, enforced by [`Harden::record`] and threaded
//! through every facade call site.

use std::sync::Arc;

use kb_core::model::{ViolationDecision, ViolationEvent, ViolationKind};

/// Enforcement posture read from `kb.toml`/`KB_SANDBOX_MODE` (spec.md §4.6 step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementMode {
    /// Denials are enforced and reported.
    Enforce,
    /// Denials are enforced; violations are reported as warnings rather than blocks.
    Compat,
    /// Nothing is denied; every would-be denial is reported as a warning only.
    Warn,
}

impl EnforcementMode {
    pub fn from_env_str(s: &str) -> Self {
        match s {
            "compat" => EnforcementMode::Compat,
            "warn" => EnforcementMode::Warn,
            _ => EnforcementMode::Enforce,
        }
    }
}

/// Where [`Harden::record`] reports each interception (spec.md §4.3 "Violation reporting").
pub trait ViolationSink: Send + Sync {
    fn report(&self, event: &ViolationEvent);
}

/// Default sink: one structured line on stderr via `tracing`, matching the teacher's
/// plugin_sandbox.rs `warn!`-on-denial style.
pub struct StderrViolationSink;

impl ViolationSink for StderrViolationSink {
    fn report(&self, event: &ViolationEvent) {
        tracing::warn!(
            kind = ?event.kind,
            target = %event.target,
            decision = ?event.decision,
            message = %event.message,
            "sandbox violation"
        );
    }
}

/// Installed once per invocation (spec.md §4.3 "Installed once per invocation before
/// the handler is imported"). Held for the lifetime of the handler call; dropping it
/// is the harden layer's "restores all globals on teardown" — a no-op here since
/// nothing mutable was ever shared with the handler in the first place.
pub struct Harden {
    mode: EnforcementMode,
    sink: Arc<dyn ViolationSink>,
}

impl Harden {
    pub fn install(mode: EnforcementMode) -> Self {
        Self::install_with_sink(mode, Arc::new(StderrViolationSink))
    }

    pub fn install_with_sink(mode: EnforcementMode, sink: Arc<dyn ViolationSink>) -> Self {
        Self { mode, sink }
    }

    pub fn mode(&self) -> EnforcementMode {
        self.mode
    }

    /// Whether a facade should actually deny a would-be-denied operation: `warn` mode
    /// never denies (spec.md §4.3), `enforce`/`compat` both do.
    pub fn should_deny(&self) -> bool {
        !matches!(self.mode, EnforcementMode::Warn)
    }

    /// Record an interception. Always reports; only actually blocks outside `warn` mode.
    pub fn record(&self, kind: ViolationKind, target: impl Into<String>, message: impl Into<String>) {
        let decision = if self.should_deny() { ViolationDecision::Block } else { ViolationDecision::Warn };
        self.sink.report(&ViolationEvent {
            kind,
            target: target.into(),
            decision,
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectingSink {
        events: Mutex<Vec<ViolationEvent>>,
    }

    impl ViolationSink for CollectingSink {
        fn report(&self, event: &ViolationEvent) {
            self.events.lock().expect("lock").push(event.clone());
        }
    }

    #[test]
    fn warn_mode_never_denies() {
        let harden = Harden::install(EnforcementMode::Warn);
        assert!(!harden.should_deny());
    }

    #[test]
    fn enforce_and_compat_both_deny() {
        assert!(Harden::install(EnforcementMode::Enforce).should_deny());
        assert!(Harden::install(EnforcementMode::Compat).should_deny());
    }

    #[test]
    fn record_reports_block_outside_warn_mode() {
        let sink = Arc::new(CollectingSink { events: Mutex::new(Vec::new()) });
        let harden = Harden::install_with_sink(EnforcementMode::Enforce, sink.clone());
        harden.record(ViolationKind::Fs, "/etc/passwd", "blocked read");
        let events = sink.events.lock().expect("lock");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].decision, ViolationDecision::Block);
    }

    #[test]
    fn record_reports_warn_in_warn_mode() {
        let sink = Arc::new(CollectingSink { events: Mutex::new(Vec::new()) });
        let harden = Harden::install_with_sink(EnforcementMode::Warn, sink.clone());
        harden.record(ViolationKind::Fetch, "https://evil.example", "would deny");
        assert_eq!(sink.events.lock().expect("lock")[0].decision, ViolationDecision::Warn);
    }

    #[test]
    fn mode_from_env_str_defaults_to_enforce() {
        assert_eq!(EnforcementMode::from_env_str("compat"), EnforcementMode::Compat);
        assert_eq!(EnforcementMode::from_env_str("warn"), EnforcementMode::Warn);
        assert_eq!(EnforcementMode::from_env_str("garbage"), EnforcementMode::Enforce);
    }
}
