//! Per-signal disposition (§3 "Signal configuration", §4.6).

use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalConfig {
    pub should_intercept: bool,
    pub should_pass_to_target: bool,
    pub should_report_to_client: bool,
}

impl SignalConfig {
    pub const fn pass_through() -> Self {
        SignalConfig {
            should_intercept: false,
            should_pass_to_target: true,
            should_report_to_client: false,
        }
    }

    pub const fn intercept_and_report() -> Self {
        SignalConfig {
            should_intercept: true,
            should_pass_to_target: false,
            should_report_to_client: true,
        }
    }
}

/// Thread-safe signal disposition table. May be read or written by any
/// thread (§5), unlike the debug-register/thread-state tables which are
/// debugger-thread-owned.
pub struct SignalPolicy {
    configs: Mutex<HashMap<i32, SignalConfig>>,
}

impl SignalPolicy {
    pub fn new() -> Self {
        let mut configs = HashMap::new();
        // SIGTRAP is always intercepted by the engine: it's how breakpoints,
        // watchpoints and single-steps are all delivered.
        configs.insert(
            libc::SIGTRAP,
            SignalConfig {
                should_intercept: true,
                should_pass_to_target: false,
                should_report_to_client: false,
            },
        );
        // SIGSTOP/SIGCONT are always forwarded, never reported unless the
        // caller explicitly overrides that (§4.6 defaults).
        configs.insert(libc::SIGSTOP, SignalConfig::pass_through());
        configs.insert(libc::SIGCONT, SignalConfig::pass_through());
        SignalPolicy {
            configs: Mutex::new(configs),
        }
    }

    pub fn set(&self, signal: i32, config: SignalConfig) {
        self.configs.lock().insert(signal, config);
    }

    /// Default for any signal not explicitly configured: pass through,
    /// don't report (§3).
    pub fn get(&self, signal: i32) -> SignalConfig {
        self.configs
            .lock()
            .get(&signal)
            .copied()
            .unwrap_or_else(SignalConfig::pass_through)
    }

    pub fn get_all(&self) -> HashMap<i32, SignalConfig> {
        self.configs.lock().clone()
    }
}

impl Default for SignalPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigtrap_defaults_to_intercepted_unreported() {
        let p = SignalPolicy::new();
        let c = p.get(libc::SIGTRAP);
        assert!(c.should_intercept);
        assert!(!c.should_pass_to_target);
    }

    #[test]
    fn unconfigured_signal_passes_through_without_report() {
        let p = SignalPolicy::new();
        let c = p.get(libc::SIGUSR2);
        assert!(!c.should_intercept);
        assert!(c.should_pass_to_target);
        assert!(!c.should_report_to_client);
    }

    #[test]
    fn explicit_override_is_honored() {
        let p = SignalPolicy::new();
        p.set(libc::SIGUSR1, SignalConfig::intercept_and_report());
        let c = p.get(libc::SIGUSR1);
        assert!(c.should_intercept);
        assert!(c.should_report_to_client);
    }
}
