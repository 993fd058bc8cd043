use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Tunables of a debug session.
///
/// Every polling loop in the session is bounded by one of these values. Environment variable
/// overrides use the `EUDEBUG_` prefix followed by the upper-cased field name.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Minimum time between two tick-driven FIFO drains.
    pub fifo_poll_interval_ms: u64,
    /// How long a sent interrupt may wait for attention before it is reported unavailable.
    pub interrupt_timeout_ms: u64,
    /// Upper bound on re-reading one invalid FIFO node.
    pub fifo_read_retry_timeout_ms: u64,
    pub fifo_read_settle_delay_us: u64,
    /// Polls of the SR counter before a resume is assumed to have happened.
    pub resume_confirm_max_polls: u32,
    pub resume_confirm_poll_delay_us: u64,
    /// Resumes touching at least this many threads confirm from one bulk snapshot per round.
    pub resume_bulk_read_threshold: usize,
    pub sip_command_max_retries: u32,
    pub sip_command_retry_delay_us: u64,
    pub read_event_poll_interval_us: u64,
    /// Passed through to backends that export allocations over IPC.
    pub enable_pid_fd_for_ipc: bool,
    /// Writes the raw state-save area header here the first time it is read.
    pub dump_debug_surface_file: Option<PathBuf>,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            fifo_poll_interval_ms: 150,
            interrupt_timeout_ms: 2000,
            fifo_read_retry_timeout_ms: 1,
            fifo_read_settle_delay_us: 100,
            resume_confirm_max_polls: 1000,
            resume_confirm_poll_delay_us: 10,
            resume_bulk_read_threshold: 4,
            sip_command_max_retries: 100,
            sip_command_retry_delay_us: 10,
            read_event_poll_interval_us: 1000,
            enable_pid_fd_for_ipc: false,
            dump_debug_surface_file: None,
        }
    }
}

impl DebugConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Applies `EUDEBUG_*` overrides from `lookup` on top of the defaults.
    ///
    /// Unparsable values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        let get = |name: &str| {
            lookup(&format!("EUDEBUG_{}", name.to_ascii_uppercase()))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        parse_into(&mut cfg.fifo_poll_interval_ms, get("fifo_poll_interval_ms"));
        parse_into(&mut cfg.interrupt_timeout_ms, get("interrupt_timeout_ms"));
        parse_into(
            &mut cfg.fifo_read_retry_timeout_ms,
            get("fifo_read_retry_timeout_ms"),
        );
        parse_into(
            &mut cfg.fifo_read_settle_delay_us,
            get("fifo_read_settle_delay_us"),
        );
        parse_into(
            &mut cfg.resume_confirm_max_polls,
            get("resume_confirm_max_polls"),
        );
        parse_into(
            &mut cfg.resume_confirm_poll_delay_us,
            get("resume_confirm_poll_delay_us"),
        );
        parse_into(
            &mut cfg.resume_bulk_read_threshold,
            get("resume_bulk_read_threshold"),
        );
        parse_into(&mut cfg.sip_command_max_retries, get("sip_command_max_retries"));
        parse_into(
            &mut cfg.sip_command_retry_delay_us,
            get("sip_command_retry_delay_us"),
        );
        parse_into(
            &mut cfg.read_event_poll_interval_us,
            get("read_event_poll_interval_us"),
        );
        if let Some(v) = get("enable_pid_fd_for_ipc") {
            cfg.enable_pid_fd_for_ipc = parse_bool(&v).unwrap_or(cfg.enable_pid_fd_for_ipc);
        }
        if let Some(v) = get("dump_debug_surface_file") {
            cfg.dump_debug_surface_file = Some(PathBuf::from(v));
        }
        cfg
    }

    pub fn fifo_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fifo_poll_interval_ms)
    }

    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }

    pub fn fifo_read_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.fifo_read_retry_timeout_ms)
    }

    pub fn fifo_read_settle_delay(&self) -> Duration {
        Duration::from_micros(self.fifo_read_settle_delay_us)
    }

    pub fn resume_confirm_poll_delay(&self) -> Duration {
        Duration::from_micros(self.resume_confirm_poll_delay_us)
    }

    pub fn sip_command_retry_delay(&self) -> Duration {
        Duration::from_micros(self.sip_command_retry_delay_us)
    }

    pub fn read_event_poll_interval(&self) -> Duration {
        Duration::from_micros(self.read_event_poll_interval_us)
    }
}

fn parse_into<T: std::str::FromStr>(slot: &mut T, value: Option<String>) {
    if let Some(parsed) = value.and_then(|v| v.parse().ok()) {
        *slot = parsed;
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
