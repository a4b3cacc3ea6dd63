//! Leveled diagnostics for the runtime.
//!
//! Every line is prefixed with the world rank of the emitting PE in the form
//! `[<rank>]` (`[?]` before the runtime attaches). The filter level is read
//! once from the `SHOAL_LOG` environment variable; the default shows only
//! errors, so routine progress and warnings are verbose-only.

use std::cell::Cell;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};

use lazy_static::lazy_static;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::Fatal => "FATAL",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    const fn priority(self) -> u8 {
        match self {
            LogLevel::Fatal => 0,
            LogLevel::Error => 1,
            LogLevel::Warn => 2,
            LogLevel::Info => 3,
            LogLevel::Debug => 4,
            LogLevel::Trace => 5,
        }
    }

    fn from_priority(value: u8) -> Self {
        match value {
            0 => LogLevel::Fatal,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("fatal") {
            Some(LogLevel::Fatal)
        } else if value.eq_ignore_ascii_case("error") {
            Some(LogLevel::Error)
        } else if value.eq_ignore_ascii_case("warn") || value.eq_ignore_ascii_case("warning") {
            Some(LogLevel::Warn)
        } else if value.eq_ignore_ascii_case("info") {
            Some(LogLevel::Info)
        } else if value.eq_ignore_ascii_case("debug") {
            Some(LogLevel::Debug)
        } else if value.eq_ignore_ascii_case("trace") {
            Some(LogLevel::Trace)
        } else {
            None
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Error.priority());

lazy_static! {
    static ref ENV_LEVEL: LogLevel = std::env::var("SHOAL_LOG")
        .ok()
        .and_then(|v| LogLevel::from_str(&v))
        .unwrap_or(LogLevel::Error);
}

thread_local! {
    // World rank of the PE running on this thread; -1 until the runtime
    // attaches and after it detaches.
    static PE_RANK: Cell<i32> = const { Cell::new(-1) };
}

/// Apply the environment filter. Idempotent; called from `init`.
pub fn init() {
    LOG_LEVEL.store(ENV_LEVEL.priority(), Ordering::Relaxed);
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level.priority(), Ordering::Relaxed);
}

pub fn level() -> LogLevel {
    LogLevel::from_priority(LOG_LEVEL.load(Ordering::Relaxed))
}

pub(crate) fn set_rank(rank: i32) {
    PE_RANK.with(|r| r.set(rank));
}

pub(crate) fn rank() -> i32 {
    PE_RANK.with(|r| r.get())
}

/// Emit one diagnostic line. Fatal lines bypass the filter.
pub fn log(level: LogLevel, args: fmt::Arguments<'_>) {
    if level != LogLevel::Fatal && level.priority() > LOG_LEVEL.load(Ordering::Relaxed) {
        return;
    }

    let rank = rank();
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = if rank >= 0 {
        writeln!(out, "[{}] {}", rank, args)
    } else {
        writeln!(out, "[?] {}", args)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_are_ordered() {
        assert!(LogLevel::Fatal.priority() < LogLevel::Error.priority());
        assert!(LogLevel::Error.priority() < LogLevel::Warn.priority());
        assert!(LogLevel::Warn.priority() < LogLevel::Info.priority());
        assert!(LogLevel::Info.priority() < LogLevel::Debug.priority());
        assert!(LogLevel::Debug.priority() < LogLevel::Trace.priority());
    }

    #[test]
    fn parse_accepts_aliases() {
        assert_eq!(LogLevel::from_str("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("trace"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::from_str("bogus"), None);
    }

    #[test]
    fn roundtrip_priority() {
        for l in [
            LogLevel::Fatal,
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ] {
            assert_eq!(LogLevel::from_priority(l.priority()), l);
        }
    }
}
