//! Throttled logging helpers.
//!
//! High-frequency decision paths would otherwise emit the same line on
//! every 100 ms tick; everything repetitive goes through a per-key
//! throttle. Rejection codes are stable identifiers so operators can grep
//! for "why did nothing happen".

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

pub const DEFAULT_REJECT_THROTTLE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
}

struct ThrottleEntry {
    last_emit: Instant,
    suppressed: u64,
}

/// Per-key rate limiter for repetitive log lines. Counts how many emits
/// were suppressed and reports the count on the next pass-through.
#[derive(Default)]
pub struct ThrottledLogger {
    entries: Mutex<HashMap<String, ThrottleEntry>>,
}

impl ThrottledLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `message` at most once per `interval` for this `key`.
    /// Returns true when the line was actually emitted.
    pub fn log(&self, key: &str, message: &str, level: LogLevel, interval: Duration) -> bool {
        let suppressed = {
            let mut entries = self.entries.lock();
            match entries.get_mut(key) {
                Some(entry) if entry.last_emit.elapsed() < interval => {
                    entry.suppressed += 1;
                    return false;
                }
                Some(entry) => {
                    let count = entry.suppressed;
                    entry.suppressed = 0;
                    entry.last_emit = Instant::now();
                    count
                }
                None => {
                    entries.insert(
                        key.to_string(),
                        ThrottleEntry {
                            last_emit: Instant::now(),
                            suppressed: 0,
                        },
                    );
                    0
                }
            }
        };

        let suffix = if suppressed > 0 {
            format!(" | 抑制重复: {suppressed} 次")
        } else {
            String::new()
        };
        match level {
            LogLevel::Info => info!("{message}{suffix}"),
            LogLevel::Warn => warn!("{message}{suffix}"),
        }
        true
    }

    /// Drop all throttle state for keys with the given prefix.
    pub fn clear_prefix(&self, prefix: &str) {
        self.entries.lock().retain(|key, _| !key.starts_with(prefix));
    }
}

/// Structured rejection line for a gate that blocked an open/close.
/// Throttled per (action, symbol, code).
pub fn log_signal_reject(
    throttle: &ThrottledLogger,
    action: &str,
    symbol: &str,
    code: &str,
    detail: Option<&str>,
) {
    let key = format!("{action}:{symbol}:{code}");
    let message = match detail {
        Some(detail) => {
            format!("🚫 [信号拒绝] action={action} symbol={symbol} code={code} detail={detail}")
        }
        None => format!("🚫 [信号拒绝] action={action} symbol={symbol} code={code}"),
    };
    throttle.log(&key, &message, LogLevel::Warn, DEFAULT_REJECT_THROTTLE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttles_repeated_keys() {
        let logger = ThrottledLogger::new();
        assert!(logger.log("k", "first", LogLevel::Info, Duration::from_secs(60)));
        assert!(!logger.log("k", "second", LogLevel::Info, Duration::from_secs(60)));
        assert!(!logger.log("k", "third", LogLevel::Info, Duration::from_secs(60)));
        // A different key is independent.
        assert!(logger.log("other", "first", LogLevel::Info, Duration::from_secs(60)));
    }

    #[test]
    fn zero_interval_always_emits() {
        let logger = ThrottledLogger::new();
        assert!(logger.log("k", "a", LogLevel::Warn, Duration::ZERO));
        assert!(logger.log("k", "b", LogLevel::Warn, Duration::ZERO));
    }

    #[test]
    fn clear_prefix_resets_state() {
        let logger = ThrottledLogger::new();
        assert!(logger.log("sym:open", "a", LogLevel::Info, Duration::from_secs(60)));
        logger.clear_prefix("sym:");
        assert!(logger.log("sym:open", "b", LogLevel::Info, Duration::from_secs(60)));
    }
}
