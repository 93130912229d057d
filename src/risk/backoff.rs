//! Per-venue error backoff.
//!
//! A venue that returned a known-bad error code is paused until a
//! deadline; the decision engine refuses signals that touch a paused
//! venue. Specific codes can additionally fire a venue-local restart
//! hook (rebuild REST/WS sessions without a process restart).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{info, warn};

type RestartHook = Arc<dyn Fn() + Send + Sync>;

struct PauseEntry {
    until: Instant,
    reason: String,
}

struct HookEntry {
    trigger_codes: Vec<String>,
    hook: RestartHook,
}

#[derive(Default)]
pub struct ErrorBackoffController {
    pauses: RwLock<HashMap<String, PauseEntry>>,
    hooks: RwLock<HashMap<String, HookEntry>>,
}

impl ErrorBackoffController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pause a venue. If the reason code matches one of the venue's
    /// registered trigger codes, the restart hook fires as well.
    pub fn pause(&self, venue: &str, duration: Duration, reason_code: &str) {
        let venue_key = venue.to_lowercase();
        warn!(
            "⏸️ [避让] {venue_key} 暂停 {:.0}s (code={reason_code})",
            duration.as_secs_f64()
        );
        self.pauses.write().insert(
            venue_key.clone(),
            PauseEntry {
                until: Instant::now() + duration,
                reason: reason_code.to_string(),
            },
        );

        let hook = {
            let hooks = self.hooks.read();
            hooks.get(&venue_key).and_then(|entry| {
                entry
                    .trigger_codes
                    .iter()
                    .any(|code| code == reason_code)
                    .then(|| entry.hook.clone())
            })
        };
        if let Some(hook) = hook {
            info!("🔁 [避让] {venue_key} 触发局部重启钩子 (code={reason_code})");
            hook();
        }
    }

    pub fn is_paused(&self, venue: &str) -> bool {
        let venue_key = venue.to_lowercase();
        let expired = {
            let pauses = self.pauses.read();
            match pauses.get(&venue_key) {
                Some(entry) => {
                    if Instant::now() < entry.until {
                        return true;
                    }
                    true // expired entry to clean up
                }
                None => false,
            }
        };
        if expired {
            if let Some(entry) = self.pauses.write().remove(&venue_key) {
                info!("▶️ [避让] {venue_key} 避让结束 (code={})", entry.reason);
            }
        }
        false
    }

    pub fn resume(&self, venue: &str) {
        self.pauses.write().remove(&venue.to_lowercase());
    }

    pub fn pause_reason(&self, venue: &str) -> Option<String> {
        self.pauses
            .read()
            .get(&venue.to_lowercase())
            .filter(|entry| Instant::now() < entry.until)
            .map(|entry| entry.reason.clone())
    }

    /// Register a venue-local restart hook for specific error codes.
    pub fn set_restart_hook(
        &self,
        venue: &str,
        trigger_codes: Vec<String>,
        hook: RestartHook,
    ) {
        self.hooks.write().insert(
            venue.to_lowercase(),
            HookEntry {
                trigger_codes,
                hook,
            },
        );
    }
}
