//! Fixed-window rate limiter for the sync endpoints.
//!
//! Keyed by tenant and terminal (mobile clients, which all share one origin
//! id, are keyed by employee instead). State is process-local: one server
//! instance per store is assumed. A reaper task drops expired entries.

use crate::entities::MOBILE_APP_TERMINAL;
use crate::identity::RequestIdentity;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_calls: u32,
    pub window: Duration,
    pub lockout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: 100,
            window: Duration::from_secs(60),
            lockout: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Limited { retry_after: Duration },
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    started: Instant,
    locked_until: Option<Instant>,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    entries: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, key: &str) -> Decision {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Decision {
        let Ok(mut entries) = self.entries.lock() else {
            // A poisoned map only loses counters; let the call through.
            warn!("Rate limiter state poisoned, allowing request");
            return Decision::Allowed;
        };
        let window = entries.entry(key.to_string()).or_insert(Window {
            count: 0,
            started: now,
            locked_until: None,
        });

        if let Some(until) = window.locked_until {
            if until > now {
                return Decision::Limited {
                    retry_after: until - now,
                };
            }
        }

        if now.duration_since(window.started) > self.config.window {
            *window = Window {
                count: 0,
                started: now,
                locked_until: None,
            };
        }

        window.count += 1;
        if window.count > self.config.max_calls {
            window.locked_until = Some(now + self.config.lockout);
            warn!(key, "Sync rate limit exceeded, locking out");
            return Decision::Limited {
                retry_after: self.config.lockout,
            };
        }
        Decision::Allowed
    }

    /// Drop entries whose lockout ended or whose window is long expired.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        let stale_after = self.config.window * 2;
        entries.retain(|_, w| match w.locked_until {
            Some(until) => until >= now,
            None => now.duration_since(w.started) <= stale_after,
        });
        before - entries.len()
    }

    pub fn tracked(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Periodically sweep until `cancel` fires.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            info!("Rate limit reaper started (interval: {}s)", every.as_secs());
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Rate limit reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = limiter.sweep();
                        if removed > 0 {
                            debug!(removed, "Swept expired rate limit entries");
                        }
                    }
                }
            }
        })
    }
}

/// Limiter key for a verified caller.
pub fn key_for(identity: &RequestIdentity) -> String {
    match identity.terminal_id.as_deref() {
        Some(terminal) if terminal != MOBILE_APP_TERMINAL => {
            format!("{}:{terminal}", identity.tenant_id)
        }
        _ => match identity.employee_id {
            Some(employee) => format!("{}:mobile:{employee}", identity.tenant_id),
            None => format!("{}:unknown", identity.tenant_id),
        },
    }
}
