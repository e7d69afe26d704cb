//! Token-bucket rate limiting keyed by one of three scopes, per
//! `spec.md` §4.2 / §6: `connection` (source IP), `tunnel` (client id),
//! `request` (tunnel id). Each scope gets its own bucket per key, backed by
//! `governor`'s keyed rate limiter (itself a sharded, lock-free map under
//! the hood, so a hot tunnel's bucket doesn't contend with another's).

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter as GovernorLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

type KeyedLimiter = GovernorLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// The three rate-limit scopes defined in `spec.md` §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Keyed by the public-side source IP; applied at control-channel upgrade.
    Connection,
    /// Keyed by client id; applied to `tunnel_open`.
    Tunnel,
    /// Keyed by tunnel id; applied to each inbound public request.
    Request,
}

#[derive(Debug, Error)]
#[error("rate limit exceeded for {scope:?} scope (key {key:?})")]
pub struct RateLimitExceeded {
    pub scope: Scope,
    pub key: String,
}

/// Capacity and refill rate for one scope's buckets.
#[derive(Debug, Clone, Copy)]
pub struct ScopeLimits {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl ScopeLimits {
    fn quota(&self) -> Quota {
        let burst = NonZeroU32::new(self.capacity.max(1)).unwrap_or(nonzero!(1u32));
        if self.refill_per_sec <= 0.0 {
            // A zero refill rate means "never refills" — used by rate-limit
            // tests that want to exhaust a bucket and see it stay exhausted.
            // governor has no "infinite period" quota, so we use a period
            // long enough that it will not tick during any realistic test.
            return Quota::with_period(Duration::from_secs(3600 * 24 * 365))
                .expect("nonzero period")
                .allow_burst(burst);
        }
        let period = Duration::from_secs_f64(1.0 / self.refill_per_sec);
        Quota::with_period(period)
            .expect("nonzero period")
            .allow_burst(burst)
    }
}

/// Per-scope configuration. Defaults match the table in `spec.md` §6.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub enabled: bool,
    pub connection: ScopeLimits,
    pub tunnel: ScopeLimits,
    pub request: ScopeLimits,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            connection: ScopeLimits {
                capacity: 10,
                refill_per_sec: 1.0,
            },
            tunnel: ScopeLimits {
                capacity: 5,
                refill_per_sec: 0.2,
            },
            request: ScopeLimits {
                capacity: 100,
                refill_per_sec: 20.0,
            },
        }
    }
}

/// The three keyed token buckets, one per [`Scope`].
pub struct RateLimiters {
    enabled: bool,
    connection: KeyedLimiter,
    tunnel: KeyedLimiter,
    request: KeyedLimiter,
}

impl RateLimiters {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            enabled: config.enabled,
            connection: GovernorLimiter::keyed(config.connection.quota()),
            tunnel: GovernorLimiter::keyed(config.tunnel.quota()),
            request: GovernorLimiter::keyed(config.request.quota()),
        }
    }

    /// Consume one token from `scope`'s bucket for `key`. A disabled limiter
    /// (`rate_limits_enabled = false` in the config surface) always allows.
    pub fn check(&self, scope: Scope, key: &str) -> Result<(), RateLimitExceeded> {
        if !self.enabled {
            return Ok(());
        }
        let limiter = match scope {
            Scope::Connection => &self.connection,
            Scope::Tunnel => &self.tunnel,
            Scope::Request => &self.request,
        };
        limiter.check_key(&key.to_string()).map_err(|_| {
            tracing::debug!(?scope, key, "rate limit exceeded");
            RateLimitExceeded {
                scope,
                key: key.to_string(),
            }
        })
    }

    /// Drop buckets for keys that haven't been touched recently, so a server
    /// that sees many distinct client IPs over its lifetime doesn't grow the
    /// keyed maps without bound. Call periodically from the heartbeat sweep.
    pub fn retain_recent(&self) {
        self.connection.retain_recent();
        self.tunnel.retain_recent();
        self.request.retain_recent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_capacity_then_denies() {
        let limiters = RateLimiters::new(RateLimiterConfig {
            enabled: true,
            connection: RateLimiterConfig::default().connection,
            tunnel: ScopeLimits {
                capacity: 2,
                refill_per_sec: 0.0,
            },
            request: RateLimiterConfig::default().request,
        });

        assert!(limiters.check(Scope::Tunnel, "client-1").is_ok());
        assert!(limiters.check(Scope::Tunnel, "client-1").is_ok());
        assert!(limiters.check(Scope::Tunnel, "client-1").is_err());
    }

    #[test]
    fn scopes_are_independent_per_key() {
        let limiters = RateLimiters::new(RateLimiterConfig {
            tunnel: ScopeLimits {
                capacity: 1,
                refill_per_sec: 0.0,
            },
            ..RateLimiterConfig::default()
        });

        assert!(limiters.check(Scope::Tunnel, "client-a").is_ok());
        assert!(limiters.check(Scope::Tunnel, "client-a").is_err());
        // A different key has its own bucket.
        assert!(limiters.check(Scope::Tunnel, "client-b").is_ok());
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let limiters = RateLimiters::new(RateLimiterConfig {
            enabled: false,
            tunnel: ScopeLimits {
                capacity: 1,
                refill_per_sec: 0.0,
            },
            ..RateLimiterConfig::default()
        });

        for _ in 0..10 {
            assert!(limiters.check(Scope::Tunnel, "client-1").is_ok());
        }
    }
}
