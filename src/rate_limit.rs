//! Rate limiting for listener clients
//!
//! A limiter is registered per client name with one or more resource profiles.
//! The poll algorithm only *queries* a limiter for its adjustment percentage;
//! consumption is recorded by whoever processes the polled messages.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use tracing::debug;

/// Adjustment source consulted when sizing reservations
pub trait RateLimiter: Send + Sync + fmt::Debug {
    /// Name the limiter is registered under (normally the client name)
    fn name(&self) -> &str;

    /// Fraction in `[0, 1]` of the computed slots the client may actually take
    fn adjustment_percentage(&self) -> Decimal;
}

/// A throttled resource, e.g. a downstream database or API the messages hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub name: String,
    pub requests_per_second: u32,
    #[serde(default)]
    pub burst: Option<u32>,
}

impl ResourceProfile {
    pub fn new(name: impl Into<String>, requests_per_second: u32) -> Self {
        Self {
            name: name.into(),
            requests_per_second,
            burst: None,
        }
    }
}

struct ProfileLimiter {
    profile: ResourceProfile,
    limiter: GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl fmt::Debug for ProfileLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileLimiter")
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Window {
    requested: u64,
    granted: u64,
}

/// Governor-backed limiter over a set of resource profiles
#[derive(Debug)]
pub struct ResourceRateLimiter {
    name: String,
    profiles: Vec<ProfileLimiter>,
    window: Mutex<Window>,
}

impl ResourceRateLimiter {
    /// Create a limiter for `name`; profiles with a zero rate are ignored
    pub fn new(name: impl Into<String>, profiles: Vec<ResourceProfile>) -> Self {
        let profiles = profiles
            .into_iter()
            .filter_map(|profile| {
                let rate = NonZeroU32::new(profile.requests_per_second)?;
                let burst = profile.burst.and_then(NonZeroU32::new).unwrap_or(rate);
                let limiter = GovernorLimiter::direct(Quota::per_second(rate).allow_burst(burst));
                Some(ProfileLimiter { profile, limiter })
            })
            .collect();

        Self {
            name: name.into(),
            profiles,
            window: Mutex::new(Window::default()),
        }
    }

    /// Record the consumption of `count` units; returns how many were granted.
    ///
    /// A unit is granted only when every profile admits it.
    pub fn try_consume(&self, count: u32) -> u32 {
        let mut granted = 0;
        for _ in 0..count {
            if self.profiles.iter().all(|p| p.limiter.check().is_ok()) {
                granted += 1;
            }
        }

        let mut window = self.window.lock();
        window.requested += count as u64;
        window.granted += granted as u64;

        if granted < count {
            debug!(
                limiter = %self.name,
                requested = count,
                granted = granted,
                "Rate limit throttled consumption"
            );
        }

        granted
    }

    /// Start a new accounting window
    pub fn reset_window(&self) {
        *self.window.lock() = Window::default();
    }

    pub fn profiles(&self) -> impl Iterator<Item = &ResourceProfile> {
        self.profiles.iter().map(|p| &p.profile)
    }
}

impl RateLimiter for ResourceRateLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    fn adjustment_percentage(&self) -> Decimal {
        let window = *self.window.lock();
        if window.requested == 0 {
            return Decimal::ONE;
        }
        (Decimal::from(window.granted) / Decimal::from(window.requested))
            .clamp(Decimal::ZERO, Decimal::ONE)
    }
}
