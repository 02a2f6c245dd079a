/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Monotonic application clock
//!
//! Connections stamp `last_queried` with a plain `u64` of milliseconds so
//! the stamp can live in an atomic and be read by the maintenance sweep
//! without locking. The base is `tokio::time::Instant`, which follows the
//! runtime's paused clock in tests.

use std::sync::OnceLock;
use tokio::time::Instant;

/// Clock origin, fixed on first use
static START_INSTANT: OnceLock<Instant> = OnceLock::new();

pub struct AppClock;

impl AppClock {
    fn base() -> Instant {
        *START_INSTANT.get_or_init(Instant::now)
    }

    /// Milliseconds elapsed since the clock origin
    pub fn elapsed_millis() -> u64 {
        Instant::now()
            .saturating_duration_since(Self::base())
            .as_millis() as u64
    }

    /// Milliseconds between `stamp` and now, saturating at zero
    pub fn millis_since(stamp: u64) -> u64 {
        Self::elapsed_millis().saturating_sub(stamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn follows_paused_runtime_clock() {
        let before = AppClock::elapsed_millis();
        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(AppClock::millis_since(before) >= 90_000);
    }

    #[test]
    fn stamp_in_future_saturates() {
        assert_eq!(AppClock::millis_since(u64::MAX), 0);
    }
}
