// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

use rand::Rng;

use crate::settings::SyncSettings;

/// When to retry a transiently failed mutation, and when to give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Transient failures tolerated before a mutation is dead-lettered.
    pub retry_ceiling: u32,
    pub apply_timeout: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following the `retry_count`th failure, without jitter.
    pub fn nominal_delay(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// The nominal delay scaled by a random factor in `[0.5, 1.5)`.
    pub fn delay(&self, retry_count: u32, rng: &mut impl Rng) -> Duration {
        self.nominal_delay(retry_count)
            .mul_f64(rng.gen_range(0.5..1.5))
    }

    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count > self.retry_ceiling
    }
}

impl From<&SyncSettings> for RetryPolicy {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            base_delay: settings.base_delay,
            max_delay: settings.max_delay,
            retry_ceiling: settings.retry_ceiling,
            apply_timeout: settings.apply_timeout,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}
