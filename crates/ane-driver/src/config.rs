// SPDX-License-Identifier: AGPL-3.0-only

//! Session configuration

use crate::request::MAX_SURFACES;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Timeout used by [`Session::wait_default`](crate::Session::wait_default), in milliseconds.
    pub timeout_ms: u64,
    /// Maximum surfaces (inputs plus outputs) per request, capped at the
    /// request record capacity.
    pub max_surfaces: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_surfaces: MAX_SURFACES,
        }
    }
}

impl SessionConfig {
    /// Builder: set the default timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Default timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Surfaces allowed per request.
    pub fn surface_limit(&self) -> usize {
        self.max_surfaces.min(MAX_SURFACES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_capped_by_record() {
        let cfg = SessionConfig {
            max_surfaces: 64,
            ..SessionConfig::default()
        };
        assert_eq!(cfg.surface_limit(), MAX_SURFACES);
        assert_eq!(SessionConfig::default().with_timeout(Duration::from_secs(2)).timeout_ms, 2_000);
    }
}
