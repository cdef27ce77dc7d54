//! Shared DTO types used across multiple endpoints.

use serde::Deserialize;
use utoipa::IntoParams;

/// Default number of rows returned by history endpoints.
pub const DEFAULT_LIMIT: usize = 50;
/// Largest accepted `limit`.
pub const MAX_LIMIT: usize = 500;

/// `?limit=` query parameter for history endpoints.
#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct LimitParams {
    /// Maximum rows to return, newest first. Defaults to 50, capped at 500.
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

impl Default for LimitParams {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
        }
    }
}

impl LimitParams {
    /// The limit clamped to `1..=MAX_LIMIT`.
    #[must_use]
    pub fn clamped(&self) -> usize {
        self.limit.clamp(1, MAX_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_clamped() {
        assert_eq!(LimitParams::default().clamped(), 50);
        assert_eq!(LimitParams { limit: 0 }.clamped(), 1);
        assert_eq!(LimitParams { limit: 10_000 }.clamped(), MAX_LIMIT);
    }
}
