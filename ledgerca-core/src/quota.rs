//! Enrollment quota policy.
//!
//! A quota value of [`UNLIMITED`] (0) means no cap; [`INHERIT`] (-1) on an
//! identity means "use the registry maximum".

use thiserror::Error;

/// No cap on enrollments.
pub const UNLIMITED: i64 = 0;

/// Identity-level value meaning "use the registry maximum".
pub const INHERIT: i64 = -1;

/// Errors from quota resolution and enforcement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum QuotaError {
    /// The registry maximum itself is invalid.
    #[error("registry max_enrollments must not be negative, got {0}")]
    InvalidRegistryMax(i64),

    #[error("infinite enrollments is not permitted; max is {max}")]
    UnlimitedNotPermitted { max: i64 },

    #[error("max enrollments of {requested} is not permitted; max is {max}")]
    AboveRegistryMax { requested: i64, max: i64 },

    /// The identity already used every enrollment it is allowed.
    #[error("enrollment quota of {cap} exhausted")]
    Exhausted { cap: i64 },
}

/// Resolve an identity's cap from the registry maximum and the requested
/// value.
///
/// | registry | requested | result            |
/// |----------|-----------|-------------------|
/// | 0        | < 0       | 0 (unlimited)     |
/// | 0        | N >= 0    | N                 |
/// | M > 0    | < 0       | M                 |
/// | M > 0    | 0         | rejected          |
/// | M > 0    | N > M     | rejected          |
/// | M > 0    | N <= M    | N                 |
///
/// # Errors
///
/// Returns `QuotaError::InvalidRegistryMax` for a negative registry maximum
/// and the rejection variants listed above.
pub fn resolve_max_enrollments(registry_max: i64, requested: i64) -> Result<i64, QuotaError> {
    if registry_max < 0 {
        return Err(QuotaError::InvalidRegistryMax(registry_max));
    }
    if requested < 0 {
        return Ok(registry_max);
    }
    if registry_max == UNLIMITED {
        return Ok(requested);
    }
    if requested == UNLIMITED {
        return Err(QuotaError::UnlimitedNotPermitted { max: registry_max });
    }
    if requested > registry_max {
        return Err(QuotaError::AboveRegistryMax {
            requested,
            max: registry_max,
        });
    }
    Ok(requested)
}

/// Check whether one more enrollment fits under `cap`.
///
/// # Errors
///
/// Returns `QuotaError::Exhausted` once `count` has reached a non-zero `cap`.
pub fn check_enrollment(count: i64, cap: i64) -> Result<(), QuotaError> {
    if cap != UNLIMITED && count >= cap {
        return Err(QuotaError::Exhausted { cap });
    }
    Ok(())
}
