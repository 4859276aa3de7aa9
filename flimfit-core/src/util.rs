//! Numeric conversion helpers.
//!
//! These functions make the precision loss of count and index conversions
//! explicit in one place.

/// Convert usize to f64 with allowed precision loss.
#[inline]
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn usize_to_f64(value: usize) -> f64 {
    value as f64
}

/// Convert u64 to f64 with allowed precision loss.
#[inline]
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn u64_to_f64(value: u64) -> f64 {
    value as f64
}

/// Round a non-negative value to the nearest u32, saturating at the bounds.
///
/// Non-finite or negative values map to zero.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn f64_to_count(value: f64) -> u32 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    value.round().min(f64::from(u32::MAX)) as u32
}
