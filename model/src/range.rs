use thiserror::Error;

/// A numeric payload outside of the range the protocol accepts for it.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{what} must be between {min} and {max} but was {value}")]
pub struct RangeError {
    pub what: &'static str,
    pub min: f64,
    pub max: f64,
    pub value: f64,
}

/// Checks that `value` lies within `[min, max]`. NaN is always rejected.
pub fn check_range(what: &'static str, value: f64, min: f64, max: f64) -> Result<f64, RangeError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(RangeError {
            what,
            min,
            max,
            value,
        })
    }
}

pub fn check_unit(what: &'static str, value: f64) -> Result<f64, RangeError> {
    check_range(what, value, 0.0, 1.0)
}
