mod color;
mod light;
mod range;

pub use color::{Color, ParseColorError, NAMED_COLORS};
pub use light::Light;
pub use range::{check_range, check_unit, RangeError};
