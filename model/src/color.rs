use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::range::{check_unit, RangeError};

/// An RGB color with channels in the 0.0 to 1.0 range.
///
/// Channels are not checked on construction. The range is enforced when the
/// color is sent to the server, see [`Color::validate`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Color {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

/// Colors that can be referred to by name, e.g. on the command line.
pub const NAMED_COLORS: &[(&str, Color)] = &[
    ("red", Color::rgb(1.0, 0.0, 0.0)),
    ("green", Color::rgb(0.0, 1.0, 0.0)),
    ("blue", Color::rgb(0.0, 0.0, 1.0)),
    ("yellow", Color::rgb(1.0, 1.0, 0.0)),
    ("teal", Color::rgb(0.0, 1.0, 1.0)),
    ("magenta", Color::rgb(1.0, 0.0, 1.0)),
    ("orange", Color::rgb(0.878, 0.415, 0.0)),
    ("white", Color::rgb(1.0, 1.0, 1.0)),
    ("off", Color::rgb(0.0, 0.0, 0.0)),
];

impl Color {
    /// Produces a color with given RGB values. The values range from 0.0 to 1.0.
    pub const fn rgb(r: f64, g: f64, b: f64) -> Self {
        Self { r, g, b }
    }

    /// Produces a gray of the given brightness, where 0.0 is black and 1.0 is white.
    pub const fn gray(brightness: f64) -> Self {
        Self::rgb(brightness, brightness, brightness)
    }

    pub const fn black() -> Self {
        Self::gray(0.0)
    }

    pub const fn white() -> Self {
        Self::gray(1.0)
    }

    /// Looks up one of the [`NAMED_COLORS`], ignoring case.
    pub fn named(name: &str) -> Option<Self> {
        NAMED_COLORS
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, color)| *color)
    }

    /// Checks that every channel lies within the 0.0 to 1.0 range.
    pub fn validate(&self) -> Result<(), RangeError> {
        check_unit("Color red", self.r)?;
        check_unit("Color green", self.g)?;
        check_unit("Color blue", self.b)?;
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseColorError {
    #[error("unknown color name: {0}")]
    UnknownName(String),

    #[error("malformed color triple: {reason}")]
    MalformedTriple { reason: String },
}

impl FromStr for Color {
    type Err = ParseColorError;

    /// Parses either a color name or a comma separated `r,g,b` triple.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if !s.contains(',') {
            return Self::named(s).ok_or_else(|| ParseColorError::UnknownName(s.to_owned()));
        }

        let channels = s
            .split(',')
            .map(|c| {
                c.trim()
                    .parse::<f64>()
                    .map_err(|e| ParseColorError::MalformedTriple {
                        reason: format!("{c:?}: {e}"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        match channels[..] {
            [r, g, b] => Ok(Self::rgb(r, g, b)),
            _ => Err(ParseColorError::MalformedTriple {
                reason: format!("expected 3 channels, got {}", channels.len()),
            }),
        }
    }
}
