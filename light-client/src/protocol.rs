use std::fmt;

use boblight_model::{check_range, check_unit, Color, Light, RangeError};

use crate::LightClientError;

pub const MAX_PRIORITY: u16 = 256;

/// A single line sent to the server.
#[derive(Clone, Debug, PartialEq)]
pub enum Command<'a> {
    Hello,
    GetVersion,
    GetLights,
    SetPriority(u16),
    SetColor { light: &'a str, color: Color },
    SetSpeed { light: &'a str, speed: f64 },
    SetInterpolation { light: &'a str, value: f64 },
    Sync,
    Ping,
}

/// What the server is expected to send back for a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseShape {
    SingleLine,
    /// `lights <N>` followed by N `light <name> ...` lines.
    LightEnumeration,
}

#[derive(Debug, PartialEq)]
pub enum Response {
    Line(String),
    Lights(Vec<Light>),
}

impl Command<'_> {
    /// Checks numeric payloads against the ranges the server accepts.
    pub fn validate(&self) -> Result<(), RangeError> {
        match self {
            Command::SetPriority(priority) => {
                check_range("Priority", *priority as f64, 0.0, MAX_PRIORITY as f64)?;
            }
            Command::SetColor { color, .. } => color.validate()?,
            Command::SetSpeed { speed, .. } => {
                check_unit("Speed", *speed)?;
            }
            Command::SetInterpolation { value, .. } => {
                check_unit("Interpolation", *value)?;
            }
            Command::Hello | Command::GetVersion | Command::GetLights | Command::Sync | Command::Ping => {}
        }
        Ok(())
    }

    /// `None` for commands the server never acknowledges.
    pub fn response_shape(&self) -> Option<ResponseShape> {
        match self {
            Command::Hello | Command::GetVersion => Some(ResponseShape::SingleLine),
            Command::GetLights => Some(ResponseShape::LightEnumeration),
            _ => None,
        }
    }
}

impl fmt::Display for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::Hello => write!(f, "hello"),
            Command::GetVersion => write!(f, "get version"),
            Command::GetLights => write!(f, "get lights"),
            Command::SetPriority(priority) => write!(f, "set priority {priority}"),
            Command::SetColor { light, color } => {
                write!(f, "set light {light} rgb {} {} {}", color.r, color.g, color.b)
            }
            Command::SetSpeed { light, speed } => write!(f, "set light {light} speed {speed}"),
            Command::SetInterpolation { light, value } => {
                write!(f, "set light {light} interpolation {value}")
            }
            Command::Sync => write!(f, "sync"),
            Command::Ping => write!(f, "ping"),
        }
    }
}

impl Response {
    pub fn into_line(self) -> Result<String, LightClientError> {
        match self {
            Response::Line(line) => Ok(line),
            Response::Lights(_) => Err(LightClientError::Protocol {
                reason: "expected a single line, got a light list".into(),
            }),
        }
    }

    pub fn into_lights(self) -> Result<Vec<Light>, LightClientError> {
        match self {
            Response::Lights(lights) => Ok(lights),
            Response::Line(line) => Err(LightClientError::Protocol {
                reason: format!("expected a light list, got {line:?}"),
            }),
        }
    }
}

const MAX_PREALLOCATED_LIGHTS: usize = 256;

/// Collects the lines of a `get lights` response.
#[derive(Debug, Default)]
pub(crate) struct LightEnumeration {
    expected: Option<usize>,
    lights: Vec<Light>,
}

impl LightEnumeration {
    /// Returns the discovered lights once the announced number of them has
    /// been received.
    pub fn feed(&mut self, line: &str) -> Result<Option<Vec<Light>>, LightClientError> {
        match self.expected {
            None => {
                let count = parse_light_count(line)?;
                self.expected = Some(count);
                // the count comes off the wire, don't let it size the allocation
                self.lights.reserve(count.min(MAX_PREALLOCATED_LIGHTS));
            }
            Some(_) => self.lights.push(parse_light(line)?),
        }

        if self.expected == Some(self.lights.len()) {
            Ok(Some(std::mem::take(&mut self.lights)))
        } else {
            Ok(None)
        }
    }
}

fn parse_light_count(line: &str) -> Result<usize, LightClientError> {
    let mut words = line.split_whitespace();
    match (words.next(), words.next()) {
        (Some("lights"), Some(count)) => {
            count
                .parse()
                .map_err(|e| LightClientError::Protocol {
                    reason: format!("invalid light count {count:?}: {e}"),
                })
        }
        _ => Err(LightClientError::Protocol {
            reason: format!("expected `lights <N>`, got {line:?}"),
        }),
    }
}

fn parse_light(line: &str) -> Result<Light, LightClientError> {
    let mut words = line.split_whitespace();
    match (words.next(), words.next()) {
        (Some("light"), Some(name)) => Ok(Light::new(name)),
        _ => Err(LightClientError::Protocol {
            reason: format!("expected `light <name> ...`, got {line:?}"),
        }),
    }
}
