use serde::{Deserialize, Serialize};

use crate::Color;

/// A light exposed by the server.
///
/// The name is assigned by the server and stays the same for the lifetime of
/// a session. The color is only what this client last sent, it is never read
/// back from the server.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Light {
    name: String,
    color: Option<Color>,
}

impl Light {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn color(&self) -> Option<Color> {
        self.color
    }

    pub fn with_color(mut self, color: Color) -> Self {
        self.color = Some(color);
        self
    }

    pub fn set_color(&mut self, color: Color) {
        self.color = Some(color);
    }
}
