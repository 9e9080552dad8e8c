//! Listening port value object.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Port used when none is configured or the configured one is invalid.
pub const DEFAULT_PORT: u16 = 5000;

/// Lowest port accepted from configuration (well-known ports are excluded).
pub const MIN_PORT: u16 = 1024;

/// Highest port accepted from configuration.
pub const MAX_PORT: u16 = 65535;

/// A validated listening port in `MIN_PORT..=MAX_PORT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Port(u16);

impl Port {
    /// Creates a port, rejecting values below `MIN_PORT`.
    pub fn new(value: u16) -> DomainResult<Self> {
        if value < MIN_PORT {
            return Err(DomainError::InvalidPort {
                value: value.to_string(),
                min: MIN_PORT,
                max: MAX_PORT,
            });
        }
        Ok(Self(value))
    }

    /// Parses a port override, falling back to `DEFAULT_PORT` when the
    /// value is missing, unparsable or out of range.
    #[must_use]
    pub fn parse_or_default(value: Option<&str>) -> Self {
        value
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or_default()
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl Default for Port {
    fn default() -> Self {
        Self(DEFAULT_PORT)
    }
}

impl FromStr for Port {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u16 = s.trim().parse().map_err(|_| DomainError::InvalidPort {
            value: s.to_string(),
            min: MIN_PORT,
            max: MAX_PORT,
        })?;
        Self::new(value)
    }
}

impl TryFrom<u16> for Port {
    type Error = DomainError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Port> for u16 {
    fn from(port: Port) -> Self {
        port.0
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
