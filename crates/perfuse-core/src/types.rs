/*!
 * Core data types for Perfuse.
 *
 * This module defines the fundamental domain primitives shared by the
 * device and engine crates.
 */
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// A unique identifier for Perfuse resources (sequence instances, runs)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id(String);

impl Id {
    /// Create a new ID with a random UUID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create an ID from a string
    pub fn from_string<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_string())
    }

    /// Get the string representation of the ID
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

impl From<Uuid> for Id {
    fn from(uuid: Uuid) -> Self {
        Self::from_string(uuid.to_string())
    }
}

/// Highest selector-valve port on the instrument manifold
pub const PORT_MAX: u8 = 24;

/// A fluidic port on the selector valve manifold
///
/// Ports are numbered from 1; port 0 is not addressable on the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct FluidicPort(u8);

impl FluidicPort {
    /// Create a port, validating it against the manifold range
    pub fn new(port: u8) -> Result<Self> {
        if port == 0 || port > PORT_MAX {
            return Err(Error::validation(format!(
                "Fluidic port {} out of range 1..={}",
                port, PORT_MAX
            )));
        }
        Ok(Self(port))
    }

    /// Get the raw port number
    pub fn get(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for FluidicPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port {}", self.0)
    }
}

impl TryFrom<u8> for FluidicPort {
    type Error = Error;

    fn try_from(port: u8) -> Result<Self> {
        Self::new(port)
    }
}

impl From<FluidicPort> for u8 {
    fn from(port: FluidicPort) -> Self {
        port.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_creation() {
        let id = Id::new();
        assert!(!id.as_str().is_empty());

        let id = Id::from_string("test-id");
        assert_eq!(id.as_str(), "test-id");

        let id: Id = "another-id".into();
        assert_eq!(id.as_str(), "another-id");
    }

    #[test]
    fn test_id_display() {
        let id = Id::from_string("test-id");
        assert_eq!(format!("{}", id), "test-id");
    }

    #[test]
    fn test_port_range() {
        assert!(FluidicPort::new(1).is_ok());
        assert!(FluidicPort::new(PORT_MAX).is_ok());
        assert!(FluidicPort::new(0).is_err());
        assert!(FluidicPort::new(PORT_MAX + 1).is_err());
    }

    #[test]
    fn test_port_conversions() {
        let port = FluidicPort::new(8).unwrap();
        assert_eq!(port.get(), 8);
        assert_eq!(u8::from(port), 8);

        let port: FluidicPort = 12u8.try_into().unwrap();
        assert_eq!(port.get(), 12);
        assert_eq!(format!("{}", port), "port 12");
    }
}
