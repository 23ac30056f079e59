//! Port identity.
//!
//! Descriptors are plain values: they borrow nothing from the backend that
//! produced them and may be stored indefinitely. Two descriptors address the
//! same endpoint when they agree on the owning client handle, the numeric
//! port id and the port name.

use serde::{Deserialize, Serialize};

/// Which way a port faces, from the daemon's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    In,
    Out,
}

/// A stable address for a MIDI endpoint.
///
/// `client` is an opaque handle identifying the connection that enumerated
/// the port (used to recognise "same connection"); `port` is a
/// backend-specific numeric id. Text fields are UTF-8 and purely
/// informational except for `port_name`, which participates in equality.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub client: u64,
    pub port: u32,
    pub manufacturer: String,
    pub device_name: String,
    pub port_name: String,
    pub display_name: String,
}

impl PartialEq for PortDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.client == other.client
            && self.port == other.port
            && self.port_name == other.port_name
    }
}

impl Eq for PortDescriptor {}

impl std::hash::Hash for PortDescriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.client.hash(state);
        self.port.hash(state);
        self.port_name.hash(state);
    }
}

impl std::fmt::Display for PortDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.display_name.is_empty() {
            write!(f, "{}", self.port_name)
        } else {
            write!(f, "{}", self.display_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(client: u64, port: u32, name: &str) -> PortDescriptor {
        PortDescriptor {
            client,
            port,
            port_name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_equality_ignores_display_fields() {
        let mut a = descriptor(1, 7, "capture_1");
        let mut b = descriptor(1, 7, "capture_1");
        a.display_name = "Nord Lead".to_string();
        b.display_name = "nord-lead alias".to_string();
        b.manufacturer = "Clavia".to_string();
        assert_eq!(a, b);
    }

    #[test]
    fn test_equality_requires_same_connection() {
        let a = descriptor(1, 7, "capture_1");
        let b = descriptor(2, 7, "capture_1");
        assert_ne!(a, b);
    }

    #[test]
    fn test_serde_roundtrip() {
        let d = PortDescriptor {
            client: 42,
            port: 3,
            manufacturer: "".to_string(),
            device_name: "JD-Xi".to_string(),
            port_name: "JD-Xi MIDI 1".to_string(),
            display_name: "JD-Xi".to_string(),
        };
        let json = serde_json::to_string(&d).unwrap();
        let back: PortDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
        assert_eq!(back.device_name, "JD-Xi");
    }
}
