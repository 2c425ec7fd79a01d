//! Device identity provider
//!
//! Key generation and on-disk persistence of the identity live outside the
//! core; the protocol only needs a stable id and a display name at startup.

use uuid::Uuid;

/// Contract for the external device-identity provider.
pub trait DeviceIdentity: Send + Sync {
    /// Stable identifier for this device, unique across the peer network.
    fn device_id(&self) -> &str;

    /// Human-readable name shown to remote peers.
    fn display_name(&self) -> &str;
}

/// Identity backed by plain strings, resolved once at startup.
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    id: String,
    name: String,
}

impl StaticIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Create an identity with a freshly generated device id.
    pub fn generate(name: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), name)
    }
}

impl DeviceIdentity for StaticIdentity {
    fn device_id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_identity() {
        let identity = StaticIdentity::new("dev-1", "Workstation");
        assert_eq!(identity.device_id(), "dev-1");
        assert_eq!(identity.display_name(), "Workstation");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = StaticIdentity::generate("A");
        let b = StaticIdentity::generate("B");
        assert_ne!(a.device_id(), b.device_id());
        assert!(Uuid::parse_str(a.device_id()).is_ok());
    }
}
