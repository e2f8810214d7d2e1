//! Server and registry configuration.

use std::time::Duration;

/// Limits applied by the [`DocRegistry`](crate::registry::DocRegistry).
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Broadcast queue length per room; a slower peer lags and is resynced.
    pub broadcast_capacity: usize,
    /// Maximum live rooms (None = unlimited)
    pub max_rooms: Option<usize>,
    /// Maximum sessions per room
    pub max_connections_per_room: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            max_rooms: None,
            max_connections_per_room: 100,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Maximum live rooms (None = unlimited)
    pub max_rooms: Option<usize>,
    /// Maximum peers per room
    pub max_connections_per_room: usize,
    /// Largest inbound frame accepted, in bytes
    pub max_message_size: usize,
    /// Presence not renewed for this long is removed (0 = never)
    pub awareness_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            broadcast_capacity: 256,
            max_rooms: None,
            max_connections_per_room: 100,
            max_message_size: 16 * 1024 * 1024,
            awareness_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            broadcast_capacity: self.broadcast_capacity,
            max_rooms: self.max_rooms,
            max_connections_per_room: self.max_connections_per_room,
        }
    }

    pub fn awareness_timeout(&self) -> Option<Duration> {
        (self.awareness_timeout_secs > 0).then(|| Duration::from_secs(self.awareness_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:1234");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.max_connections_per_room, 100);
        assert!(config.max_rooms.is_none());
        assert_eq!(config.awareness_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_registry_config_follows_server_config() {
        let config = ServerConfig {
            broadcast_capacity: 8,
            max_rooms: Some(3),
            max_connections_per_room: 2,
            ..ServerConfig::default()
        };
        let registry = config.registry_config();
        assert_eq!(registry.broadcast_capacity, 8);
        assert_eq!(registry.max_rooms, Some(3));
        assert_eq!(registry.max_connections_per_room, 2);
    }

    #[test]
    fn test_awareness_sweep_disabled() {
        let config = ServerConfig {
            awareness_timeout_secs: 0,
            ..ServerConfig::default()
        };
        assert!(config.awareness_timeout().is_none());
    }
}
