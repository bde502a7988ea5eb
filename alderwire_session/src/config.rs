// Endpoint configuration.
//
// All tunable runtime parameters live in `Config`, JSON-loadable and never
// mutated after the connection starts. In multiplayer every endpoint of a
// session must agree on the protocol identity fields (`app_id`,
// `session_id`, version bounds) — admission enforces the identifiers and
// the packet gate enforces the version floor.
//
// Defaults follow the wire protocol documentation; `validate()` is called
// by `Connection::start` so a bad config fails fast instead of producing a
// half-working endpoint.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use alderwire_protocol::types::{StringId, STRING_ID_MAX};

use crate::error::{Result, SessionError};

/// Which endpoint role this process plays in the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Authoritative server: owns admission and object allocation.
    Server,
    /// Regular client.
    Client,
    /// Client that requests the authority role from a relay.
    Host,
    /// Message broker between clients; never executes application RPCs.
    Relay,
}

impl Role {
    pub fn is_client_side(self) -> bool {
        matches!(self, Role::Client | Role::Host)
    }
}

/// Endpoint configuration. Construct with `Config::default()` and override
/// fields, or load from JSON.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub role: Role,
    /// Server/relay address. Clients connect to it; servers bind it.
    pub server_addr: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub max_clients: u32,
    /// When set, only these addresses pass admission (server/relay).
    pub whitelist: Option<Vec<IpAddr>>,
    /// Relay only: pre-declared host address. Until that address is
    /// admitted, all other admissions are rejected.
    pub host_addr: Option<IpAddr>,
    /// Relay only: whether the authority role survives the host leaving.
    pub migratable: bool,
    /// Relay only: shut down once the last client leaves. When false,
    /// `migratable` is forced on.
    pub shutdown_when_empty: bool,
    /// Milliseconds between admission request attempts (client).
    pub connection_request_rate: u64,
    /// Admission attempts before giving up (client).
    pub connection_request_limit: u32,
    /// Milliseconds a pending admission survives without its TCP handshake
    /// (server/relay).
    pub connection_request_timeout: u64,
    /// Fragmentation budget in bytes for outbound packets.
    pub buffer_size: usize,
    pub protocol_version: u16,
    /// Packets below this protocol version are dropped at the buffer
    /// boundary (stream transport additionally drops the connection).
    pub min_protocol_version: u16,
    pub app_version: u16,
    pub min_app_version: u16,
    /// Application identifier, at most 64 ASCII bytes.
    pub app_id: String,
    /// Session identifier, at most 64 ASCII bytes.
    pub session_id: String,
    /// Install bandwidth recorder transform steps.
    pub measure_bandwidth: bool,
    /// Install the Huffman compression transform step.
    pub use_compression: bool,
    /// Run socket I/O on a dedicated worker thread.
    pub threaded: bool,
    /// Worker iteration pacing in milliseconds.
    pub thread_update_delta: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            role: Role::Client,
            server_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tcp_port: 8000,
            udp_port: 9000,
            max_clients: 4,
            whitelist: None,
            host_addr: None,
            migratable: false,
            shutdown_when_empty: true,
            connection_request_rate: 5000,
            connection_request_limit: 10,
            connection_request_timeout: 20_000,
            buffer_size: 2048,
            protocol_version: 1,
            min_protocol_version: 1,
            app_version: 1,
            min_app_version: 1,
            app_id: String::from("alderwire"),
            session_id: String::from("default"),
            measure_bandwidth: false,
            use_compression: true,
            threaded: true,
            thread_update_delta: 40,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Config> {
        let config: Config =
            serde_json::from_str(json).map_err(|e| SessionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| SessionError::Config(e.to_string()))
    }

    /// Reject configurations the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.max_clients == 0 {
            return Err(SessionError::Config("max_clients must be at least 1".into()));
        }
        if self.buffer_size < 64 {
            return Err(SessionError::Config(
                "buffer_size must be at least 64 bytes".into(),
            ));
        }
        if self.min_protocol_version > self.protocol_version {
            return Err(SessionError::Config(
                "min_protocol_version exceeds protocol_version".into(),
            ));
        }
        if self.min_app_version > self.app_version {
            return Err(SessionError::Config(
                "min_app_version exceeds app_version".into(),
            ));
        }
        for (name, value) in [("app_id", &self.app_id), ("session_id", &self.session_id)] {
            if value.len() > STRING_ID_MAX || !value.is_ascii() {
                return Err(SessionError::Config(format!(
                    "{name} must be at most {STRING_ID_MAX} ASCII bytes"
                )));
            }
        }
        // Port 0 asks the OS for an ephemeral port, so two zeros cannot
        // collide.
        if self.tcp_port != 0 && self.tcp_port == self.udp_port {
            return Err(SessionError::Config(
                "tcp_port and udp_port must differ".into(),
            ));
        }
        if self.connection_request_limit == 0 {
            return Err(SessionError::Config(
                "connection_request_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// `shutdown_when_empty = false` only makes sense if the session can
    /// outlive its host.
    pub fn effective_migratable(&self) -> bool {
        self.migratable || !self.shutdown_when_empty
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server_addr, self.tcp_port)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server_addr, self.udp_port)
    }

    pub fn request_rate(&self) -> Duration {
        Duration::from_millis(self.connection_request_rate)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_request_timeout)
    }

    pub fn update_delta(&self) -> Duration {
        Duration::from_millis(self.thread_update_delta)
    }

    pub(crate) fn app_string_id(&self) -> Result<StringId> {
        StringId::new(&self.app_id).map_err(SessionError::Wire)
    }

    pub(crate) fn session_string_id(&self) -> Result<StringId> {
        StringId::new(&self.session_id).map_err(SessionError::Wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn json_roundtrip() {
        let mut config = Config::default();
        config.role = Role::Relay;
        config.max_clients = 16;
        config.migratable = true;
        let json = config.to_json().unwrap();
        let back = Config::from_json(&json).unwrap();
        assert_eq!(back.role, Role::Relay);
        assert_eq!(back.max_clients, 16);
        assert!(back.migratable);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = Config::default();
        config.max_clients = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.buffer_size = 16;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.app_id = "x".repeat(65);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.min_protocol_version = 9;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.udp_port = config.tcp_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_relay_must_be_migratable() {
        let mut config = Config::default();
        config.shutdown_when_empty = false;
        config.migratable = false;
        assert!(config.effective_migratable());

        config.shutdown_when_empty = true;
        assert!(!config.effective_migratable());
        config.migratable = true;
        assert!(config.effective_migratable());
    }
}
