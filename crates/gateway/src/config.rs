use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clawdis_protocol::DEFAULT_PORT;

/// Gateway process configuration, read once at startup.
///
/// The environment is the sole configuration surface at this layer:
/// - `CLAWDIS_GATEWAY_TOKEN` — optional shared secret required in `hello.auth`
/// - `CLAWDIS_VERSION` — version reported in `hello-ok.server` and self-presence
/// - `GIT_COMMIT` — optional commit reported in `hello-ok.server`
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub token: Option<String>,
    pub version: String,
    pub commit: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            token: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit: None,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            port: DEFAULT_PORT,
            token: non_empty_env("CLAWDIS_GATEWAY_TOKEN"),
            version: non_empty_env("CLAWDIS_VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            commit: non_empty_env("GIT_COMMIT"),
        }
    }

    /// The gateway binds loopback only; any other address is a bug.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.port)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_addr_is_loopback() {
        let config = GatewayConfig::default();
        assert!(config.bind_addr().ip().is_loopback());
        assert_eq!(config.bind_addr().port(), DEFAULT_PORT);
    }
}
