use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Identity of one service node in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Datacenter / placement domain
    #[serde(default = "default_dc")]
    pub dc: String,
    /// Service name: "signal", "sfu" or "register"
    #[serde(default)]
    pub name: String,
    /// Globally unique node id
    #[serde(default)]
    pub id: String,
    /// Optional debug/health HTTP listen address
    pub debug_listen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    /// etcd endpoints
    #[serde(default = "default_etcd_endpoints")]
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL
    #[serde(default = "default_nats_url")]
    pub url: String,
}

/// WebSocket listener settings (signal only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to TLS certificate; TLS is off when absent
    pub cert: Option<String>,
    /// Path to TLS key
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// WebRTC engine settings (sfu only).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebRtcConfig {
    /// Ephemeral UDP port range, `[min, max]`; empty = unrestricted
    #[serde(default)]
    pub portrange: Vec<u16>,
    /// ICE servers handed to every peer connection
    #[serde(default)]
    pub iceserver: Vec<IceServerConfig>,
}

/// Optional Opus capture of published audio to an Ogg container (sfu only).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub open: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub etcd: EtcdConfig,
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SfuConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub etcd: EtcdConfig,
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub etcd: EtcdConfig,
    #[serde(default)]
    pub nats: NatsConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            dc: default_dc(),
            name: String::new(),
            id: String::new(),
            debug_listen: None,
        }
    }
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: default_etcd_endpoints(),
        }
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_bind(),
            port: default_port(),
            cert: None,
            key: None,
        }
    }
}

fn default_dc() -> String {
    "dc1".to_string()
}

fn default_etcd_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8443
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Load a TOML config file. A missing file yields the default configuration
/// so every service can start with zero setup against local etcd/NATS.
pub fn load_config<T: DeserializeOwned + Default>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let contents = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}

fn validate_common(
    node: &NodeConfig,
    etcd: &EtcdConfig,
    nats: &NatsConfig,
    expected_name: &str,
    issues: &mut Vec<String>,
) {
    if node.id.is_empty() {
        issues.push("ERROR: node.id must be set (globally unique)".to_string());
    }
    if node.dc.is_empty() {
        issues.push("ERROR: node.dc must be non-empty".to_string());
    }
    if node.name.is_empty() {
        issues.push(format!(
            "WARNING: node.name is empty, defaulting to '{expected_name}'"
        ));
    } else if node.name != expected_name {
        issues.push(format!(
            "ERROR: node.name is '{}' but this binary serves '{expected_name}'",
            node.name
        ));
    }
    if etcd.endpoints.is_empty() {
        issues.push("ERROR: etcd.endpoints must not be empty".to_string());
    }
    if nats.url.is_empty() {
        issues.push("ERROR: nats.url must not be empty".to_string());
    }
}

fn validate_portrange(portrange: &[u16], issues: &mut Vec<String>) {
    if portrange.is_empty() {
        return;
    }
    if portrange.len() != 2 {
        issues.push("ERROR: webrtc.portrange must be [min, max]".to_string());
        return;
    }
    if portrange[1] <= portrange[0] || portrange[1] - portrange[0] < 100 {
        issues.push(
            "ERROR: webrtc.portrange must be [min, max] with max - min >= 100".to_string(),
        );
    }
}

impl SignalConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();
        validate_common(&self.node, &self.etcd, &self.nats, "signal", &mut issues);
        if self.http.cert.is_some() != self.http.key.is_some() {
            issues.push("ERROR: http.cert and http.key must be set together".to_string());
        }
        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

impl SfuConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();
        validate_common(&self.node, &self.etcd, &self.nats, "sfu", &mut issues);
        validate_portrange(&self.webrtc.portrange, &mut issues);
        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

impl RegisterConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();
        validate_common(&self.node, &self.etcd, &self.nats, "register", &mut issues);
        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: SignalConfig = toml::from_str("").unwrap();
        assert_eq!(config.http.host, "0.0.0.0");
        assert_eq!(config.http.port, 8443);
        assert_eq!(config.etcd.endpoints, vec!["http://127.0.0.1:2379"]);
        assert_eq!(config.nats.url, "nats://127.0.0.1:4222");
        assert_eq!(config.node.dc, "dc1");

        let config: SfuConfig = toml::from_str("").unwrap();
        assert!(config.webrtc.portrange.is_empty());
        assert!(config.webrtc.iceserver.is_empty());
        assert!(!config.capture.open);
    }

    #[test]
    fn missing_node_id_is_an_error() {
        let config: RegisterConfig = toml::from_str("").unwrap();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("node.id")));
    }

    #[test]
    fn narrow_portrange_is_rejected() {
        let config: SfuConfig = toml::from_str(
            r#"
            [node]
            name = "sfu"
            id = "sfu-1"

            [webrtc]
            portrange = [50000, 50050]
            "#,
        )
        .unwrap();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("portrange")));
    }

    #[test]
    fn full_sfu_config_parses() {
        let config: SfuConfig = toml::from_str(
            r#"
            [node]
            dc = "eu-1"
            name = "sfu"
            id = "eu-1-sfu-1"

            [etcd]
            endpoints = ["http://etcd-0:2379", "http://etcd-1:2379"]

            [nats]
            url = "nats://nats-0:4222"

            [webrtc]
            portrange = [50000, 51000]

            [[webrtc.iceserver]]
            urls = ["stun:stun.l.google.com:19302"]

            [[webrtc.iceserver]]
            urls = ["turn:turn.example.com:3478"]
            username = "chorus"
            credential = "secret"

            [capture]
            open = true
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.webrtc.iceserver.len(), 2);
        assert_eq!(config.webrtc.iceserver[1].username, "chorus");
        assert!(config.capture.open);
    }

    #[test]
    fn mismatched_service_name_is_an_error() {
        let config: SignalConfig = toml::from_str(
            r#"
            [node]
            name = "sfu"
            id = "n1"
            "#,
        )
        .unwrap();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("this binary serves")));
    }
}
