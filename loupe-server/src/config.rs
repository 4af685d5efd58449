// Server configuration
//
// Read from the JSON file named by the first command-line argument, or by
// `LOUPE_CONFIG`. Missing fields take their defaults.

use anyhow::{Context, Result};
use loupe_core::DebuggerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CONFIG_ENV: &str = "LOUPE_CONFIG";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    #[default]
    Stdio,
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: Transport,
    /// Address for the tcp transport.
    pub listen: String,
    /// Keep serving after a client disconnects and admit concurrent clients.
    pub accept_multi_client: bool,
    pub program: String,
    pub args: Vec<String>,
    pub debugger: DebuggerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Stdio,
            listen: "127.0.0.1:4040".to_string(),
            accept_multi_client: false,
            program: String::new(),
            args: Vec::new(),
            debugger: DebuggerConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: ServerConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Locate the configuration from argv, then the environment.
    pub fn load(arg: Option<String>) -> Result<Self> {
        let path = arg
            .or_else(|| std::env::var(CONFIG_ENV).ok())
            .with_context(|| format!("usage: loupe <config.json> (or set {})", CONFIG_ENV))?;
        Self::from_file(Path::new(&path))
    }

    fn validate(&self) -> Result<()> {
        if self.program.is_empty() {
            anyhow::bail!("config: program is required");
        }
        if self.transport == Transport::Tcp && self.listen.is_empty() {
            anyhow::bail!("config: listen address is required for the tcp transport");
        }
        if self.transport == Transport::Stdio && self.accept_multi_client {
            anyhow::bail!("config: accept_multi_client requires the tcp transport");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let file = write_config(r#"{"program": "/src/prog.json"}"#);
        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.transport, Transport::Stdio);
        assert!(!config.accept_multi_client);
        assert!(config.args.is_empty());
        assert!(!config.debugger.follow_exec);
    }

    #[test]
    fn test_full_config() {
        let file = write_config(
            r#"{
                "transport": "tcp",
                "listen": "127.0.0.1:0",
                "accept_multi_client": true,
                "program": "/src/prog.json",
                "args": ["-v"],
                "debugger": {
                    "follow_exec": true,
                    "follow_exec_regex": "worker",
                    "record": true,
                    "substitute_path": [{"from": "/build", "to": "/src"}]
                }
            }"#,
        );
        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.transport, Transport::Tcp);
        assert!(config.accept_multi_client);
        assert_eq!(config.args, vec!["-v"]);
        assert!(config.debugger.record);
        assert_eq!(config.debugger.follow_exec_regex.as_deref(), Some("worker"));
        assert_eq!(config.debugger.substitute_path.len(), 1);
    }

    #[test]
    fn test_program_required() {
        let file = write_config(r#"{"transport": "stdio"}"#);
        let err = ServerConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("program is required"));
    }

    #[test]
    fn test_multi_client_needs_tcp() {
        let file = write_config(r#"{"program": "p", "accept_multi_client": true}"#);
        let err = ServerConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("tcp"));
    }

    #[test]
    fn test_unknown_transport_rejected() {
        let file = write_config(r#"{"program": "p", "transport": "udp"}"#);
        assert!(ServerConfig::from_file(file.path()).is_err());
    }
}
