use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_PROGRAM: &str = "intel_gpu_top";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            producer: ProducerConfig::default(),
        }
    }
}

impl ExporterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.producer.program.trim().is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub bind: IpAddr,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
        }
    }
}

impl ListenConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Command that emits the CSV feed on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            args: vec!["-c".to_string()],
        }
    }
}
