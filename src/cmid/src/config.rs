use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use cmi::config::CmiConfig;
use cmi_transport_tcp::TcpTransportConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    pub prefix: PathBuf,
    pub path: PathBuf,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            prefix: PathBuf::from("/tmp/cmi"),
            path: PathBuf::from("control.sock"),
        }
    }
}

impl ControlConfig {
    #[inline]
    pub fn socket_path(&self) -> PathBuf {
        self.prefix.join(&self.path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TracingConfig {
    pub enable: bool,
    pub min_event_level: String,
    pub max_event_level: String,
    pub span_level: String,
    pub output_dir: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        TracingConfig {
            enable: false,
            min_event_level: "trace".to_string(),
            max_event_level: "info".to_string(),
            span_level: "off".to_string(),
            output_dir: "/tmp/cmi-trace".to_string(),
        }
    }
}

/// Geometry of the in-memory volume this node serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VolumeConfig {
    pub block_size: u32,
    pub blocks: u64,
    pub workers: usize,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        VolumeConfig {
            block_size: 512,
            blocks: 1 << 21,
            workers: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub log_level: String,
    pub tracing: TracingConfig,
    pub control: ControlConfig,
    pub cmi: CmiConfig,
    pub transport: TcpTransportConfig,
    pub volume: VolumeConfig,
}

impl Config {
    pub fn new(config: Option<&str>) -> anyhow::Result<Self> {
        let mut config: Config = toml::from_str(config.unwrap_or(""))?;
        if config.log_level.is_empty() {
            config.log_level = "info".to_string();
        }
        config.cmi.validate()?;
        config.transport.validate()?;
        anyhow::ensure!(
            config.volume.block_size > 0 && config.volume.blocks > 0,
            "volume geometry must be non-empty"
        );
        anyhow::ensure!(config.volume.workers > 0, "volume needs at least one worker");
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::new(Some(&content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmi::SpId;

    #[test]
    fn shipped_configs_pair_up() {
        let a = Config::new(Some(include_str!("../cmi-a.toml"))).unwrap();
        let b = Config::new(Some(include_str!("../cmi-b.toml"))).unwrap();
        assert_eq!(a.cmi.sp, SpId::A);
        assert_eq!(b.cmi.sp, SpId::B);
        assert_eq!(a.cmi.pools, b.cmi.pools);
        assert_eq!(a.transport.listen.map(|l| l.port()), b.transport.peer.map(|p| p.port()));
        assert_ne!(a.control.socket_path(), b.control.socket_path());
    }

    #[test]
    fn full_config() {
        let config = Config::new(Some(
            r#"
            log_level = "debug"

            [control]
            prefix = "/tmp/cmi-b"

            [cmi]
            sp = "B"
            io_conduits = 8

            [cmi.negotiation]
            handshake_retry_ms = 200

            [transport]
            peer = "192.168.1.10:7100"
            heartbeat_ms = 100

            [volume]
            blocks = 4096
            "#,
        ))
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.cmi.sp, SpId::B);
        assert_eq!(config.cmi.io_conduits, 8);
        assert_eq!(config.cmi.negotiation.handshake_retry_ms, 200);
        assert_eq!(config.transport.heartbeat_ms, 100);
        assert_eq!(config.volume.blocks, 4096);
        assert_eq!(config.volume.block_size, 512);
        assert_eq!(
            config.control.socket_path(),
            PathBuf::from("/tmp/cmi-b/control.sock")
        );
        assert!(!config.tracing.enable);
    }

    #[test]
    fn transport_endpoint_is_required() {
        assert!(Config::new(None).is_err());
        assert!(Config::new(Some("[transport]\nlisten = \"0.0.0.0:7100\"\n")).is_ok());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let res = Config::new(Some("[transport]\nlisten = \"0.0.0.0:7100\"\n[volume]\nsize = 1\n"));
        assert!(res.is_err());
    }
}
