// Local crates
use crate::source::simulated::MAX_RATE_HZ;

// External crates
use anyhow::{Context, Result, bail};
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::instrument;

/// Prefix for environment overrides, e.g. `BRIDGE__DATA__BIND_ADDR`.
pub const ENV_PREFIX: &str = "BRIDGE";

/// Complete bridge configuration. Every field has a default, so an empty
/// file is a valid configuration.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Data output port.
    pub data: DataConfig,
    /// Control port.
    pub control: ControlConfig,
    /// Upstream notification source.
    pub source: SourceConfig,
    /// Teardown bounds.
    pub shutdown: ShutdownConfig,
    /// Prometheus endpoint.
    pub metrics: MetricsConfig,
    /// Tracing output.
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and parse the configuration file, applying environment overrides
    #[instrument(
        name = "config_loader",
        target = "helpers::load_config",
        level = "trace",
        skip_all
    )]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        tracing::trace!(
            configuration_file_path = %path_ref.display(),
            "Loading bridge configuration file"
        );

        let settings = config::Config::builder()
            .add_source(File::from(path_ref).format(FileFormat::Toml))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build();

        let settings = match settings {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read configuration file");
                return Err(e)
                    .with_context(|| format!("Failed to read config file at {:?}", path_ref));
            }
        };

        let config: Config = match settings.try_deserialize() {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::error!(error = %e, "Failed to parse TOML configuration");
                return Err(e)
                    .with_context(|| format!("Failed to parse TOML from {:?}", path_ref));
            }
        };

        config.validate()?;

        tracing::trace!(configuration_file_path = %path_ref.display(), "Bridge configuration file loaded successfully");
        Ok(config)
    }

    /// Parse configuration from an in-memory TOML document, without
    /// environment overrides.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .context("Failed to read TOML configuration")?
            .try_deserialize()
            .context("Failed to parse TOML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that deserialize fine but cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.source.kind == SourceKind::Tcp && self.source.addr.is_none() {
            bail!("[source] kind = \"tcp\" requires an `addr`");
        }
        if self.source.kind == SourceKind::Simulated
            && !(1..=MAX_RATE_HZ).contains(&self.source.rate_hz)
        {
            bail!("[source] rate_hz must be between 1 and {MAX_RATE_HZ}");
        }
        if self.source.read_chunk_size == 0 {
            bail!("[source] read_chunk_size must be greater than zero");
        }
        if self.data.sink_queue_capacity == 0 {
            bail!("[data] sink_queue_capacity must be greater than zero");
        }
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration as TOML")
    }
}

/// `[data]`: where consumers connect.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DataConfig {
    /// Listen address for the payload stream.
    pub bind_addr: String,
    /// Undelivered payloads a consumer may lag behind before it is dropped.
    pub sink_queue_capacity: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:12345".into(),
            sink_queue_capacity: 1024,
        }
    }
}

/// `[control]`: the one-line command port.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ControlConfig {
    /// Listen address for control commands.
    pub bind_addr: String,
    /// How long a client has to send its command line.
    pub read_timeout_ms: u64,
}

impl ControlConfig {
    /// `read_timeout_ms` as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:12346".into(),
            read_timeout_ms: 5_000,
        }
    }
}

/// Which upstream adapter to open.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// No upstream; the bridge serves consumers and waits for shutdown.
    None,
    /// Raw frame bytes read from a TCP endpoint.
    Tcp,
    /// Locally generated frames, for running without hardware.
    Simulated,
}

/// `[source]`: the upstream notification source.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SourceConfig {
    /// Adapter to open at startup.
    pub kind: SourceKind,
    /// `host:port` of the upstream, for `kind = "tcp"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    /// Bound on opening the upstream link.
    pub connect_timeout_ms: u64,
    /// Largest chunk read from the upstream at once.
    pub read_chunk_size: usize,
    /// Bound on stopping notifications and on disconnecting.
    pub disconnect_timeout_ms: u64,
    /// Frame rate of the simulated source, 1 to `MAX_RATE_HZ`.
    pub rate_hz: u32,
}

impl SourceConfig {
    /// `connect_timeout_ms` as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `disconnect_timeout_ms` as a [`Duration`].
    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::None,
            addr: None,
            connect_timeout_ms: 10_000,
            read_chunk_size: 512,
            disconnect_timeout_ms: 5_000,
            rate_hz: 100,
        }
    }
}

/// `[shutdown]`
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Upper bound on waiting for connection tasks during teardown.
    pub drain_timeout_ms: u64,
}

impl ShutdownConfig {
    /// `drain_timeout_ms` as a [`Duration`].
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 5_000,
        }
    }
}

/// `[metrics]`: optional Prometheus endpoint.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve `/metrics` while the bridge runs.
    pub enabled: bool,
    /// Listen address for `/metrics`.
    pub bind_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: "127.0.0.1:9000".into(),
        }
    }
}

/// `[logging]`
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human readable output.
    pub json: bool,
    /// When set, logs are also written to a daily rolling file here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            directory: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = Config::from_toml_str("").unwrap();

        assert_eq!(cfg.data.bind_addr, "127.0.0.1:12345");
        assert_eq!(cfg.control.bind_addr, "127.0.0.1:12346");
        assert_eq!(cfg.source.kind, SourceKind::None);
        assert_eq!(cfg.source.disconnect_timeout(), Duration::from_secs(5));
        assert!(!cfg.metrics.enabled);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = Config::from_toml_str(
            r#"
            [source]
            kind = "tcp"
            addr = "192.168.4.1:7000"
            disconnect_timeout_ms = 250

            [control]
            bind_addr = "0.0.0.0:0"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.source.kind, SourceKind::Tcp);
        assert_eq!(cfg.source.addr.as_deref(), Some("192.168.4.1:7000"));
        assert_eq!(cfg.source.disconnect_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.source.read_chunk_size, 512);
        assert_eq!(cfg.control.bind_addr, "0.0.0.0:0");
        assert_eq!(cfg.control.read_timeout_ms, 5_000);
    }

    #[test]
    fn tcp_source_requires_addr() {
        let err = Config::from_toml_str("[source]\nkind = \"tcp\"\n").unwrap_err();
        assert!(err.to_string().contains("addr"));
    }

    #[test]
    fn unknown_source_kind_is_rejected() {
        assert!(Config::from_toml_str("[source]\nkind = \"bluetooth\"\n").is_err());
    }

    #[test]
    fn renders_back_to_toml() {
        let rendered = Config::default().to_toml().unwrap();
        assert!(rendered.contains("[data]"));
        assert!(rendered.contains("bind_addr = \"127.0.0.1:12345\""));
        assert!(Config::from_toml_str(&rendered).is_ok());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let path = std::env::temp_dir().join(format!(
            "telemetry-bridge-config-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[data]\nsink_queue_capacity = 8\n").unwrap();

        let cfg = Config::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(cfg.data.sink_queue_capacity, 8);
    }

    #[test]
    fn shipped_config_is_valid() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/telemetry-bridge.toml");
        let cfg = Config::from_toml_str(&std::fs::read_to_string(path).unwrap()).unwrap();

        assert_eq!(cfg.source.kind, SourceKind::Simulated);
        assert_eq!(cfg.source.rate_hz, 100);
    }

    #[test]
    fn simulated_source_needs_a_rate() {
        let err = Config::from_toml_str("[source]\nkind = \"simulated\"\nrate_hz = 0\n").unwrap_err();
        assert!(err.to_string().contains("rate_hz"));
    }

    #[test]
    fn simulated_rate_is_capped() {
        let err = Config::from_toml_str("[source]\nkind = \"simulated\"\nrate_hz = 2000000000\n")
            .unwrap_err();
        assert!(err.to_string().contains("rate_hz"));

        let cfg = Config::from_toml_str(&format!(
            "[source]\nkind = \"simulated\"\nrate_hz = {MAX_RATE_HZ}\n"
        ))
        .unwrap();
        assert_eq!(cfg.source.rate_hz, MAX_RATE_HZ);
    }

    #[test]
    fn load_missing_file_fails() {
        assert!(Config::load("/definitely/not/here/bridge.toml").is_err());
    }
}
