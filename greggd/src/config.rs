use config::{Config, File, FileFormat};
use greggd_common::ProgramSpec;
use std::env;
use std::time::Duration;

#[derive(Debug, Default, Clone, serde_derive::Deserialize, PartialEq, Eq)]
pub(crate) struct GreggdLogEntry {
    pub enable: bool,
    pub target: String,
    pub directory: Option<String>,
    pub prefix: Option<String>,
    pub rotation: Option<String>,
    pub max_files: Option<usize>,
    pub format: Option<String>,
}

#[derive(Debug, Default, Clone, serde_derive::Deserialize, PartialEq, Eq)]
pub(crate) struct GreggdLogsConfig {
    pub default: GreggdLogEntry,
    pub errors: Option<GreggdLogEntry>,
    pub events: Option<GreggdLogEntry>,
}

#[derive(Debug, Clone, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub(crate) struct GreggdLimits {
    pub batch_capacity: usize,
    pub perf_pages: usize,
    pub shutdown_grace_ms: u64,
}

impl Default for GreggdLimits {
    fn default() -> Self {
        GreggdLimits {
            batch_capacity: 1000,
            perf_pages: 128,
            shutdown_grace_ms: 2000,
        }
    }
}

impl GreggdLimits {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub(crate) struct GreggdConfig {
    pub socket_path: Option<String>,
    #[serde(default)]
    pub ebpf_logs: bool,
    #[serde(default)]
    pub limits: GreggdLimits,
    pub programs: Vec<ProgramSpec>,
    pub logs: GreggdLogsConfig,
}

/// Reads `config.json5` from the config directory, overlaid by
/// `$RUN_MODE.json5` when present.
pub(crate) fn load_config(config_dir: Option<String>) -> Result<GreggdConfig, anyhow::Error> {
    let mut config_dir = config_dir
        .or_else(|| env::var("CONFIG_DIR").ok())
        .unwrap_or_else(|| "config/".into());
    if !config_dir.ends_with('/') {
        config_dir.push('/');
    }

    let mut builder = Config::builder().add_source(File::new(
        &format!("{}config.json5", config_dir),
        FileFormat::Json5,
    ));
    if let Ok(run_mode) = env::var("RUN_MODE") {
        builder = builder.add_source(
            File::new(&format!("{}{}.json5", config_dir, run_mode), FileFormat::Json5)
                .required(false),
        );
    }

    let conf: GreggdConfig = builder.build()?.try_deserialize()?;

    Ok(conf)
}
