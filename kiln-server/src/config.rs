use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use kiln_core::{layout::DEFAULT_MODEL_ROOT, DeviceMap, IdlePolicy, DEFAULT_MODEL};

// Define command line arguments
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Kiln SDXL image generation server")]
pub struct Args {
    /// Host address to bind the server to
    #[arg(long, env = "KILN_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the server to
    #[arg(long, env = "KILN_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Directory holding checkpoints, the IP-Adapter and LoRAs
    #[arg(long, env = "MODEL_ROOT", default_value = DEFAULT_MODEL_ROOT)]
    pub model_root: PathBuf,

    /// Model loaded at startup when its checkpoint is present
    #[arg(long, env = "KILN_DEFAULT_MODEL", default_value = DEFAULT_MODEL)]
    pub default_model: String,

    /// Skip loading the default model at startup
    #[arg(long)]
    pub no_preload: bool,

    /// Minutes without requests before shutting down; 0 disables
    #[arg(long, env = "IDLE_TIMEOUT_MINUTES", default_value_t = 60)]
    pub idle_timeout_minutes: u64,

    /// Seconds between idle checks
    #[arg(long, env = "IDLE_POLL_SECONDS", default_value_t = 60)]
    pub idle_poll_seconds: u64,

    /// Use CPU instead of GPU
    #[arg(long)]
    pub cpu: bool,

    /// GPU ordinal to run on
    #[arg(long, default_value_t = 0)]
    pub device: usize,
}

impl Args {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn device_map(&self) -> DeviceMap {
        if self.cpu {
            DeviceMap::ForceCpu
        } else {
            DeviceMap::Ordinal(self.device)
        }
    }

    pub fn idle_policy(&self) -> IdlePolicy {
        IdlePolicy::from_minutes(self.idle_timeout_minutes)
            .with_poll(Duration::from_secs(self.idle_poll_seconds.max(1)))
    }
}
