use clap::Parser;

use crate::config::RelayConfig;

/// EEG Relay - two-channel biopotential ingest, conditioning and fan-out
#[derive(Parser, Debug, Default)]
#[command(name = "eeg-relay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Bind address (overrides RELAY_BIND_ADDR)
    #[arg(long)]
    pub bind: Option<String>,

    /// Port to listen on (overrides RELAY_PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Run without a database even if DATABASE_URL is set
    #[arg(long)]
    pub no_persistence: bool,
}

impl Cli {
    /// Apply command-line overrides on top of the environment
    pub fn apply(&self, config: &mut RelayConfig) {
        if let Some(bind) = &self.bind {
            config.bind_addr = bind.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.no_persistence {
            config.database_url = None;
        }
    }
}
