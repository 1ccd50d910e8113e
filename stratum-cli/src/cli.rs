use clap::Parser;
use miette::Result;
use tracing_subscriber::EnvFilter;

use crate::workload::WorkloadArgs;

#[derive(Debug, Parser)]
#[command(name = "stratum", version, about = "Drive concurrent workloads against the stratum engine")]
pub enum Cli {
    /// Run a concurrent bank-transfer workload and check that money is conserved.
    Workload(WorkloadArgs),
}

impl Cli {
    pub fn run(self) -> Result<()> {
        init_logging();
        match self {
            Cli::Workload(args) => args.run(),
        }
    }
}

/// Logs go to stderr, filtered by `RUST_LOG` (default `warn`).
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // A subscriber may already be installed when running inside tests.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
