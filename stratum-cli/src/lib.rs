mod cli;
mod workload;

pub use cli::Cli;
pub use workload::{IsolationArg, WorkloadArgs, WorkloadError, WorkloadReport};
