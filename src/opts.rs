use std::{net::SocketAddr, time::Duration};

use clap::Parser;

use gamedeployment::controller::ControllerConfig;

#[derive(Parser, Debug)]
pub struct Opts {
    /// The number of keys to reconcile concurrently.
    /// Defaults to the number of CPUs the machine has, as reported by `num_cpus`.
    #[clap(long, short)]
    pub workers: Option<usize>,

    /// Only watch this namespace, all namespaces when unset.
    #[clap(long, short)]
    pub namespace: Option<String>,

    /// Address to serve metrics and health checks on.
    #[clap(long, default_value = "0.0.0.0:8080")]
    pub metrics_address: SocketAddr,

    /// Seconds to wait on unobserved pod changes before warning and requeueing.
    #[clap(long, default_value = "300")]
    pub expectation_timeout_seconds: u64,

    /// Disable colours in log output.
    #[clap(long)]
    pub no_ansi: bool,
}

impl Opts {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers.unwrap_or_else(num_cpus::get),
            expectation_timeout: Duration::from_secs(self.expectation_timeout_seconds),
        }
    }
}
