//! EmiService server.
//!
//! Serves `EmiService.Start` until Ctrl-C. The listen address comes from
//! `EMIRPC_BIND_ADDRESS` (default `0.0.0.0:50051`); log verbosity from `RUST_LOG`.

use emirpc::service::{add_emi_service, DefaultEmiService};
use emirpc::{runtime, RpcConfig, RpcServer};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let runtime = runtime::build_server_runtime()?;
    runtime.block_on(async {
        let mut server = RpcServer::new(RpcConfig::from_env());
        add_emi_service(&mut server, DefaultEmiService)?;
        server.serve().await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
