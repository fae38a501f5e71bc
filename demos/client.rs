//! EmiService client.
//!
//! Sends one call and prints the reply. Reads `EMIRPC_HOST` (default
//! `localhost`), `EMIRPC_PORT` (`50051`), `EMIRPC_COMMAND` (`RUN2`) and
//! `EMIRPC_METHOD` (`start` or `stop`).

use emirpc::service::{EmiServiceClient, StartRequest, StopRequest, DEFAULT_COMMAND};
use emirpc::RpcConfig;
use std::env;
use tracing_subscriber::EnvFilter;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let host = env_or("EMIRPC_HOST", "localhost");
    let port: u16 = env_or("EMIRPC_PORT", "50051").parse()?;
    let command = env_or("EMIRPC_COMMAND", DEFAULT_COMMAND);
    let method = env_or("EMIRPC_METHOD", "start");

    let target = format!("{host}:{port}");
    let client = EmiServiceClient::connect_to(&target, RpcConfig::from_env()).await?;

    match method.to_lowercase().as_str() {
        "start" => println!("{:?}", client.start(StartRequest::new(command)).await?),
        "stop" => println!("{:?}", client.stop(StopRequest::new(command)).await?),
        other => println!("Unknown method: {other}. Use 'start' or 'stop'"),
    }
    Ok(())
}
