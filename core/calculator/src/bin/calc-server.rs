// Copyright Calcrpc Contributors
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use anyhow::Result;
use calcrpc::Server;
use calcrpc_calculator::{CalculatorConfig, register};
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "calc-server", about = "Calculator RPC server")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "CALC_LISTEN", default_value = "127.0.0.1:46357")]
    listen: String,

    /// Number of delay steps performed by SlowAdd
    #[arg(long, default_value_t = 5)]
    slow_add_steps: u32,

    /// Delay per SlowAdd step, in milliseconds
    #[arg(long, default_value_t = 1000)]
    slow_add_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let server = Server::new();
    register(
        server.registry(),
        CalculatorConfig {
            slow_add_steps: args.slow_add_steps,
            slow_add_interval: Duration::from_millis(args.slow_add_interval_ms),
        },
    );

    let listener = TcpListener::bind(&args.listen).await?;
    tracing::info!(addr = %args.listen, "calculator server listening");

    let serving = server.clone();
    let serve = tokio::spawn(async move { serving.serve(listener).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down, draining in-flight calls");
    server.shutdown().await;
    serve.await??;

    Ok(())
}
