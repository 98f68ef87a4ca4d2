// Copyright Calcrpc Contributors
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use anyhow::Result;
use calcrpc::Channel;
use calcrpc_calculator::SERVICE_NAME;
use calcrpc_calculator::messages::{
    AddRequest, AddResponse, AverageRequest, AverageResponse, FactorizeRequest, FactorizeResponse,
    RunningMaxRequest, RunningMaxResponse, SquareRootRequest, SquareRootResponse,
};
use clap::{Parser, Subcommand};
use futures::{StreamExt, pin_mut, stream};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "calc-client", about = "Calculator RPC client")]
struct Args {
    /// Server address to connect to
    #[arg(long, env = "CALC_SERVER", default_value = "127.0.0.1:46357")]
    server: String,

    /// Per-call timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Unary sum of two terms
    Add { a: i64, b: i64 },
    /// Unary sum with an artificial server-side delay
    SlowAdd { a: i64, b: i64 },
    /// Unary square root; negative input is rejected by the server
    SquareRoot { value: i64 },
    /// Server-stream prime decomposition
    Factorize { value: u64 },
    /// Client-stream mean of the given values
    Average { values: Vec<i64> },
    /// Bidi-stream running maximum over the given values
    RunningMax { values: Vec<i64> },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let timeout = args.timeout_ms.map(Duration::from_millis);

    let channel = Channel::connect(&args.server).await?;

    match args.command {
        Command::Add { a, b } => {
            let response: AddResponse = channel
                .unary(SERVICE_NAME, "Add", AddRequest { a, b }, timeout)
                .await?;
            println!("{a} + {b} = {}", response.sum);
        }
        Command::SlowAdd { a, b } => {
            let response: AddResponse = channel
                .unary(SERVICE_NAME, "SlowAdd", AddRequest { a, b }, timeout)
                .await?;
            println!("{a} + {b} = {}", response.sum);
        }
        Command::SquareRoot { value } => {
            let response: SquareRootResponse = channel
                .unary(
                    SERVICE_NAME,
                    "SquareRoot",
                    SquareRootRequest { value },
                    timeout,
                )
                .await?;
            println!("sqrt({value}) = {}", response.root);
        }
        Command::Factorize { value } => {
            let factors = channel.server_stream::<_, FactorizeResponse>(
                SERVICE_NAME,
                "Factorize",
                FactorizeRequest { value },
                timeout,
            );
            pin_mut!(factors);
            while let Some(factor) = factors.next().await {
                println!("factor: {}", factor?.factor);
            }
        }
        Command::Average { values } => {
            let count = values.len();
            let requests = stream::iter(values.into_iter().map(|value| AverageRequest { value }));
            let response: AverageResponse = channel
                .client_stream(SERVICE_NAME, "Average", requests, timeout)
                .await?;
            println!("average of {count} values = {}", response.average);
        }
        Command::RunningMax { values } => {
            let requests =
                stream::iter(values.into_iter().map(|value| RunningMaxRequest { value }));
            let maxima = channel.bidi_stream::<_, RunningMaxResponse, _>(
                SERVICE_NAME,
                "RunningMax",
                requests,
                timeout,
            );
            pin_mut!(maxima);
            while let Some(max) = maxima.next().await {
                println!("running max: {}", max?.max);
            }
        }
    }

    Ok(())
}
