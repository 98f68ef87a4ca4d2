// Copyright Calcrpc Contributors
// SPDX-License-Identifier: Apache-2.0

//! Calculator operations, one per interaction pattern plus the validating
//! and slow unary variants. The arithmetic is deliberately trivial; the
//! interesting part is how each operation maps onto its pattern.

use std::time::Duration;

use async_stream::stream;
use calcrpc::{CallContext, RequestStream, ServiceRegistry, Status};
use futures::StreamExt;

use crate::messages::{
    AddRequest, AddResponse, AverageRequest, AverageResponse, FactorizeRequest, FactorizeResponse,
    RunningMaxRequest, RunningMaxResponse, SquareRootRequest, SquareRootResponse,
};

pub const SERVICE_NAME: &str = "Calculator";

/// Tuning knobs for the artificial delay in `SlowAdd`.
#[derive(Debug, Clone)]
pub struct CalculatorConfig {
    pub slow_add_steps: u32,
    pub slow_add_interval: Duration,
}

impl Default for CalculatorConfig {
    fn default() -> Self {
        Self {
            slow_add_steps: 5,
            slow_add_interval: Duration::from_secs(1),
        }
    }
}

/// Bind every calculator operation into the registry.
pub fn register(registry: &ServiceRegistry, config: CalculatorConfig) {
    registry.register_unary(SERVICE_NAME, "Add", |request: AddRequest, _ctx| async move {
        Ok(AddResponse {
            sum: request.a + request.b,
        })
    });

    registry.register_unary(
        SERVICE_NAME,
        "SlowAdd",
        move |request: AddRequest, ctx: CallContext| {
            let config = config.clone();
            async move {
                // Check for cancellation between steps so a deadline or a
                // client cancel never waits out the full delay.
                for step in 0..config.slow_add_steps {
                    if ctx.is_cancelled() {
                        tracing::info!(step, "slow add cancelled");
                        return Err(slow_add_cancel_status(&ctx));
                    }
                    tokio::time::sleep(config.slow_add_interval).await;
                }
                Ok(AddResponse {
                    sum: request.a + request.b,
                })
            }
        },
    );

    registry.register_unary(
        SERVICE_NAME,
        "SquareRoot",
        |request: SquareRootRequest, _ctx| async move {
            if request.value < 0 {
                return Err(Status::invalid_argument(format!(
                    "received a negative number: {}",
                    request.value
                )));
            }
            Ok(SquareRootResponse {
                root: (request.value as f64).sqrt(),
            })
        },
    );

    registry.register_server_stream(
        SERVICE_NAME,
        "Factorize",
        |request: FactorizeRequest, ctx: CallContext| async move {
            if request.value < 2 {
                return Err(Status::invalid_argument(format!(
                    "nothing to factorize: {}",
                    request.value
                )));
            }
            // Repeated division; factors come out in non-decreasing order
            // with multiplicity.
            Ok(stream! {
                let mut remaining = request.value;
                let mut divisor = 2u64;
                while remaining > 1 {
                    if ctx.is_cancelled() {
                        break;
                    }
                    if remaining % divisor == 0 {
                        remaining /= divisor;
                        yield Ok(FactorizeResponse { factor: divisor });
                    } else {
                        divisor += 1;
                    }
                }
            })
        },
    );

    registry.register_client_stream(
        SERVICE_NAME,
        "Average",
        |mut requests: RequestStream<AverageRequest>, _ctx| async move {
            let mut sum = 0i64;
            let mut count = 0u64;
            while let Some(request) = requests.next().await {
                sum += request?.value;
                count += 1;
            }
            if count == 0 {
                return Err(Status::invalid_argument("average of an empty stream"));
            }
            Ok(AverageResponse {
                average: sum as f64 / count as f64,
            })
        },
    );

    registry.register_bidi_stream(
        SERVICE_NAME,
        "RunningMax",
        |mut requests: RequestStream<RunningMaxRequest>, _ctx| async move {
            Ok(stream! {
                // Seeds from the first value so negative inputs report
                // correctly.
                let mut max: Option<i64> = None;
                while let Some(request) = requests.next().await {
                    match request {
                        Ok(request) => {
                            let current = max.map_or(request.value, |m| m.max(request.value));
                            max = Some(current);
                            yield Ok(RunningMaxResponse { max: current });
                        }
                        Err(status) => {
                            yield Err(status);
                            break;
                        }
                    }
                }
            })
        },
    );
}

fn slow_add_cancel_status(ctx: &CallContext) -> Status {
    if ctx.is_deadline_exceeded() {
        Status::deadline_exceeded("slow add deadline exceeded")
    } else {
        Status::cancelled("slow add cancelled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_all_operations() {
        let registry = ServiceRegistry::new();
        register(&registry, CalculatorConfig::default());

        let methods = registry.methods();
        let mut methods: Vec<&str> = methods.iter().map(String::as_str).collect();
        methods.sort_unstable();
        assert_eq!(
            methods,
            [
                "Calculator/Add",
                "Calculator/Average",
                "Calculator/Factorize",
                "Calculator/RunningMax",
                "Calculator/SlowAdd",
                "Calculator/SquareRoot",
            ]
        );
    }
}
