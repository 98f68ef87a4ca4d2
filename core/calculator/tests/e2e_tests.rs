// Copyright Calcrpc Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests driving a real server over TCP, one per interaction
//! pattern plus failure, deadline, and shutdown behavior.

use std::time::Duration;

use async_stream::stream;
use calcrpc::{Channel, Code, Server};
use calcrpc_calculator::messages::{
    AddRequest, AddResponse, AverageRequest, AverageResponse, FactorizeRequest, FactorizeResponse,
    RunningMaxRequest, RunningMaxResponse, SquareRootRequest, SquareRootResponse,
};
use calcrpc_calculator::{CalculatorConfig, SERVICE_NAME, register};
use futures::{StreamExt, pin_mut, stream};
use tokio::net::TcpListener;
use tracing_test::traced_test;

struct TestEnv {
    server: Server,
    channel: Channel,
}

async fn setup() -> TestEnv {
    setup_with(CalculatorConfig::default()).await
}

async fn setup_with(config: CalculatorConfig) -> TestEnv {
    let server = Server::new();
    register(server.registry(), config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });

    let channel = Channel::connect(addr).await.unwrap();
    TestEnv { server, channel }
}

#[tokio::test]
#[traced_test]
async fn add_returns_sum() {
    let env = setup().await;

    let response: AddResponse = env
        .channel
        .unary(SERVICE_NAME, "Add", AddRequest { a: 19, b: 23 }, None)
        .await
        .unwrap();

    assert_eq!(response.sum, 42);
}

#[tokio::test]
async fn square_root_of_valid_input() {
    let env = setup().await;

    let response: SquareRootResponse = env
        .channel
        .unary(
            SERVICE_NAME,
            "SquareRoot",
            SquareRootRequest { value: 81 },
            None,
        )
        .await
        .unwrap();

    assert_eq!(response.root, 9.0);
}

#[tokio::test]
async fn square_root_rejects_negative_input() {
    let env = setup().await;

    let status = env
        .channel
        .unary::<_, SquareRootResponse>(
            SERVICE_NAME,
            "SquareRoot",
            SquareRootRequest { value: -4 },
            None,
        )
        .await
        .unwrap_err();

    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("-4"), "{status}");
}

#[tokio::test]
async fn unknown_method_is_unimplemented() {
    let env = setup().await;

    let status = env
        .channel
        .unary::<_, AddResponse>(SERVICE_NAME, "Subtract", AddRequest { a: 1, b: 2 }, None)
        .await
        .unwrap_err();

    assert_eq!(status.code(), Code::Unimplemented);
}

#[tokio::test]
async fn factorize_streams_ordered_factors() {
    let env = setup().await;

    let factors = env.channel.server_stream::<_, FactorizeResponse>(
        SERVICE_NAME,
        "Factorize",
        FactorizeRequest { value: 120 },
        None,
    );
    pin_mut!(factors);

    let mut collected = Vec::new();
    while let Some(factor) = factors.next().await {
        collected.push(factor.unwrap().factor);
    }

    assert_eq!(collected, [2, 2, 2, 3, 5]);
}

#[tokio::test]
async fn factorize_rejects_units() {
    let env = setup().await;

    let factors = env.channel.server_stream::<_, FactorizeResponse>(
        SERVICE_NAME,
        "Factorize",
        FactorizeRequest { value: 1 },
        None,
    );
    pin_mut!(factors);

    let status = factors.next().await.unwrap().unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(factors.next().await.is_none());
}

#[tokio::test]
async fn average_folds_the_whole_stream() {
    let env = setup().await;

    // Enough values that truncation at close_send would show up.
    let values: Vec<i64> = (1..=100).collect();
    let requests = stream::iter(values.into_iter().map(|value| AverageRequest { value }));

    let response: AverageResponse = env
        .channel
        .client_stream(SERVICE_NAME, "Average", requests, None)
        .await
        .unwrap();

    assert_eq!(response.average, 50.5);
}

#[tokio::test]
async fn average_of_empty_stream_is_invalid() {
    let env = setup().await;

    let status = env
        .channel
        .client_stream::<AverageRequest, AverageResponse, _>(
            SERVICE_NAME,
            "Average",
            stream::empty(),
            None,
        )
        .await
        .unwrap_err();

    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn running_max_is_prefix_max() {
    let env = setup().await;

    let requests = stream::iter([1i64, 5, 3, 6, 2, 20].map(|value| RunningMaxRequest { value }));
    let maxima = env.channel.bidi_stream::<_, RunningMaxResponse, _>(
        SERVICE_NAME,
        "RunningMax",
        requests,
        None,
    );
    pin_mut!(maxima);

    let mut collected = Vec::new();
    while let Some(max) = maxima.next().await {
        collected.push(max.unwrap().max);
    }

    assert_eq!(collected, [1, 5, 5, 6, 6, 20]);
}

#[tokio::test]
async fn running_max_seeds_from_first_value() {
    let env = setup().await;

    let requests = stream::iter([-7i64, -3, -9].map(|value| RunningMaxRequest { value }));
    let maxima = env.channel.bidi_stream::<_, RunningMaxResponse, _>(
        SERVICE_NAME,
        "RunningMax",
        requests,
        None,
    );
    pin_mut!(maxima);

    let mut collected = Vec::new();
    while let Some(max) = maxima.next().await {
        collected.push(max.unwrap().max);
    }

    assert_eq!(collected, [-7, -3, -3]);
}

#[tokio::test]
async fn bidi_waits_for_a_slow_sender() {
    let env = setup().await;

    let requests = Box::pin(stream! {
        for value in [3i64, 1, 4, 1, 5] {
            tokio::time::sleep(Duration::from_millis(20)).await;
            yield RunningMaxRequest { value };
        }
    });
    let maxima = env.channel.bidi_stream::<_, RunningMaxResponse, _>(
        SERVICE_NAME,
        "RunningMax",
        requests,
        None,
    );
    pin_mut!(maxima);

    let mut collected = Vec::new();
    while let Some(max) = maxima.next().await {
        collected.push(max.unwrap().max);
    }

    // Every request made it through despite the pauses between sends.
    assert_eq!(collected, [3, 3, 4, 4, 5]);
}

#[tokio::test]
#[traced_test]
async fn slow_add_deadline_cuts_the_delay_short() {
    let env = setup_with(CalculatorConfig {
        slow_add_steps: 5,
        slow_add_interval: Duration::from_millis(100),
    })
    .await;

    let started = tokio::time::Instant::now();
    let status = env
        .channel
        .unary::<_, AddResponse>(
            SERVICE_NAME,
            "SlowAdd",
            AddRequest { a: 1, b: 2 },
            Some(Duration::from_millis(150)),
        )
        .await
        .unwrap_err();

    assert_eq!(status.code(), Code::DeadlineExceeded);
    assert!(
        started.elapsed() < Duration::from_millis(450),
        "deadline did not cut the call short: {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn slow_add_completes_without_a_deadline() {
    let env = setup_with(CalculatorConfig {
        slow_add_steps: 2,
        slow_add_interval: Duration::from_millis(10),
    })
    .await;

    let response: AddResponse = env
        .channel
        .unary(SERVICE_NAME, "SlowAdd", AddRequest { a: 40, b: 2 }, None)
        .await
        .unwrap();

    assert_eq!(response.sum, 42);
}

#[tokio::test]
async fn shutdown_fails_in_flight_calls_and_returns() {
    let env = setup_with(CalculatorConfig {
        slow_add_steps: 100,
        slow_add_interval: Duration::from_millis(50),
    })
    .await;

    let channel = env.channel.clone();
    let call = tokio::spawn(async move {
        channel
            .unary::<_, AddResponse>(SERVICE_NAME, "SlowAdd", AddRequest { a: 1, b: 2 }, None)
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    env.server.shutdown().await;

    // The call surfaces an error rather than hanging; depending on whether
    // the terminal status or the connection teardown wins the race it is
    // either Cancelled or Internal.
    let status = call.await.unwrap().unwrap_err();
    assert!(
        matches!(status.code(), Code::Cancelled | Code::Internal),
        "{status}"
    );
}

#[tokio::test]
async fn concurrent_calls_share_one_connection() {
    let env = setup().await;

    let mut handles = Vec::new();
    for i in 0..10i64 {
        let channel = env.channel.clone();
        handles.push(tokio::spawn(async move {
            channel
                .unary::<_, AddResponse>(SERVICE_NAME, "Add", AddRequest { a: i, b: i }, None)
                .await
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.sum, 2 * i as i64);
    }
}
