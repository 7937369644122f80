use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use ksql_client::{
    CollectingSink, DispatchError, Dispatcher, HttpTransportFactory, Mode, OutputRecord, Request,
    SlotState, StreamExit, TransportError,
};
use serde_json::{json, Value};

#[derive(Clone, Default)]
struct Seen {
    bodies: Arc<Mutex<Vec<Value>>>,
}

async fn ksql(State(seen): State<Seen>, Json(body): Json<Value>) -> Response {
    let statement = body["ksql"].as_str().unwrap_or_default().to_string();
    seen.bodies.lock().unwrap().push(body);

    if statement.to_uppercase().starts_with("SHOW TOPICS") {
        let topics: Vec<Value> = ["pageviews", "users", "orders"]
            .iter()
            .map(|name| {
                json!({
                    "name": name,
                    "registered": false,
                    "replicaInfo": [1],
                    "consumers": 0,
                    "groupConsumers": 0
                })
            })
            .collect();
        return Json(json!([{
            "@type": "kafka_topics",
            "statementText": statement,
            "topics": topics
        }]))
        .into_response();
    }
    if statement.to_uppercase().starts_with("TERMINATE") {
        let body = futures::stream::iter(vec![
            Ok("{\"message\":".to_string()),
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker died")),
        ]);
        return (StatusCode::INTERNAL_SERVER_ERROR, Body::from_stream(body)).into_response();
    }
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "@type": "statement_error",
            "error_code": 40001,
            "message": "Stream MISSING does not exist."
        })),
    )
        .into_response()
}

async fn query(Json(body): Json<Value>) -> Response {
    let statement = body["ksql"].as_str().unwrap_or_default();
    let mut chunks = vec![
        "[{\"header\":{\"queryId\":\"q_1\",\"schema\":\"`ID` BIGINT, `NAME` STRING, `SCORE` BIGINT\"}},\n"
            .to_string(),
    ];
    let finite = statement.contains("LIMIT");
    let rows = if finite { 5 } else { 2 };
    for id in 1..=rows {
        chunks.push(format!(
            "{{\"row\":{{\"columns\":[{id},\"user_{id}\",{}]}}}},\n",
            id * 10
        ));
    }
    if finite {
        chunks.push("{\"finalMessage\":\"Limit Reached\"}]\n".to_string());
        let body = futures::stream::iter(chunks.into_iter().map(Ok::<_, Infallible>));
        return Body::from_stream(body).into_response();
    }
    let body = futures::stream::iter(chunks.into_iter().map(Ok::<_, Infallible>))
        .chain(futures::stream::pending());
    Body::from_stream(body).into_response()
}

async fn spawn_server() -> Result<(String, Seen)> {
    let seen = Seen::default();
    let app = Router::new()
        .route("/ksql", post(ksql))
        .route("/query", post(query))
        .with_state(seen.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), seen))
}

fn http_dispatcher() -> (Dispatcher, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::new());
    let dispatcher = Dispatcher::new(Arc::new(HttpTransportFactory::default()), sink.clone());
    (dispatcher, sink)
}

#[tokio::test]
async fn show_topics_sends_properties_and_lists_topics() -> Result<()> {
    let (endpoint, seen) = spawn_server().await?;
    let (dispatcher, sink) = http_dispatcher();

    let request = Request::new("SHOW TOPICS;")
        .with_property("ksql.streams.auto.offset.reset", "earliest");
    dispatcher.dispatch(&request, &endpoint, Duration::ZERO).await?;

    let names: Vec<String> = sink
        .snapshot()
        .into_iter()
        .filter_map(|r| match r {
            OutputRecord::Topic(t) => Some(t.name),
            _ => None,
        })
        .collect();
    assert_eq!(names, ["pageviews", "users", "orders"]);

    let bodies = seen.bodies.lock().unwrap().clone();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["ksql"], "SHOW TOPICS;");
    assert_eq!(
        bodies[0]["streamsProperties"]["ksql.streams.auto.offset.reset"],
        "earliest"
    );
    Ok(())
}

#[tokio::test]
async fn rejected_statement_keeps_the_handle_live() -> Result<()> {
    let (endpoint, _seen) = spawn_server().await?;
    let (dispatcher, sink) = http_dispatcher();

    let err = dispatcher
        .dispatch(&Request::new("DROP STREAM missing;"), &endpoint, Duration::ZERO)
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected server error"))?;

    match err {
        DispatchError::Transport {
            mode: Mode::Admin,
            source: TransportError::Server { status, message },
        } => {
            assert_eq!(status, 400);
            assert_eq!(message, "Stream MISSING does not exist.");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(sink.is_empty());
    assert_eq!(dispatcher.slot_state(Mode::Admin), SlotState::Live);
    Ok(())
}

#[tokio::test]
async fn unreadable_error_body_keeps_the_status() -> Result<()> {
    let (endpoint, _seen) = spawn_server().await?;
    let (dispatcher, _sink) = http_dispatcher();

    let err = dispatcher
        .dispatch(&Request::new("TERMINATE ALL;"), &endpoint, Duration::ZERO)
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected server error"))?;

    match err {
        DispatchError::Transport {
            mode: Mode::Admin,
            source: TransportError::Server { status, message },
        } => {
            assert_eq!(status, 500);
            assert_eq!(message, "empty response body");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn bounded_query_reads_the_whole_response() -> Result<()> {
    let (endpoint, _seen) = spawn_server().await?;
    let (dispatcher, sink) = http_dispatcher();

    dispatcher
        .dispatch(
            &Request::new("SELECT * FROM users LIMIT 5;"),
            &endpoint,
            Duration::from_secs(5),
        )
        .await?;

    let records = sink.snapshot();
    assert_eq!(records.len(), 6);
    for (idx, record) in records[..5].iter().enumerate() {
        match record {
            OutputRecord::Row { values, .. } => {
                assert_eq!(values.len(), 3);
                assert_eq!(values[1].text, format!("user_{}", idx + 1));
            }
            other => panic!("expected row, got {other:?}"),
        }
    }
    assert_eq!(records[5], OutputRecord::status("Limit Reached"));
    Ok(())
}

#[tokio::test]
async fn bounded_query_returns_rows_seen_before_the_time_limit() -> Result<()> {
    let (endpoint, _seen) = spawn_server().await?;
    let (dispatcher, sink) = http_dispatcher();

    tokio::time::timeout(
        Duration::from_secs(5),
        dispatcher.dispatch(
            &Request::new("SELECT * FROM users;"),
            &endpoint,
            Duration::from_millis(300),
        ),
    )
    .await??;

    assert_eq!(sink.len(), 2);
    Ok(())
}

#[tokio::test]
async fn reused_bounded_handle_grants_the_full_timeout() -> Result<()> {
    let (endpoint, _seen) = spawn_server().await?;
    let (dispatcher, sink) = http_dispatcher();
    let timeout = Duration::from_secs(1);

    dispatcher
        .dispatch(&Request::new("SELECT * FROM users LIMIT 5;"), &endpoint, timeout)
        .await?;
    assert_eq!(sink.drain().len(), 6);
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(dispatcher.slot_state(Mode::BoundedQuery), SlotState::Live);

    let started = std::time::Instant::now();
    dispatcher
        .dispatch(&Request::new("SELECT * FROM users;"), &endpoint, timeout)
        .await?;
    let elapsed = started.elapsed();

    assert_eq!(sink.len(), 2);
    assert!(
        elapsed >= Duration::from_millis(900),
        "second call stopped after {elapsed:?}"
    );
    Ok(())
}

#[tokio::test]
async fn push_query_streams_until_cancelled() -> Result<()> {
    let (endpoint, _seen) = spawn_server().await?;
    let (dispatcher, sink) = http_dispatcher();

    let stream = dispatcher
        .dispatch(
            &Request::new("SELECT * FROM users EMIT CHANGES;"),
            &endpoint,
            Duration::ZERO,
        )
        .await?
        .ok_or_else(|| anyhow::anyhow!("expected stream handle"))?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while sink.len() < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(sink.len(), 2);

    stream.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(5), stream.join()).await??;
    assert_eq!(outcome.exit, StreamExit::Cancelled);
    assert_eq!(outcome.records, 2);
    Ok(())
}

#[tokio::test]
async fn refused_connection_marks_the_slot_stale() -> Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let endpoint = format!("http://{}", listener.local_addr()?);
    drop(listener);
    let (dispatcher, _sink) = http_dispatcher();

    let err = dispatcher
        .dispatch(&Request::new("SHOW TOPICS;"), &endpoint, Duration::ZERO)
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected connect error"))?;

    assert!(matches!(
        err,
        DispatchError::Transport {
            mode: Mode::Admin,
            source: TransportError::Connect { .. }
        }
    ));
    assert_eq!(dispatcher.slot_state(Mode::Admin), SlotState::Stale);
    Ok(())
}

#[tokio::test]
async fn https_endpoint_reaches_the_tls_connector() -> Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let endpoint = format!("https://{}", listener.local_addr()?);
    drop(listener);
    let (dispatcher, _sink) = http_dispatcher();

    let err = dispatcher
        .dispatch(&Request::new("SHOW TOPICS;"), &endpoint, Duration::ZERO)
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected connect error"))?;

    // Refused by the socket, not rejected as an unsupported scheme.
    assert!(
        matches!(
            err,
            DispatchError::Transport {
                source: TransportError::Connect { .. },
                ..
            }
        ),
        "unexpected error: {err}"
    );
    Ok(())
}
