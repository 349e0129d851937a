//! Body handling: chunked uploads, aggregation, and decompression.

mod support;

use std::io::Write;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use pretty_assertions::assert_eq;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;

use riptide::{Client, HttpResult, State, StateType};
use support::{find_header, read_chunked_body, read_head, EventLog, TestServer};

fn client() -> Client {
    Client::builder()
        .reactor(Handle::current())
        .build()
        .unwrap()
}

#[tokio::test]
async fn chunked_put_with_100_continue_round_trips() {
    let server = TestServer::spawn(|mut stream, _| async move {
        let (head, leftover) = read_head(&mut stream).await;
        assert!(head.starts_with("PUT "), "unexpected request: {head}");
        assert_eq!(
            find_header(&head, "Transfer-Encoding").as_deref(),
            Some("chunked")
        );
        if find_header(&head, "Expect").as_deref() == Some("100-continue") {
            stream
                .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
                .await
                .unwrap();
            stream.flush().await.unwrap();
        }

        let body = read_chunked_body(&mut stream, leftover).await;
        let mut reply = b"You sent:\n".to_vec();
        reply.extend_from_slice(&body);
        let head_out = format!(
            "HTTP/1.1 201 Created\r\nContent-Length: {}\r\n\r\n",
            reply.len()
        );
        stream.write_all(head_out.as_bytes()).await.unwrap();
        stream.write_all(&reply).await.unwrap();
        stream.flush().await.unwrap();
    })
    .await;

    let log = EventLog::new();
    client()
        .put(&server.url("/upload"))
        .unwrap()
        .chunked_body(|count: usize| -> HttpResult<Option<Bytes>> {
            if count < 10 {
                Ok(Some(Bytes::from(format!("Chunk-{}\n", count + 1))))
            } else {
                Ok(None)
            }
        })
        .on_any(log.observer())
        .execute()
        .unwrap();
    log.wait_closed().await;

    assert_eq!(log.count(StateType::Finished), 1);
    let states = log.states();
    let response = states.iter().find_map(State::response).unwrap();
    assert_eq!(response.status(), 201);
    let expected = format!(
        "You sent:\n{}",
        (1..=10).map(|i| format!("Chunk-{i}\n")).collect::<String>()
    );
    assert_eq!(response.text(), expected);
}

#[tokio::test]
async fn aggregate_equals_concatenation_of_chunks() {
    let server = TestServer::canned(
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nfirst\r\n6\r\nsecond\r\n5\r\nthird\r\n0\r\n\r\n",
    )
    .await;

    let log = EventLog::new();
    client()
        .get(&server.url("/chunks"))
        .unwrap()
        .on_any(log.observer())
        .execute()
        .unwrap();
    log.wait_closed().await;

    let states = log.states();
    let chunk_total: usize = states
        .iter()
        .filter_map(State::chunk)
        .map(Bytes::len)
        .sum();
    let aggregate = states.iter().find_map(State::full_content).unwrap();
    assert_eq!(aggregate.len(), chunk_total);

    let response = states.iter().find_map(State::response).unwrap();
    assert_eq!(response.text(), "firstsecondthird");
}

#[tokio::test]
async fn gzip_responses_are_transparently_decoded() {
    let body = "compressed payload ".repeat(20);
    let compressed = {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(body.as_bytes()).unwrap();
        encoder.finish().unwrap()
    };

    let expected_len = compressed.len();
    let server = TestServer::spawn(move |mut stream, _| {
        let compressed = compressed.clone();
        async move {
            let (head, _) = read_head(&mut stream).await;
            assert_eq!(
                find_header(&head, "Accept-Encoding").as_deref(),
                Some("gzip"),
                "compression was enabled, the header should be advertised"
            );
            let head_out = format!(
                "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
                compressed.len()
            );
            stream.write_all(head_out.as_bytes()).await.unwrap();
            stream.write_all(&compressed).await.unwrap();
            stream.flush().await.unwrap();
        }
    })
    .await;

    let client = Client::builder()
        .reactor(Handle::current())
        .compression(true)
        .build()
        .unwrap();
    let log = EventLog::new();
    client
        .get(&server.url("/gz"))
        .unwrap()
        .on_any(log.observer())
        .execute()
        .unwrap();
    log.wait_closed().await;

    let states = log.states();
    let response = states.iter().find_map(State::response).unwrap();
    assert_eq!(response.text(), body);
    assert!(response.body.len() > expected_len, "body was decompressed");
}

#[tokio::test]
async fn disabling_aggregation_suppresses_full_content_and_finished() {
    let server = TestServer::canned("HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;
    let log = EventLog::new();
    client()
        .get(&server.url("/stream"))
        .unwrap()
        .aggregate_response(false)
        .on_any(log.observer())
        .execute()
        .unwrap();
    log.wait_closed().await;

    let tags = log.tags();
    assert!(tags.contains(&StateType::ContentReceived));
    assert!(!tags.contains(&StateType::FullContentReceived));
    assert!(!tags.contains(&StateType::Finished));
    assert_eq!(log.count(StateType::Closed), 1);

    let states = log.states();
    let streamed: Vec<u8> = states
        .iter()
        .filter_map(State::chunk)
        .flat_map(|chunk| chunk.to_vec())
        .collect();
    assert_eq!(streamed, b"hello");
}

#[tokio::test]
async fn eof_terminated_response_synthesizes_the_full_body() {
    let server = TestServer::spawn(|mut stream, _| async move {
        let _ = read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\n\r\nno length header")
            .await
            .unwrap();
        stream.flush().await.unwrap();
        // Closing the connection terminates the body.
    })
    .await;

    let log = EventLog::new();
    client()
        .get(&server.url("/eof"))
        .unwrap()
        .on_any(log.observer())
        .execute()
        .unwrap();
    log.wait_closed().await;

    let states = log.states();
    let response = states.iter().find_map(State::response).unwrap();
    assert_eq!(response.text(), "no length header");
    let tags = log.tags();
    let finished_at = tags.iter().position(|t| *t == StateType::Finished).unwrap();
    let closed_at = tags.iter().position(|t| *t == StateType::Closed).unwrap();
    assert!(finished_at < closed_at, "Finished precedes Closed");
}

#[tokio::test]
async fn on_json_marshals_the_aggregate() {
    let server = TestServer::canned(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 24\r\n\r\n{\"name\":\"riptide\",\"n\":3}",
    )
    .await;

    #[derive(serde::Deserialize)]
    struct Payload {
        name: String,
        n: u32,
    }

    let (tx, mut rx) = tokio::sync::mpsc::channel::<(String, u32)>(1);
    let log = EventLog::new();
    let future = client()
        .get(&server.url("/json"))
        .unwrap()
        .on_any(log.observer())
        .execute()
        .unwrap();
    future.on_json::<Payload, _>(move |decoded, _response| {
        if let Ok(payload) = decoded {
            let _ = tx.try_send((payload.name.clone(), payload.n));
        }
    });
    log.wait_closed().await;

    let (name, n) = rx.recv().await.expect("typed payload was delivered");
    assert_eq!(name, "riptide");
    assert_eq!(n, 3);
}

#[tokio::test]
async fn producer_errors_surface_and_close() {
    let server = TestServer::spawn(|mut stream, _| async move {
        let _ = read_head(&mut stream).await;
        // Read whatever arrives until the peer goes away.
        let mut sink = [0u8; 1024];
        loop {
            match tokio::io::AsyncReadExt::read(&mut stream, &mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;

    let log = EventLog::new();
    let future = client()
        .put(&server.url("/upload"))
        .unwrap()
        .send_100_continue(false)
        .chunked_body(|count: usize| -> HttpResult<Option<Bytes>> {
            if count == 0 {
                Ok(Some(Bytes::from_static(b"one")))
            } else {
                Err(riptide::HttpError::Io("producer exploded".into()))
            }
        })
        .on_any(log.observer())
        .execute()
        .unwrap();
    log.wait_closed().await;

    assert!(matches!(
        future.last_error(),
        Some(riptide::HttpError::Io(_))
    ));
    assert_eq!(log.count(StateType::Closed), 1);
    assert_eq!(log.count(StateType::Finished), 0);
}
