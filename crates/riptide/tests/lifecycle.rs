//! End-to-end lifecycle behavior against a scripted server.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use url::Url;

use riptide::{Client, HttpError, State, StateType};
use support::{read_head, EventLog, TestServer};

fn client() -> Client {
    Client::builder()
        .reactor(Handle::current())
        .build()
        .unwrap()
}

#[tokio::test]
async fn simple_get_emits_the_full_lifecycle() {
    let server =
        TestServer::canned("HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nOkey dokey").await;
    let log = EventLog::new();
    let future = client()
        .get(&server.url("/ok"))
        .unwrap()
        .on_any(log.observer())
        .execute()
        .unwrap();
    log.wait_closed().await;

    assert_eq!(
        log.tags(),
        vec![
            StateType::Connecting,
            StateType::Connected,
            StateType::SendRequest,
            StateType::AwaitingResponse,
            StateType::HeadersReceived,
            StateType::ContentReceived,
            StateType::FullContentReceived,
            StateType::Finished,
            StateType::Closed,
        ]
    );

    let states = log.states();
    let response = states.iter().find_map(State::response).unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text(), "Okey dokey");
    let aggregate = states.iter().find_map(State::full_content).unwrap();
    assert_eq!(aggregate.len(), 10);
    assert!(future.err_if_failed().is_ok());
}

#[tokio::test]
async fn redirect_chain_stops_at_the_limit() {
    let server = TestServer::spawn(|mut stream, index| async move {
        let _ = read_head(&mut stream).await;
        let response = format!(
            "HTTP/1.1 301 Moved Permanently\r\nLocation: /next/{index}\r\nContent-Length: 0\r\n\r\n"
        );
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.flush().await;
    })
    .await;

    let client = Client::builder()
        .reactor(Handle::current())
        .max_redirects(5)
        .build()
        .unwrap();
    let log = EventLog::new();
    let future = client
        .get(&server.url("/"))
        .unwrap()
        .on_any(log.observer())
        .execute()
        .unwrap();
    log.wait_closed().await;

    assert_eq!(log.count(StateType::Redirect), 5);
    assert_eq!(log.count(StateType::HeadersReceived), 6);
    assert_eq!(log.count(StateType::Finished), 0);
    assert_eq!(log.count(StateType::FullContentReceived), 0);
    assert_eq!(log.count(StateType::Closed), 1);

    let tags = log.tags();
    assert_eq!(
        &tags[tags.len() - 3..],
        &[StateType::HeadersReceived, StateType::Error, StateType::Closed]
    );
    assert!(matches!(future.last_error(), Some(HttpError::RedirectLoop(5))));
}

#[tokio::test]
async fn relative_redirect_resolves_against_origin() {
    let server = TestServer::spawn(|mut stream, index| async move {
        let _ = read_head(&mut stream).await;
        let response = if index == 0 {
            "HTTP/1.1 301 Moved\r\nLocation: /foo/bar\r\nContent-Length: 0\r\n\r\n".to_string()
        } else {
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_string()
        };
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.flush().await;
    })
    .await;

    let log = EventLog::new();
    client()
        .get(&server.url("/"))
        .unwrap()
        .on_any(log.observer())
        .execute()
        .unwrap();
    log.wait_closed().await;

    let states = log.states();
    let redirect = states.iter().find_map(State::next_url).unwrap();
    assert_eq!(
        redirect.as_str(),
        format!("http://{}/foo/bar", server.addr)
    );
    assert_eq!(log.count(StateType::Finished), 1);
}

#[tokio::test]
async fn timeout_before_connect_emits_no_connected() {
    struct Stalling;

    #[async_trait::async_trait]
    impl riptide::Resolver for Stalling {
        async fn resolve(
            &self,
            _host: &str,
            _port: u16,
        ) -> std::io::Result<Vec<std::net::SocketAddr>> {
            std::future::pending().await
        }
    }

    let client = Client::builder()
        .reactor(Handle::current())
        .resolver(Arc::new(Stalling))
        .build()
        .unwrap();
    let log = EventLog::new();
    let future = client
        .get("http://10.0.0.254:3720/abcd")
        .unwrap()
        .timeout(Duration::from_millis(20))
        .on_any(log.observer())
        .execute()
        .unwrap();
    log.wait_closed().await;

    assert_eq!(
        log.tags(),
        vec![
            StateType::Connecting,
            StateType::Timeout,
            StateType::Cancelled,
            StateType::Closed,
        ]
    );
    let states = log.states();
    let elapsed = states.iter().find_map(State::elapsed).unwrap();
    assert!(elapsed >= Duration::from_millis(20));
    assert!(future.is_cancelled());
}

#[tokio::test]
async fn timeout_while_awaiting_response() {
    let server = TestServer::spawn(|mut stream, _| async move {
        let _ = read_head(&mut stream).await;
        // Hold the connection open without ever responding.
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stream);
    })
    .await;

    let log = EventLog::new();
    client()
        .get(&server.url("/slow"))
        .unwrap()
        .timeout(Duration::from_millis(50))
        .on_any(log.observer())
        .execute()
        .unwrap();
    log.wait_closed().await;

    assert_eq!(
        log.tags(),
        vec![
            StateType::Connecting,
            StateType::Connected,
            StateType::SendRequest,
            StateType::AwaitingResponse,
            StateType::Timeout,
            StateType::Cancelled,
            StateType::Closed,
        ]
    );
}

#[tokio::test]
async fn cancel_suppresses_subsequent_events() {
    let server = TestServer::spawn(|mut stream, _| async move {
        let _ = read_head(&mut stream).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        let _ = stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nx")
            .await;
    })
    .await;

    let log = EventLog::new();
    let future = client()
        .get(&server.url("/"))
        .unwrap()
        .on_any(log.observer())
        .execute()
        .unwrap();
    log.wait_for(|states| {
        states
            .iter()
            .any(|s| s.state_type() == StateType::AwaitingResponse)
    })
    .await;

    assert!(future.cancel());
    assert!(!future.cancel(), "cancel is idempotent");
    log.wait_closed().await;

    let tags = log.tags();
    assert!(!tags.contains(&StateType::HeadersReceived));
    assert!(!tags.contains(&StateType::ContentReceived));
    assert!(!tags.contains(&StateType::Finished));
    assert_eq!(
        &tags[tags.len() - 2..],
        &[StateType::Cancelled, StateType::Closed]
    );
}

#[tokio::test]
async fn empty_body_suppresses_full_content_and_finished() {
    let server = TestServer::canned("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
    let log = EventLog::new();
    client()
        .get(&server.url("/empty"))
        .unwrap()
        .on_any(log.observer())
        .execute()
        .unwrap();
    log.wait_closed().await;

    let tags = log.tags();
    assert!(tags.contains(&StateType::HeadersReceived));
    assert!(!tags.contains(&StateType::FullContentReceived));
    assert!(!tags.contains(&StateType::Finished));
    assert_eq!(log.count(StateType::Closed), 1);
}

#[tokio::test]
async fn duplicate_header_order_is_preserved_on_the_wire() {
    let (head_tx, mut head_rx) = tokio::sync::mpsc::channel::<String>(1);
    let server = TestServer::spawn(move |mut stream, _| {
        let head_tx = head_tx.clone();
        async move {
            let (head, _) = read_head(&mut stream).await;
            let _ = head_tx.send(head).await;
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await;
            let _ = stream.flush().await;
        }
    })
    .await;

    let log = EventLog::new();
    client()
        .get(&server.url("/order"))
        .unwrap()
        .header("X-Dup", "a")
        .header("X-Zed", "z")
        .header("X-Dup", "b")
        .header("X-Dup", "c")
        .on_any(log.observer())
        .execute()
        .unwrap();
    log.wait_closed().await;

    let head = head_rx.recv().await.unwrap();
    let a = head.find("X-Dup: a").unwrap();
    let z = head.find("X-Zed: z").unwrap();
    let b = head.find("X-Dup: b").unwrap();
    let c = head.find("X-Dup: c").unwrap();
    assert!(a < z && z < b && b < c, "wire order was disturbed:\n{head}");
}

#[tokio::test]
async fn activity_monitors_observe_every_request() {
    let server = TestServer::canned("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;

    let seen: Arc<Mutex<Vec<(StateType, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let client = Client::builder()
        .reactor(Handle::current())
        .activity_monitor(Arc::new(move |tag: StateType, url: &Url| {
            sink.lock().unwrap().push((tag, url.path().to_string()));
        }))
        .build()
        .unwrap();

    let log_a = EventLog::new();
    let log_b = EventLog::new();
    client
        .get(&server.url("/a"))
        .unwrap()
        .on_any(log_a.observer())
        .execute()
        .unwrap();
    client
        .get(&server.url("/b"))
        .unwrap()
        .on_any(log_b.observer())
        .execute()
        .unwrap();
    log_a.wait_closed().await;
    log_b.wait_closed().await;

    let seen = seen.lock().unwrap();
    assert!(seen.contains(&(StateType::Closed, "/a".to_string())));
    assert!(seen.contains(&(StateType::Closed, "/b".to_string())));
    assert!(seen.contains(&(StateType::Finished, "/a".to_string())));
    assert!(seen.contains(&(StateType::Finished, "/b".to_string())));
}

#[test]
fn owned_reactor_request_and_bounded_shutdown() {
    use std::io::{Read, Write};

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut head = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let Ok(n) = stream.read(&mut chunk) else { break };
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&chunk[..n]);
                if head.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
        }
    });

    let client = Client::builder().thread_count(2).build().unwrap();
    let future = client
        .get(&format!("http://{addr}/"))
        .unwrap()
        .execute()
        .unwrap();

    let terminal = future.wait_blocking(Some(Duration::from_secs(10)));
    assert!(terminal.is_some(), "request never reached a terminal state");
    assert!(future.err_if_failed().is_ok());
    client.shutdown();
}
