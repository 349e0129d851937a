//! Scripted test server and event collection helpers.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use riptide::{State, StateType};

/// A minimal scripted HTTP server bound to an ephemeral local port.
///
/// Each accepted connection is passed to the handler together with its
/// zero-based connection index.
pub struct TestServer {
    pub addr: SocketAddr,
    accept_task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn spawn<F, Fut>(handler: F) -> Self
    where
        F: Fn(TcpStream, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = Arc::new(handler);
        let counter = Arc::new(AtomicUsize::new(0));

        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let index = counter.fetch_add(1, Ordering::SeqCst);
                let handler = handler.clone();
                tokio::spawn(async move { handler(stream, index).await });
            }
        });

        Self { addr, accept_task }
    }

    /// A server that answers every connection with the same raw bytes
    /// after reading the request head.
    pub async fn canned(response: &'static str) -> Self {
        Self::spawn(move |mut stream, _| async move {
            let _ = read_head(&mut stream).await;
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.flush().await;
        })
        .await
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Reads the request head, returning its text and any body bytes that
/// arrived with it.
pub async fn read_head(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(pos) = find_subslice(&buffer, b"\r\n\r\n") {
            let leftover = buffer.split_off(pos + 4);
            return (String::from_utf8_lossy(&buffer).into_owned(), leftover);
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => {
                return (String::from_utf8_lossy(&buffer).into_owned(), Vec::new());
            }
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Reads a complete chunked request body, starting from bytes already
/// buffered past the head.
pub async fn read_chunked_body(stream: &mut TcpStream, leftover: Vec<u8>) -> Vec<u8> {
    let mut buffer = leftover;
    let mut body = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        // Wait for a full size line.
        let line_end = loop {
            if let Some(pos) = find_subslice(&buffer, b"\r\n") {
                break pos;
            }
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed inside chunked body");
            buffer.extend_from_slice(&chunk[..n]);
        };
        let size_text = String::from_utf8_lossy(&buffer[..line_end]).into_owned();
        let size = usize::from_str_radix(size_text.split(';').next().unwrap().trim(), 16).unwrap();
        buffer.drain(..line_end + 2);

        // Wait for the chunk data plus its trailing CRLF.
        while buffer.len() < size + 2 {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed inside chunk data");
            buffer.extend_from_slice(&chunk[..n]);
        }
        body.extend_from_slice(&buffer[..size]);
        buffer.drain(..size + 2);

        if size == 0 {
            return body;
        }
    }
}

/// The first value of `name` in a raw request head.
pub fn find_header(head: &str, name: &str) -> Option<String> {
    head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().to_string())
    })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ---- WebSocket server-side framing ------------------------------------

/// Reads one client frame (masked per RFC 6455), returning `(opcode,
/// payload)`.
pub async fn read_client_frame(stream: &mut TcpStream, buffer: &mut Vec<u8>) -> (u8, Vec<u8>) {
    let mut chunk = [0u8; 4096];
    loop {
        if buffer.len() >= 2 {
            let opcode = buffer[0] & 0x0F;
            let masked = buffer[1] & 0x80 != 0;
            let mut len = (buffer[1] & 0x7F) as usize;
            let mut idx = 2;
            if len == 126 && buffer.len() >= 4 {
                len = u16::from_be_bytes([buffer[2], buffer[3]]) as usize;
                idx = 4;
            }
            let mask_len = if masked { 4 } else { 0 };
            if len < 126 || idx == 4 {
                let total = idx + mask_len + len;
                if buffer.len() >= total {
                    let mask: [u8; 4] = if masked {
                        buffer[idx..idx + 4].try_into().unwrap()
                    } else {
                        [0; 4]
                    };
                    let mut payload: Vec<u8> = buffer[idx + mask_len..total].to_vec();
                    for (i, byte) in payload.iter_mut().enumerate() {
                        *byte ^= mask[i % 4];
                    }
                    buffer.drain(..total);
                    return (opcode, payload);
                }
            }
        }
        match stream.read(&mut chunk).await {
            // A dropped connection reads as a close from the peer.
            Ok(0) | Err(_) => return (0x8, Vec::new()),
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Writes an unmasked server frame, ignoring write failures on a
/// connection the peer already dropped.
pub async fn write_server_frame(stream: &mut TcpStream, opcode: u8, payload: &[u8]) {
    let mut frame = vec![0x80 | opcode];
    if payload.len() < 126 {
        frame.push(payload.len() as u8);
    } else {
        frame.push(126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    frame.extend_from_slice(payload);
    let _ = stream.write_all(&frame).await;
    let _ = stream.flush().await;
}

// ---- event collection --------------------------------------------------

/// Collects every dispatched state for later assertions.
#[derive(Clone)]
pub struct EventLog {
    states: Arc<Mutex<Vec<State>>>,
    notify: Arc<Notify>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            states: Arc::new(Mutex::new(Vec::new())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// The observer to register with `on_any`.
    pub fn observer(&self) -> impl Fn(&State) + Send + Sync + 'static {
        let states = self.states.clone();
        let notify = self.notify.clone();
        move |state| {
            states.lock().unwrap().push(state.clone());
            notify.notify_waiters();
        }
    }

    pub fn states(&self) -> Vec<State> {
        self.states.lock().unwrap().clone()
    }

    pub fn tags(&self) -> Vec<StateType> {
        self.states().iter().map(State::state_type).collect()
    }

    pub fn count(&self, tag: StateType) -> usize {
        self.tags().iter().filter(|t| **t == tag).count()
    }

    /// Waits until the collected states satisfy `predicate`.
    pub async fn wait_for(&self, predicate: impl Fn(&[State]) -> bool) {
        loop {
            let notified = self.notify.notified();
            if predicate(&self.states.lock().unwrap()) {
                return;
            }
            notified.await;
        }
    }

    /// Waits for the terminal `Closed` event.
    pub async fn wait_closed(&self) {
        self.wait_for(|states| {
            states
                .iter()
                .any(|state| state.state_type() == StateType::Closed)
        })
        .await;
    }
}
