//! # riptide
//!
//! An asynchronous, event-driven HTTP/1.1 client with WebSocket upgrade
//! support, built on a shared non-blocking reactor.
//!
//! Instead of blocking calls, a submitted request hands back a
//! [`ResponseFuture`]: a shared handle that fans typed lifecycle events
//! out to registered observers, exposes cancellation, and can defer
//! outbound writes until a chosen state is reached. Many requests to
//! many hosts run concurrently; each connection is driven serially by
//! one reactor task.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use riptide::{Client, StateType};
//!
//! let client = Client::new()?;
//! let future = client
//!     .get("http://example.com/ok")?
//!     .on_finished(|response| println!("{} -> {}", response.status(), response.text()))
//!     .execute()?;
//! future.wait_blocking(None);
//! # Ok::<(), riptide::HttpError>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! riptide/
//! ├── builder.rs     # Fluent request construction
//! ├── channel.rs     # Channel handle carried by Connected
//! ├── client.rs      # Client, bootstraps, redirect retry, shutdown
//! ├── codec.rs       # HTTP/1.1 request encoder / response decoder
//! ├── connection.rs  # The per-submission reactor task
//! ├── cookies.rs     # Cookie jar decoration and extraction
//! ├── decompress.rs  # Transparent gzip/deflate response decoding
//! ├── future.rs      # ResponseFuture: fan-out, cancel, deferred sends
//! ├── handler.rs     # Decoded message -> state event translation
//! ├── info.rs        # Per-submission control block
//! ├── marshal.rs     # Content type registry
//! ├── state.rs       # Lifecycle events with payloads
//! ├── tls.rs         # TLS stage and per-host bootstrap cache
//! └── websocket.rs   # Upgrade handshake and frame codec
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod builder;
pub mod channel;
pub mod client;
pub mod codec;
mod connection;
pub mod cookies;
pub mod decompress;
pub mod future;
mod handler;
mod info;
pub mod marshal;
pub mod state;
pub mod tls;
pub mod websocket;

// Re-export main types for convenience
pub use builder::RequestBuilder;
pub use channel::{ChannelHandle, CloseAction, Outbound};
pub use client::{Client, ClientBuilder, SystemResolver};
pub use cookies::{Cookie, MemoryCookieStore};
pub use future::ResponseFuture;
pub use marshal::{JsonMarshaller, MarshallerRegistry, TextMarshaller};
pub use state::State;
pub use websocket::{accept_key, Handshaker, WsFrame};

// Re-export the foundation layer
pub use riptide_core::{
    ActivityMonitor, Body, ChannelOption, ChannelOptionKey, ChunkedBody, ClientConfig,
    CookieStore, ErrorHook, Headers, HttpError, HttpResult, HttpVersion, Interceptor, Latch,
    Marshaller, Method, Request, Resolver, Response, ResponseHead, StateType, WebSocketVersion,
};
