//! # riptide-core
//!
//! Foundation layer for the riptide asynchronous HTTP/1.1 + WebSocket
//! client. This crate holds the I/O-free building blocks shared by the
//! client crate and by user code:
//!
//! - the request lifecycle taxonomy ([`StateType`])
//! - the error taxonomy ([`HttpError`])
//! - the insertion-ordered header multimap ([`Headers`])
//! - request/response value types ([`Request`], [`ResponseHead`], [`Response`])
//! - the client configuration surface ([`ClientConfig`])
//! - the collaborator traits ([`CookieStore`], [`Interceptor`], [`Marshaller`],
//!   [`Resolver`], [`ActivityMonitor`])
//! - the one-shot completion latch ([`Latch`])
//!
//! Nothing in this crate performs network I/O.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod headers;
pub mod request;
pub mod response;
pub mod signal;
pub mod state;
pub mod traits;

pub use config::{ChannelOption, ChannelOptionKey, ClientConfig};
pub use error::{HttpError, HttpResult};
pub use headers::Headers;
pub use request::{Body, ChunkedBody, HttpVersion, Method, Request, WebSocketVersion};
pub use response::{Response, ResponseHead};
pub use signal::Latch;
pub use state::StateType;
pub use traits::{ActivityMonitor, CookieStore, ErrorHook, Interceptor, Marshaller, Resolver};
