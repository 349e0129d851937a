//! The per-submission connection task.
//!
//! Each submission runs as one task on the reactor; all decode, encode,
//! and observer invocations for the connection happen serially here.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{Framed, FramedParts};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use riptide_core::{Body, ChannelOption, ChannelOptionKey, ChunkedBody, HttpError};

use crate::channel::{ChannelHandle, Outbound};
use crate::client::ClientCore;
use crate::codec::{Http1Codec, OutboundHttp};
use crate::future::ResponseFuture;
use crate::handler::{MessageHandler, Step};
use crate::info::RequestInfo;
use crate::state::State;
use crate::tls::MaybeTlsStream;
use crate::websocket::{WsCodec, WsFrame};

/// Outbound queue depth per connection.
const OUTBOUND_QUEUE: usize = 64;

enum Interrupt {
    Deadline,
    Cancelled,
}

enum Exit {
    Stop,
    Upgrade,
}

async fn maybe_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Races `work` against the deadline and the cancellation token.
async fn guarded<T>(
    deadline: Option<Instant>,
    token: &CancellationToken,
    work: impl Future<Output = T>,
) -> Result<T, Interrupt> {
    tokio::select! {
        () = token.cancelled() => Err(Interrupt::Cancelled),
        () = maybe_sleep(deadline) => Err(Interrupt::Deadline),
        out = work => Ok(out),
    }
}

/// The deadline fired: emit `Timeout(elapsed)` then `Cancelled`, unless
/// already cancelled.
fn fire_timeout(future: &ResponseFuture, info: &RequestInfo) {
    if future.is_cancelled() {
        return;
    }
    future.dispatch(State::Timeout(info.started_at.elapsed()));
    if future.mark_cancelled() {
        future.dispatch(State::Cancelled);
    }
}

/// Runs one submission attempt end to end.
///
/// Every exit path cancels the attempt token and emits `Closed` exactly
/// once, unless the attempt was silenced by a redirect hand-off.
pub(crate) async fn run_submission(
    core: Arc<ClientCore>,
    info: RequestInfo,
    future: Arc<ResponseFuture>,
) {
    let attachment = Arc::new(ArcSwap::from_pointee(info));
    let mut handler = MessageHandler::new(core.clone(), future.clone(), attachment.clone());
    let info = attachment.load_full();

    let token = CancellationToken::new();
    future.arm_attempt(token.clone());
    if future.is_cancelled() {
        token.cancel();
    }

    future.set_current_url(info.url.clone());
    future.dispatch(State::Connecting);

    drive(&core, &info, &future, &mut handler, &attachment, &token).await;

    token.cancel();
    if attachment.load().silenced {
        trace!("connection handed off to a redirect attempt for {}", info.url);
    } else {
        future.dispatch(State::Closed);
    }
}

#[allow(clippy::too_many_lines)]
async fn drive(
    core: &Arc<ClientCore>,
    info: &Arc<RequestInfo>,
    future: &Arc<ResponseFuture>,
    handler: &mut MessageHandler,
    attachment: &Arc<ArcSwap<RequestInfo>>,
    token: &CancellationToken,
) {
    let deadline = info.deadline;

    let addrs = match guarded(deadline, token, core.resolve(&info.url)).await {
        Ok(Ok(addrs)) if !addrs.is_empty() => addrs,
        Ok(Ok(_)) => {
            handler.on_error(HttpError::Resolve(format!(
                "no addresses for {}",
                info.url
            )));
            return;
        }
        Ok(Err(error)) => {
            handler.on_error(HttpError::Resolve(error.to_string()));
            return;
        }
        Err(Interrupt::Deadline) => return fire_timeout(future, info),
        Err(Interrupt::Cancelled) => return,
    };

    let tcp = match guarded(deadline, token, connect_tcp(core, addrs)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => {
            handler.on_error(HttpError::Connect(error.to_string()));
            future.mark_cancelled();
            return;
        }
        Err(Interrupt::Deadline) => return fire_timeout(future, info),
        Err(Interrupt::Cancelled) => return,
    };

    let stream = if info.url.scheme() == "https" {
        let host = info.url.host_str().unwrap_or_default().to_string();
        let port = info.url.port_or_known_default().unwrap_or(443);
        let handshake = async {
            let bootstrap = core.tls.bootstrap(&host, port).await?;
            bootstrap.wrap(tcp).await
        };
        match guarded(deadline, token, handshake).await {
            Ok(Ok(tls)) => MaybeTlsStream::Tls(Box::new(tls)),
            Ok(Err(error)) => {
                handler.on_error(error);
                return;
            }
            Err(Interrupt::Deadline) => return fire_timeout(future, info),
            Err(Interrupt::Cancelled) => return,
        }
    } else {
        MaybeTlsStream::Plain(tcp)
    };

    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
    let channel = ChannelHandle::new(out_tx, token.clone());
    future.attach_channel(channel.clone());
    future.dispatch(State::Connected(channel));

    // Interceptors and cookie decoration run here, immediately before
    // the write; the emitted snapshot is what goes on the wire.
    let wire_request = Arc::new(core.finalize_request(info));
    future.dispatch(State::SendRequest(wire_request.clone()));

    let codec = Http1Codec::new(
        core.config.max_initial_line_length,
        core.config.max_headers_size,
        core.config.max_chunk_size,
    );
    let mut framed = Framed::new(stream, codec);

    match guarded(
        deadline,
        token,
        framed.send(OutboundHttp::Request(wire_request.clone())),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            handler.on_error(error);
            return;
        }
        Err(Interrupt::Deadline) => return fire_timeout(future, info),
        Err(Interrupt::Cancelled) => return,
    }

    let expects_continue = wire_request.headers.contains("Expect");
    if let Body::Chunked(producer) = &wire_request.body {
        if expects_continue {
            future.dispatch(State::AwaitingResponse);
        } else if pump_chunked_body(handler, future, info, &mut framed, producer.clone(), deadline, token)
            .await
            .is_err()
        {
            return;
        }
    } else {
        future.dispatch(State::AwaitingResponse);
    }

    let mut armed_deadline = deadline;
    let mut outbound_open = true;
    let exit = loop {
        tokio::select! {
            () = token.cancelled() => break Exit::Stop,
            () = maybe_sleep(armed_deadline) => {
                fire_timeout(future, info);
                break Exit::Stop;
            }
            item = out_rx.recv(), if outbound_open => match item {
                Some(Outbound::Data(data)) => {
                    if let Err(error) = framed.send(OutboundHttp::Raw(data)).await {
                        handler.on_error(error);
                        break Exit::Stop;
                    }
                }
                Some(Outbound::Frame(_)) => {
                    warn!("dropping WebSocket frame queued before the upgrade completed");
                }
                None => outbound_open = false,
            },
            frame = framed.next() => match frame {
                Some(Ok(frame)) => match handler.handle_frame(frame) {
                    Step::Continue => {
                        if handler.response_complete() {
                            // The deadline timer is cancelled once the
                            // full response has been delivered.
                            armed_deadline = None;
                        }
                    }
                    Step::SendChunkedBody => {
                        if let Body::Chunked(producer) = &wire_request.body {
                            if pump_chunked_body(
                                handler,
                                future,
                                info,
                                &mut framed,
                                producer.clone(),
                                armed_deadline,
                                token,
                            )
                            .await
                            .is_err()
                            {
                                break Exit::Stop;
                            }
                        }
                    }
                    Step::UpgradeWebSocket => break Exit::Upgrade,
                    Step::Abandon => break Exit::Stop,
                },
                Some(Err(error)) => handler.on_error(error),
                None => {
                    handler.on_channel_inactive();
                    break Exit::Stop;
                }
            }
        }
    };

    if matches!(exit, Exit::Upgrade) {
        run_websocket(
            info,
            future,
            handler,
            attachment,
            &mut out_rx,
            framed,
            token,
            armed_deadline,
        )
        .await;
    }
}

/// Pulls producer chunks one at a time, flushing each before the next,
/// then writes the zero-length terminal chunk and emits
/// `AwaitingResponse`.
async fn pump_chunked_body(
    handler: &mut MessageHandler,
    future: &Arc<ResponseFuture>,
    info: &Arc<RequestInfo>,
    framed: &mut Framed<MaybeTlsStream, Http1Codec>,
    producer: Arc<dyn ChunkedBody>,
    deadline: Option<Instant>,
    token: &CancellationToken,
) -> Result<(), ()> {
    let mut call_count = 0usize;
    loop {
        let chunk = match producer.next_chunk(call_count) {
            Ok(chunk) => chunk,
            Err(error) => {
                handler.on_error(error);
                return Err(());
            }
        };
        call_count += 1;

        let (item, finished) = match chunk {
            Some(data) => (OutboundHttp::BodyChunk(data), false),
            None => (OutboundHttp::LastBodyChunk, true),
        };
        match guarded(deadline, token, framed.send(item)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                handler.on_error(error);
                return Err(());
            }
            Err(Interrupt::Deadline) => {
                fire_timeout(future, info);
                return Err(());
            }
            Err(Interrupt::Cancelled) => return Err(()),
        }
        if finished {
            debug!("chunked body complete after {} pulls", call_count);
            future.dispatch(State::AwaitingResponse);
            return Ok(());
        }
    }
}

/// The post-upgrade phase: swap the HTTP codec for the WebSocket codec,
/// announce completion (which drains queued frames), and dispatch
/// inbound frames.
#[allow(clippy::too_many_arguments)]
async fn run_websocket(
    info: &Arc<RequestInfo>,
    future: &Arc<ResponseFuture>,
    handler: &mut MessageHandler,
    attachment: &Arc<ArcSwap<RequestInfo>>,
    out_rx: &mut mpsc::Receiver<Outbound>,
    framed: Framed<MaybeTlsStream, Http1Codec>,
    token: &CancellationToken,
    deadline: Option<Instant>,
) {
    if !handler.websocket_ready() {
        handler.on_error(HttpError::WebSocketHandshake(
            "upgrade without a verified handshake".into(),
        ));
        return;
    }
    let Some(handshaker) = attachment.load().websocket.clone() else {
        handler.on_error(HttpError::WebSocketHandshake(
            "upgrade response without a handshaker".into(),
        ));
        return;
    };
    let max_frame_size = handshaker.max_frame_size();

    // Re-frame the stream, keeping any bytes already buffered: frames
    // the server sent right after the 101 are preserved.
    let parts = framed.into_parts();
    let mut ws_parts = FramedParts::new::<WsFrame>(parts.io, WsCodec::new(max_frame_size));
    ws_parts.read_buf = parts.read_buf;
    ws_parts.write_buf = parts.write_buf;
    let mut ws = Framed::from_parts(ws_parts);

    future.dispatch(State::WebsocketHandshakeComplete(Arc::new(handshaker)));

    let mut outbound_open = true;
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            () = maybe_sleep(deadline) => {
                fire_timeout(future, info);
                return;
            }
            item = out_rx.recv(), if outbound_open => match item {
                Some(Outbound::Frame(frame)) => {
                    if let Err(error) = ws.send(frame).await {
                        handler.on_error(error);
                        return;
                    }
                }
                Some(Outbound::Data(data)) => {
                    trace!("dropping {} raw bytes queued after the upgrade", data.len());
                }
                None => outbound_open = false,
            },
            frame = ws.next() => match frame {
                Some(Ok(frame)) => match frame {
                    WsFrame::Ping(payload) => {
                        handler.on_ws_frame(WsFrame::Ping(payload.clone()));
                        if let Err(error) = ws.send(WsFrame::Pong(payload)).await {
                            handler.on_error(error);
                            return;
                        }
                    }
                    WsFrame::Close { code, reason } => {
                        handler.on_ws_frame(WsFrame::Close {
                            code,
                            reason: reason.clone(),
                        });
                        let _ = ws.send(WsFrame::Close { code, reason }).await;
                        return;
                    }
                    other => handler.on_ws_frame(other),
                },
                Some(Err(error)) => handler.on_error(error),
                None => {
                    handler.on_channel_inactive();
                    return;
                }
            }
        }
    }
}

/// Opens a TCP connection, applying the configured channel options.
async fn connect_tcp(core: &ClientCore, addrs: Vec<SocketAddr>) -> io::Result<TcpStream> {
    let options = &core.config.channel_options;
    let mut last_error = None;

    for addr in addrs {
        let socket = if addr.is_ipv6() {
            TcpSocket::new_v6()
        } else {
            TcpSocket::new_v4()
        }?;
        for option in options.values() {
            match option {
                ChannelOption::SoKeepAlive(enabled) => socket.set_keepalive(*enabled)?,
                ChannelOption::SendBufferSize(size) => socket.set_send_buffer_size(*size)?,
                ChannelOption::RecvBufferSize(size) => socket.set_recv_buffer_size(*size)?,
                ChannelOption::TcpNoDelay(_) | ChannelOption::ConnectTimeout(_) => {}
            }
        }

        let connect = socket.connect(addr);
        let connected = match options.get(&ChannelOptionKey::ConnectTimeout) {
            Some(ChannelOption::ConnectTimeout(limit)) => {
                match tokio::time::timeout(*limit, connect).await {
                    Ok(result) => result,
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {addr} timed out"),
                    )),
                }
            }
            _ => connect.await,
        };

        match connected {
            Ok(stream) => {
                if let Some(ChannelOption::TcpNoDelay(enabled)) =
                    options.get(&ChannelOptionKey::TcpNoDelay)
                {
                    stream.set_nodelay(*enabled)?;
                }
                return Ok(stream);
            }
            Err(error) => {
                debug!("connect to {addr} failed: {error}");
                last_error = Some(error);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses to connect")))
}
