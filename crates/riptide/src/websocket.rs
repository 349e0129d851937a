//! WebSocket upgrade handshake and frame codec.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tokio_util::codec::{Decoder, Encoder};
use url::Url;

use riptide_core::{Headers, HttpError, HttpResult, ResponseHead, WebSocketVersion};

/// Handshake GUID from RFC 6455 §1.3.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default bound on a single frame's payload.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 65_536;

/// Computes the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut digest = Sha1::new();
    digest.update(key.as_bytes());
    digest.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(digest.finalize())
}

/// Encapsulates WebSocket upgrade negotiation state for one request.
///
/// Bound to the request URL, the chosen subprotocol (none by default),
/// the frame size limit, and the configured protocol version.
#[derive(Clone)]
pub struct Handshaker {
    url: Url,
    version: WebSocketVersion,
    subprotocol: Option<String>,
    max_frame_size: usize,
    key: String,
}

impl Handshaker {
    /// Creates a handshaker for `url` with a fresh nonce.
    pub fn new(url: Url, version: WebSocketVersion) -> Self {
        let mut nonce = [0u8; 16];
        for byte in &mut nonce {
            *byte = fastrand::u8(..);
        }
        Self {
            url,
            version,
            subprotocol: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            key: BASE64.encode(nonce),
        }
    }

    /// Selects a subprotocol to offer.
    pub fn with_subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocol = Some(subprotocol.into());
        self
    }

    /// Overrides the frame payload bound.
    pub fn with_max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// The URL the handshake is bound to.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The negotiated protocol version.
    pub fn version(&self) -> WebSocketVersion {
        self.version
    }

    /// The frame payload bound enforced after the upgrade.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// The client nonce sent in `Sec-WebSocket-Key`.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Adds the upgrade headers to an outgoing request, leaving any
    /// user-provided `Connection`/`Upgrade` values in place.
    pub fn apply_request_headers(&self, headers: &mut Headers) {
        if !headers.contains_token("Connection", "Upgrade") {
            headers.set("Connection", "Upgrade");
        }
        if !headers.contains("Upgrade") {
            headers.set("Upgrade", "websocket");
        }
        headers.set("Sec-WebSocket-Key", self.key.clone());
        headers.set("Sec-WebSocket-Version", self.version.number().to_string());
        if let Some(subprotocol) = &self.subprotocol {
            headers.set("Sec-WebSocket-Protocol", subprotocol.clone());
        }
    }

    /// Verifies the server's handshake response.
    pub fn verify(&self, head: &ResponseHead) -> HttpResult<()> {
        let expected = accept_key(&self.key);
        match head.headers.get("Sec-WebSocket-Accept") {
            Some(accept) if accept.trim() == expected => Ok(()),
            Some(accept) => Err(HttpError::WebSocketHandshake(format!(
                "Sec-WebSocket-Accept mismatch: expected {expected}, got {accept}"
            ))),
            None => Err(HttpError::WebSocketHandshake(
                "response is missing Sec-WebSocket-Accept".into(),
            )),
        }
    }
}

impl fmt::Debug for Handshaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshaker")
            .field("url", &self.url.as_str())
            .field("version", &self.version)
            .field("subprotocol", &self.subprotocol)
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

/// A decoded WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    /// A text frame; payload is valid UTF-8.
    Text(String),
    /// A binary frame.
    Binary(Bytes),
    /// A ping control frame.
    Ping(Bytes),
    /// A pong control frame.
    Pong(Bytes),
    /// A close control frame.
    Close {
        /// Optional close status code.
        code: Option<u16>,
        /// Close reason, possibly empty.
        reason: String,
    },
}

impl WsFrame {
    /// Creates a text frame.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Creates a binary frame.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    /// Whether this is a control frame (ping, pong, close).
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Ping(_) | Self::Pong(_) | Self::Close { .. })
    }

    fn opcode(&self) -> u8 {
        match self {
            Self::Text(_) => 0x1,
            Self::Binary(_) => 0x2,
            Self::Close { .. } => 0x8,
            Self::Ping(_) => 0x9,
            Self::Pong(_) => 0xA,
        }
    }

    fn payload(&self) -> Bytes {
        match self {
            Self::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            Self::Binary(data) | Self::Ping(data) | Self::Pong(data) => data.clone(),
            Self::Close { code, reason } => {
                let mut payload = BytesMut::new();
                if let Some(code) = code {
                    payload.put_u16(*code);
                    payload.extend_from_slice(reason.as_bytes());
                }
                payload.freeze()
            }
        }
    }
}

/// RFC 6455 frame codec.
///
/// The client role masks every outgoing frame; inbound frames from a
/// conforming server arrive unmasked, but masked input is tolerated.
/// Fragmented data frames are reassembled before delivery.
#[derive(Debug)]
pub struct WsCodec {
    max_frame_size: usize,
    fragment: Option<(u8, BytesMut)>,
}

impl WsCodec {
    /// Creates a codec enforcing `max_frame_size` on payloads.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            fragment: None,
        }
    }

    fn assemble(&self, opcode: u8, payload: BytesMut) -> HttpResult<WsFrame> {
        match opcode {
            0x1 => String::from_utf8(payload.to_vec())
                .map(WsFrame::Text)
                .map_err(|e| HttpError::Codec(format!("invalid UTF-8 in text frame: {e}"))),
            0x2 => Ok(WsFrame::Binary(payload.freeze())),
            0x8 => {
                if payload.len() >= 2 {
                    let code = u16::from_be_bytes([payload[0], payload[1]]);
                    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
                    Ok(WsFrame::Close {
                        code: Some(code),
                        reason,
                    })
                } else {
                    Ok(WsFrame::Close {
                        code: None,
                        reason: String::new(),
                    })
                }
            }
            0x9 => Ok(WsFrame::Ping(payload.freeze())),
            0xA => Ok(WsFrame::Pong(payload.freeze())),
            other => Err(HttpError::Codec(format!("unknown frame opcode {other:#x}"))),
        }
    }
}

impl Decoder for WsCodec {
    type Item = WsFrame;
    type Error = HttpError;

    fn decode(&mut self, src: &mut BytesMut) -> HttpResult<Option<WsFrame>> {
        loop {
            if src.len() < 2 {
                return Ok(None);
            }
            let fin = src[0] & 0x80 != 0;
            let opcode = src[0] & 0x0F;
            let masked = src[1] & 0x80 != 0;

            let (length, mut header_len) = match src[1] & 0x7F {
                126 => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
                }
                127 => {
                    if src.len() < 10 {
                        return Ok(None);
                    }
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&src[2..10]);
                    (u64::from_be_bytes(raw), 10)
                }
                short => (u64::from(short), 2),
            };

            if length > self.max_frame_size as u64 {
                return Err(HttpError::Codec(format!(
                    "frame payload of {length} bytes exceeds limit of {}",
                    self.max_frame_size
                )));
            }

            let mask_len = if masked { 4 } else { 0 };
            let total = header_len + mask_len + length as usize;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            let mask = if masked {
                let key = [
                    src[header_len],
                    src[header_len + 1],
                    src[header_len + 2],
                    src[header_len + 3],
                ];
                header_len += 4;
                Some(key)
            } else {
                None
            };

            let _ = src.split_to(header_len);
            let mut payload = src.split_to(length as usize);
            if let Some(key) = mask {
                for (i, byte) in payload.iter_mut().enumerate() {
                    *byte ^= key[i % 4];
                }
            }

            match (opcode, fin) {
                // Continuation of a fragmented data frame.
                (0x0, fin) => {
                    let Some((first_opcode, mut buffer)) = self.fragment.take() else {
                        return Err(HttpError::Codec(
                            "continuation frame without a preceding data frame".into(),
                        ));
                    };
                    if buffer.len() + payload.len() > self.max_frame_size {
                        return Err(HttpError::Codec(format!(
                            "reassembled payload exceeds limit of {}",
                            self.max_frame_size
                        )));
                    }
                    buffer.extend_from_slice(&payload);
                    if fin {
                        return self.assemble(first_opcode, buffer).map(Some);
                    }
                    self.fragment = Some((first_opcode, buffer));
                }
                (0x1 | 0x2, false) => {
                    if self.fragment.is_some() {
                        return Err(HttpError::Codec("interleaved fragmented frames".into()));
                    }
                    self.fragment = Some((opcode, payload));
                }
                (0x1 | 0x2 | 0x8 | 0x9 | 0xA, true) => {
                    return self.assemble(opcode, payload).map(Some);
                }
                (other, _) => {
                    return Err(HttpError::Codec(format!("unknown frame opcode {other:#x}")));
                }
            }
        }
    }
}

impl Encoder<WsFrame> for WsCodec {
    type Error = HttpError;

    fn encode(&mut self, frame: WsFrame, dst: &mut BytesMut) -> HttpResult<()> {
        let payload = frame.payload();
        dst.reserve(payload.len() + 14);
        dst.put_u8(0x80 | frame.opcode());

        match payload.len() {
            len if len < 126 => dst.put_u8(0x80 | len as u8),
            len if len <= u16::MAX as usize => {
                dst.put_u8(0x80 | 126);
                dst.put_u16(len as u16);
            }
            len => {
                dst.put_u8(0x80 | 127);
                dst.put_u64(len as u64);
            }
        }

        let mask = fastrand::u32(..).to_be_bytes();
        dst.extend_from_slice(&mask);
        for (i, byte) in payload.iter().enumerate() {
            dst.put_u8(byte ^ mask[i % 4]);
        }
        Ok(())
    }
}
