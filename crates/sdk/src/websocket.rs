//! The framed WebSocket transport.
//!
//! One connection speaks the `v1.bsatn.spacetimedb` subprotocol. Every
//! server frame starts with a one-byte compression tag; gzip frames are
//! inflated here, inline in the socket task, so payloads reach the dispatch
//! channel in exactly their arrival order. Client frames are never
//! compressed.
//!
//! If an auth token is configured, connecting first exchanges it for a
//! short-lived token over HTTP; only the short-lived token ever appears in
//! the subscribe URL.

use crate::error::SdkError;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use futures_channel::mpsc;
use http::uri::{Parts, Scheme, Uri};
use spacetimedb_client_api_messages::websocket::{
    BIN_PROTOCOL, Compression, SERVER_MSG_COMPRESSION_TAG_BROTLI, SERVER_MSG_COMPRESSION_TAG_GZIP,
    SERVER_MSG_COMPRESSION_TAG_NONE,
};
use spacetimedb_sats::ConnectionId;
use std::io::Read;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::{runtime, task::JoinHandle};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WebSocketMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

#[derive(Error, Debug)]
pub enum WsError {
    #[error("unknown URI scheme {scheme}, expected http, https, ws or wss")]
    UnsupportedScheme { scheme: Box<str> },

    #[error("connect URI has no host")]
    MissingHost,

    #[error("invalid URI: {0}")]
    Uri(#[from] http::uri::InvalidUri),

    #[error("invalid URI parts: {0}")]
    UriParts(#[from] http::uri::InvalidUriParts),

    #[error("token exchange POST failed with HTTP status {status}")]
    TokenExchange { status: u16 },

    #[error("token exchange request failed: {0}")]
    TokenRequest(#[from] reqwest::Error),

    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("websocket transport error: {0}")]
    Transport(tokio_tungstenite::tungstenite::Error),

    #[error("received an empty binary frame")]
    EmptyFrame,

    #[error("received a Brotli-compressed frame, but Brotli is unsupported; negotiate Gzip or None")]
    BrotliUnsupported,

    #[error("unknown frame compression tag {tag:#x}")]
    UnknownCompressionTag { tag: u8 },

    #[error("failed to inflate gzip-compressed frame: {0}")]
    Gzip(std::io::Error),
}

/// Frame-level options negotiated on the subscribe URL.
#[derive(Clone, Debug, Default)]
pub(crate) struct WsConfig {
    pub(crate) compression: Compression,
    pub(crate) light: bool,
    pub(crate) confirmed: Option<bool>,
}

/// Something the connection wants the socket task to do.
pub(crate) enum WsSend {
    /// Transmit an already-encoded client message.
    Message(Vec<u8>),
    /// Begin a graceful close handshake.
    Close,
}

/// Something the socket task observed, in arrival order.
pub(crate) enum TransportEvent {
    /// A frame's payload, compression tag stripped and gzip inflated.
    Message(Vec<u8>),
    /// A fatal transport condition. No further messages follow.
    Error(SdkError),
    /// The socket closed. No further messages follow.
    Closed,
}

/// Strip the compression tag byte and inflate the payload if required.
pub(crate) fn decode_frame(frame: &[u8]) -> Result<Vec<u8>, WsError> {
    match frame.split_first() {
        None => Err(WsError::EmptyFrame),
        Some((&SERVER_MSG_COMPRESSION_TAG_NONE, payload)) => Ok(payload.to_vec()),
        Some((&SERVER_MSG_COMPRESSION_TAG_BROTLI, _)) => Err(WsError::BrotliUnsupported),
        Some((&SERVER_MSG_COMPRESSION_TAG_GZIP, payload)) => {
            let mut inflated = Vec::new();
            flate2::read::GzDecoder::new(payload)
                .read_to_end(&mut inflated)
                .map_err(WsError::Gzip)?;
            Ok(inflated)
        }
        Some((&tag, _)) => Err(WsError::UnknownCompressionTag { tag }),
    }
}

/// Rewrite the connect URI's scheme for the WebSocket handshake.
fn ws_scheme(scheme: Option<&Scheme>) -> Result<&'static str, WsError> {
    match scheme.map(Scheme::as_str) {
        Some("http") | Some("ws") | None => Ok("ws"),
        Some("https") | Some("wss") => Ok("wss"),
        Some(other) => Err(WsError::UnsupportedScheme { scheme: other.into() }),
    }
}

/// Rewrite the connect URI's scheme for the token-exchange POST.
fn http_scheme(scheme: Option<&Scheme>) -> Result<&'static str, WsError> {
    match scheme.map(Scheme::as_str) {
        Some("http") | Some("ws") | None => Ok("http"),
        Some("https") | Some("wss") => Ok("https"),
        Some(other) => Err(WsError::UnsupportedScheme { scheme: other.into() }),
    }
}

fn base_path(parts: &Parts) -> String {
    let mut path = parts
        .path_and_query
        .as_ref()
        .map(|pq| pq.path().to_string())
        .unwrap_or_default();
    if !path.ends_with('/') {
        path.push('/');
    }
    path
}

/// The subscribe URL:
/// `{base}/v1/database/{db_name}/subscribe?compression=…[&light=true][&confirmed=…][&token=…]&connection_id={hex}`.
pub(crate) fn make_uri(
    host: &Uri,
    db_name: &str,
    connection_id: ConnectionId,
    short_lived_token: Option<&str>,
    config: &WsConfig,
) -> Result<Uri, WsError> {
    let mut parts = host.clone().into_parts();
    let mut path = base_path(&parts);
    path.push_str("v1/database/");
    path.push_str(db_name);
    path.push_str("/subscribe");

    path.push_str("?compression=");
    path.push_str(config.compression.as_query_param());
    if config.light {
        path.push_str("&light=true");
    }
    if let Some(confirmed) = config.confirmed {
        path.push_str(if confirmed { "&confirmed=true" } else { "&confirmed=false" });
    }
    if let Some(token) = short_lived_token {
        path.push_str("&token=");
        path.push_str(token);
    }
    path.push_str("&connection_id=");
    path.push_str(&connection_id.to_hex());

    parts.scheme = Some(ws_scheme(parts.scheme.as_ref())?.parse()?);
    if parts.authority.is_none() {
        return Err(WsError::MissingHost);
    }
    parts.path_and_query = Some(path.parse()?);
    Ok(Uri::try_from(parts)?)
}

/// The token-exchange URL: `{base}/v1/identity/websocket-token`.
fn make_token_exchange_uri(host: &Uri) -> Result<Uri, WsError> {
    let mut parts = host.clone().into_parts();
    let mut path = base_path(&parts);
    path.push_str("v1/identity/websocket-token");
    parts.scheme = Some(http_scheme(parts.scheme.as_ref())?.parse()?);
    parts.path_and_query = Some(path.parse()?);
    Ok(Uri::try_from(parts)?)
}

#[derive(serde::Deserialize)]
struct WebsocketTokenResponse {
    token: String,
}

/// Trade the configured auth token for a short-lived one to place in the
/// subscribe URL. The original token travels only in the Authorization
/// header.
async fn exchange_token(host: &Uri, token: &str) -> Result<String, WsError> {
    let uri = make_token_exchange_uri(host)?;
    let response = reqwest::Client::new()
        .post(uri.to_string())
        .bearer_auth(token)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(WsError::TokenExchange {
            status: response.status().as_u16(),
        });
    }
    Ok(response.json::<WebsocketTokenResponse>().await?.token)
}

// Tungstenite doesn't offer an interface to specify a WebSocket protocol,
// so we insert the header into the `Request` constructed by
// `tungstenite::IntoClientRequest::into_client_request` ourselves.
fn request_insert_protocol_header(req: &mut http::Request<()>) {
    req.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        http::header::HeaderValue::from_static(BIN_PROTOCOL),
    );
}

pub(crate) struct WsConnection {
    read: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    write: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WebSocketMessage>,
}

impl WsConnection {
    pub(crate) async fn connect(
        host: Uri,
        db_name: &str,
        token: Option<&str>,
        connection_id: ConnectionId,
        config: WsConfig,
    ) -> Result<Self, WsError> {
        let short_lived = match token {
            Some(token) => Some(exchange_token(&host, token).await?),
            None => None,
        };
        let uri = make_uri(&host, db_name, connection_id, short_lived.as_deref(), &config)?;
        let mut req = IntoClientRequest::into_client_request(uri)?;
        request_insert_protocol_header(&mut req);
        let (stream, _) = connect_async(req).await?;
        let (write, read) = stream.split();
        Ok(WsConnection { read, write })
    }

    fn maybe_log_error<T, E: std::fmt::Debug>(cause: &str, res: Result<T, E>) {
        if let Err(e) = res {
            log::warn!("{cause}: {e:?}");
        }
    }

    async fn message_loop(
        mut self,
        events: mpsc::UnboundedSender<TransportEvent>,
        mut outgoing: mpsc::UnboundedReceiver<WsSend>,
    ) {
        // Once the send side hangs up or asks to close, we stop polling it
        // and drain the read side until the server finishes the close
        // handshake.
        let mut sender_done = false;
        loop {
            tokio::select! {
                incoming = self.read.next() => match incoming {
                    None => {
                        let _ = events.unbounded_send(TransportEvent::Closed);
                        break;
                    }
                    Some(Err(e)) => {
                        let _ = events.unbounded_send(TransportEvent::Error(WsError::Transport(e).into()));
                        break;
                    }
                    Some(Ok(WebSocketMessage::Binary(frame))) => match decode_frame(&frame) {
                        Ok(payload) => {
                            let _ = events.unbounded_send(TransportEvent::Message(payload));
                        }
                        // Unsupported or corrupt compression is fatal for the
                        // whole connection.
                        Err(e) => {
                            let _ = events.unbounded_send(TransportEvent::Error(e.into()));
                            break;
                        }
                    },
                    Some(Ok(WebSocketMessage::Ping(payload))) => Self::maybe_log_error(
                        "Error sending Pong in response to Ping",
                        self.write.send(WebSocketMessage::Pong(payload)).await,
                    ),
                    Some(Ok(WebSocketMessage::Close(_))) => {
                        let _ = events.unbounded_send(TransportEvent::Closed);
                        break;
                    }
                    Some(Ok(other)) => log::warn!("Unexpected WebSocket message {other:?}"),
                },

                msg = outgoing.next(), if !sender_done => match msg {
                    Some(WsSend::Message(bytes)) => Self::maybe_log_error(
                        "Error sending outgoing message",
                        self.write.send(WebSocketMessage::Binary(bytes.into())).await,
                    ),
                    Some(WsSend::Close) | None => {
                        sender_done = true;
                        Self::maybe_log_error(
                            "Error sending Close frame",
                            self.write.send(WebSocketMessage::Close(None)).await,
                        );
                    }
                },
            }
        }
    }

    pub(crate) fn spawn_message_loop(
        self,
        runtime: &runtime::Handle,
    ) -> (
        JoinHandle<()>,
        mpsc::UnboundedReceiver<TransportEvent>,
        mpsc::UnboundedSender<WsSend>,
    ) {
        let (outgoing_send, outgoing_recv) = mpsc::unbounded();
        let (event_send, event_recv) = mpsc::unbounded();
        let handle = runtime.spawn(self.message_loop(event_send, outgoing_recv));
        (handle, event_recv, outgoing_send)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config() -> WsConfig {
        WsConfig {
            compression: Compression::Gzip,
            light: false,
            confirmed: None,
        }
    }

    #[test]
    fn http_scheme_becomes_ws() {
        let uri = make_uri(
            &"http://localhost:3000".parse().unwrap(),
            "quickstart",
            ConnectionId::from_u128(0xfeed),
            None,
            &config(),
        )
        .unwrap();
        assert_eq!(uri.scheme_str(), Some("ws"));
        assert_eq!(uri.path(), "/v1/database/quickstart/subscribe");
        let query = uri.query().unwrap();
        assert!(query.starts_with("compression=Gzip"));
        assert!(query.contains("connection_id=0000000000000000000000000000feed"));
        assert!(!query.contains("token="));
    }

    #[test]
    fn https_scheme_becomes_wss_and_flags_appear() {
        let uri = make_uri(
            &"https://testnet.spacetimedb.com".parse().unwrap(),
            "db",
            ConnectionId::from_u128(1),
            Some("short-lived"),
            &WsConfig {
                compression: Compression::None,
                light: true,
                confirmed: Some(true),
            },
        )
        .unwrap();
        assert_eq!(uri.scheme_str(), Some("wss"));
        let query = uri.query().unwrap();
        assert!(query.contains("compression=None"));
        assert!(query.contains("light=true"));
        assert!(query.contains("confirmed=true"));
        assert!(query.contains("token=short-lived"));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let err = make_uri(
            &"ftp://example.com".parse().unwrap(),
            "db",
            ConnectionId::ZERO,
            None,
            &config(),
        )
        .unwrap_err();
        assert!(matches!(err, WsError::UnsupportedScheme { .. }));
    }

    #[test]
    fn token_exchange_uri_is_http() {
        let uri = make_token_exchange_uri(&"wss://host/".parse().unwrap()).unwrap();
        assert_eq!(uri.to_string(), "https://host/v1/identity/websocket-token");
    }

    #[test]
    fn uncompressed_frame_strips_tag() {
        assert_eq!(decode_frame(&[0, 1, 2, 3]).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn gzip_frame_inflates() {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(b"payload").unwrap();
        let mut frame = vec![SERVER_MSG_COMPRESSION_TAG_GZIP];
        frame.extend_from_slice(&encoder.finish().unwrap());
        assert_eq!(decode_frame(&frame).unwrap(), b"payload");
    }

    #[test]
    fn brotli_and_unknown_tags_are_fatal() {
        assert!(matches!(decode_frame(&[1, 0, 0]), Err(WsError::BrotliUnsupported)));
        assert!(matches!(
            decode_frame(&[9, 0]),
            Err(WsError::UnknownCompressionTag { tag: 9 })
        ));
        assert!(matches!(decode_frame(&[]), Err(WsError::EmptyFrame)));
    }
}
