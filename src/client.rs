// Copyright 2020 Joyent, Inc.

//! Helpers for talking to a request-tracking server.

use std::net::SocketAddr;

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::SUBPROTOCOL;
use crate::protocol::{self, ProtocolError, RequestId, Response, ServerMessage};

pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] WsError),
    #[error("unexpected message from server: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("server closed connection with code {code}: {reason}")]
    Closed { code: u16, reason: String },
    #[error("connection ended")]
    Disconnected,
}

/// Open a connection to the server at `addr`, offering the `requests`
/// subprotocol.
pub async fn connect(addr: SocketAddr) -> Result<ClientStream, ClientError> {
    let mut req = format!("ws://{}/ws", addr).into_client_request()?;
    req.headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
    let (ws, _) = connect_async(req).await?;
    Ok(ws)
}

async fn send_json<S>(ws: &mut S, body: Value) -> Result<(), ClientError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    ws.send(Message::Text(body.to_string())).await?;
    Ok(())
}

/// Submit new work.  The server answers with the identifier it allocated.
pub async fn submit<S>(ws: &mut S, data: Value) -> Result<(), ClientError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    send_json(ws, json!({ "data": data })).await
}

/// Ask for the state of request `id`.
pub async fn fetch<S>(ws: &mut S, id: &RequestId) -> Result<(), ClientError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    send_json(ws, json!({ "id": id })).await
}

/// Next application message from the server.
pub async fn receive<S>(ws: &mut S) -> Result<ServerMessage, ClientError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let msg = match ws.next().await {
            Some(msg) => msg?,
            None => return Err(ClientError::Disconnected),
        };
        match msg {
            Message::Text(text) => return Ok(protocol::decode_server(text.as_bytes())?),
            Message::Binary(data) => return Ok(protocol::decode_server(&data)?),
            Message::Close(Some(frame)) => {
                return Err(ClientError::Closed {
                    code: frame.code.into(),
                    reason: frame.reason.into_owned(),
                })
            }
            Message::Close(None) => return Err(ClientError::Disconnected),
            _ => continue,
        }
    }
}

/// Next response, skipping any pending snapshot.
pub async fn receive_response<S>(ws: &mut S) -> Result<Response, ClientError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        if let ServerMessage::Response(r) = receive(ws).await? {
            return Ok(r);
        }
    }
}
