// Copyright 2020 Joyent, Inc.

//! Per-connection protocol state machine.
//!
//! A session sends the pending snapshot once, then handles one inbound
//! message at a time: admission through the token bucket, decode, then
//! either the submit path (persist, dispatch, acknowledge) or the fetch
//! path (look up and reply).  Completions pushed by the dispatcher are
//! written between messages.  The loop ends cleanly on a normal close from
//! the client or on server shutdown; anything else ends it with an error.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, StreamExt};
use serde_json::Value;
use slog::{debug, Logger};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::limiter::{LimiterError, TokenBucket};
use crate::protocol::{
    self, PendingSnapshot, ProtocolError, RequestId, RequestMessage, Response,
    ServerMessage,
};
use crate::registry::{Attachment, SessionId};
use crate::store::{self, RequestRecord, RequestStore, StoreError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to decode request: {0}")]
    Decode(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("rate limiter: {0}")]
    RateLimit(#[from] LimiterError),
    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(#[from] WsError),
    #[error("client closed connection with code {code}: {reason}")]
    AbnormalClose { code: u16, reason: String },
}

enum Inbound {
    Data(Vec<u8>),
    Closed,
    Ignored,
}

fn classify(frame: Result<Message, WsError>) -> Result<Inbound, SessionError> {
    match frame {
        Ok(Message::Text(text)) => Ok(Inbound::Data(text.into_bytes())),
        Ok(Message::Binary(data)) => Ok(Inbound::Data(data)),
        Ok(Message::Close(None)) => Ok(Inbound::Closed),
        Ok(Message::Close(Some(frame))) => {
            if frame.code == CloseCode::Normal {
                Ok(Inbound::Closed)
            } else {
                Err(SessionError::AbnormalClose {
                    code: frame.code.into(),
                    reason: frame.reason.into_owned(),
                })
            }
        }
        Ok(_) => Ok(Inbound::Ignored),
        Err(WsError::ConnectionClosed) => Ok(Inbound::Closed),
        Err(e) => Err(e.into()),
    }
}

async fn send<S>(sink: &mut S, msg: &ServerMessage) -> Result<(), SessionError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let text = protocol::encode(msg)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

/// Best-effort close frame; the connection is going away regardless.
async fn close<S>(sink: &mut S, code: CloseCode, reason: &'static str)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}

pub struct Session {
    attachment: Attachment,
    limiter: TokenBucket,
    store: Arc<dyn RequestStore>,
    dispatcher: Dispatcher,
    admission_wait: Duration,
    store_timeout: Duration,
    shutdown: CancellationToken,
    log: Logger,
}

impl Session {
    pub fn new(
        attachment: Attachment,
        store: Arc<dyn RequestStore>,
        dispatcher: Dispatcher,
        config: &Config,
        shutdown: CancellationToken,
        log: Logger,
    ) -> Session {
        Session {
            attachment,
            limiter: TokenBucket::new(
                config.bucket_capacity,
                config.refill_interval,
            ),
            store,
            dispatcher,
            admission_wait: config.admission_wait,
            store_timeout: config.store_timeout,
            shutdown,
            log,
        }
    }

    pub fn id(&self) -> SessionId {
        self.attachment.id()
    }

    /// Drive the connection until it closes.  Consumes the session; the
    /// registry entry and the token bucket go away with it, while work it
    /// dispatched keeps running.
    pub async fn run<T>(mut self, ws: WebSocketStream<T>) -> Result<(), SessionError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();
        self.on_attach(&mut sink).await?;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    close(&mut sink, CloseCode::Away, "server shutting down").await;
                    return Ok(());
                }
                Some(pushed) = self.attachment.recv() => {
                    debug!(self.log, "pushing completion"; "request_id" => %pushed.id);
                    send(&mut sink, &pushed.into()).await?;
                }
                frame = stream.next() => {
                    let raw = match frame.map(classify) {
                        None => return Ok(()),
                        Some(Err(e)) => return Err(e),
                        Some(Ok(Inbound::Closed)) => {
                            let _ = sink.close().await;
                            return Ok(());
                        }
                        Some(Ok(Inbound::Ignored)) => continue,
                        Some(Ok(Inbound::Data(raw))) => raw,
                    };
                    if let Err(e) = self.on_message(&raw, &mut sink).await {
                        if let SessionError::Decode(_) = e {
                            close(&mut sink, CloseCode::Invalid, "malformed request")
                                .await;
                        }
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn on_attach<S>(&self, sink: &mut S) -> Result<(), SessionError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        let pending =
            store::bounded(self.store_timeout, self.store.list_pending()).await?;
        if pending.is_empty() {
            return Ok(());
        }

        debug!(self.log, "sending pending snapshot"; "count" => pending.len());
        send(sink, &PendingSnapshot { pending }.into()).await
    }

    async fn on_message<S>(
        &mut self,
        raw: &[u8],
        sink: &mut S,
    ) -> Result<(), SessionError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        self.limiter.admit(&self.shutdown, self.admission_wait).await?;

        match protocol::decode(raw)? {
            RequestMessage::Submit { payload } => self.submit(payload, sink).await,
            RequestMessage::Fetch { id } => self.fetch(id, sink).await,
        }
    }

    /// New work.  The record must exist before anything is dispatched, and
    /// it is dispatched before the acknowledgement is written so that a
    /// failed write cannot strand it in `pending`.  Pushes are only written
    /// by this loop, so the acknowledgement still reaches the client first.
    async fn submit<S>(
        &mut self,
        payload: Value,
        sink: &mut S,
    ) -> Result<(), SessionError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        let id = RequestId::generate();
        store::bounded(self.store_timeout, self.store.create(&id, payload.clone()))
            .await?;
        debug!(self.log, "accepted request"; "request_id" => %id);

        self.attachment.await_completion(id.clone());
        self.dispatcher.dispatch(self.attachment.id(), id.clone(), payload);
        send(sink, &Response::pending(id).into()).await
    }

    async fn fetch<S>(&mut self, id: RequestId, sink: &mut S) -> Result<(), SessionError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        let record = store::bounded(self.store_timeout, self.store.get(&id)).await?;
        let response = match record {
            None => Response::not_found(id),
            Some(RequestRecord {
                completion: Some(completion),
                ..
            }) => Response::completed(id, &completion),
            Some(_) => Response::pending(id),
        };

        debug!(self.log, "answered fetch";
               "request_id" => %response.id, "pending" => response.is_pending());
        send(sink, &response.into()).await
    }
}
