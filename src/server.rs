// Copyright 2020 Joyent, Inc.

use std::borrow::Cow;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use slog::{error, info, o, warn, Logger};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::compute::Compute;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionError};
use crate::store::RequestStore;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to read listener address: {0}")]
    LocalAddr(#[source] io::Error),
}

/// Accepts connections and runs one [`Session`] per connection.
#[derive(Clone)]
pub struct Server {
    store: Arc<dyn RequestStore>,
    registry: Arc<SessionRegistry>,
    dispatcher: Dispatcher,
    config: Arc<Config>,
    shutdown: CancellationToken,
    sessions: TaskTracker,
    log: Logger,
}

/// Pick `wanted` if the client offered it.
fn negotiate(req: &Request, wanted: Option<&str>) -> Option<String> {
    let wanted = wanted?;
    let offered = req.headers().get(SEC_WEBSOCKET_PROTOCOL)?.to_str().ok()?;
    offered
        .split(',')
        .map(str::trim)
        .find(|p| *p == wanted)
        .map(String::from)
}

impl Server {
    pub fn new(
        store: Arc<dyn RequestStore>,
        compute: Arc<dyn Compute>,
        config: Config,
        log: Option<&Logger>,
    ) -> Server {
        let log = crate::logger_or_default(log);
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            compute,
            Arc::clone(&registry),
            &config,
            Some(&log),
        );

        Server {
            store,
            registry,
            dispatcher,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
            log,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Number of connections with a live session.
    pub fn attached(&self) -> usize {
        self.registry.attached()
    }

    /// Bind `addr` and serve until [`Server::shutdown`] is called.
    pub async fn listen(&self, addr: SocketAddr) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let addr = listener.local_addr().map_err(ServerError::LocalAddr)?;
        info!(self.log, "listening for requests"; "address" => %addr);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let server = self.clone();
                        self.sessions.spawn(async move {
                            server.process(socket, peer).await;
                        });
                    }
                    Err(e) => {
                        error!(self.log, "failed to accept socket"; "err" => %e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        info!(self.log, "stopped accepting connections"; "address" => %addr);
        Ok(())
    }

    /// Upgrade one accepted connection and run its session to completion.
    pub async fn process<T>(&self, socket: T, peer: SocketAddr)
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let log = self.log.new(o!("peer" => peer.to_string()));
        let wanted = self.config.subprotocol.as_deref();

        let mut negotiated = None;
        let callback = |req: &Request,
                        mut resp: Response|
         -> Result<Response, ErrorResponse> {
            negotiated = negotiate(req, wanted);
            if let Some(proto) = &negotiated {
                if let Ok(value) = HeaderValue::from_str(proto) {
                    resp.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                }
            }
            Ok(resp)
        };
        let accepted = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            accepted = accept_hdr_async(socket, callback) => accepted,
        };
        let mut ws = match accepted {
            Ok(ws) => ws,
            Err(e) => {
                warn!(log, "websocket handshake failed"; "err" => %e);
                return;
            }
        };

        if let (Some(wanted), None) = (wanted, &negotiated) {
            info!(log, "rejecting client without subprotocol");
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: Cow::Owned(format!(
                    "client must speak the {} subprotocol",
                    wanted
                )),
            };
            let _ = ws.close(Some(frame)).await;
            return;
        }

        let attachment = self.registry.attach();
        let log = log.new(o!("session" => attachment.id().to_string()));
        info!(log, "connection established");

        let session = Session::new(
            attachment,
            Arc::clone(&self.store),
            self.dispatcher.clone(),
            &self.config,
            self.shutdown.clone(),
            log.clone(),
        );
        match session.run(ws).await {
            Ok(()) => {
                info!(log, "connection closed");
            }
            Err(e @ SessionError::AbnormalClose { .. }) => {
                warn!(log, "connection closed"; "err" => %e);
            }
            Err(e) => {
                error!(log, "failed to process connection"; "err" => %e);
            }
        }
    }

    /// Stop accepting and close attached sessions.  A session finishes the
    /// message it is handling first, so work accepted before the close is
    /// dispatched; then wait for all dispatched work to finish.
    pub async fn shutdown(&self) {
        info!(self.log, "shutting down";
              "sessions" => self.sessions.len(),
              "in_flight" => self.dispatcher.in_flight());
        self.shutdown.cancel();
        self.sessions.close();
        self.sessions.wait().await;
        self.dispatcher.shutdown().await;
    }
}
