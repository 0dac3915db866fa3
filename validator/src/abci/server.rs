// Copyright (c) 2024 Botho Foundation

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    check_protocol, parse_address, AbciChannel, ApplicationServer, Request, Response, ServerError,
};
use crate::app::{AppError, Application};

struct Listening {
    local_addr: SocketAddr,
    accept_loop: JoinHandle<()>,
}

/// Serves an [`Application`] to remote consensus engines.
pub struct AbciServer {
    address: String,
    app: Arc<dyn Application>,
    shutdown: CancellationToken,
    listening: Mutex<Option<Listening>>,
}

impl AbciServer {
    /// Validate `address` and `protocol`. Nothing is bound until
    /// [`start`](ApplicationServer::start).
    pub fn new(address: &str, protocol: &str, app: Arc<dyn Application>) -> Result<Self, ServerError> {
        check_protocol(protocol)?;
        Ok(Self {
            address: parse_address(address)?,
            app,
            shutdown: CancellationToken::new(),
            listening: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ApplicationServer for AbciServer {
    async fn start(&self) -> Result<(), ServerError> {
        if self.listening.lock().is_some() || self.shutdown.is_cancelled() {
            return Err(ServerError::AlreadyStarted);
        }

        let listener =
            TcpListener::bind(&self.address)
                .await
                .map_err(|source| ServerError::Bind {
                    address: self.address.clone(),
                    source,
                })?;
        let local_addr = listener.local_addr()?;

        let mut listening = self.listening.lock();
        if listening.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            self.app.clone(),
            self.shutdown.clone(),
        ));
        *listening = Some(Listening {
            local_addr,
            accept_loop,
        });
        info!(address = %local_addr, "Application server listening");
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        let listening = self.listening.lock().take();
        if let Some(listening) = listening {
            if let Err(e) = listening.accept_loop.await {
                debug!("Application server accept loop ended abnormally: {}", e);
            }
            info!(address = %listening.local_addr, "Application server stopped");
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listening.lock().as_ref().map(|l| l.local_addr)
    }
}

async fn accept_loop(listener: TcpListener, app: Arc<dyn Application>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Application client connected");
                    tokio::spawn(serve_connection(stream, peer, app.clone(), shutdown.child_token()));
                }
                Err(e) => warn!("Failed to accept application client: {}", e),
            },
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    app: Arc<dyn Application>,
    shutdown: CancellationToken,
) {
    let mut channel = AbciChannel::new(stream);
    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            request = channel.recv::<Request>() => request,
        };
        let response = match request {
            Ok(Some(request)) => dispatch(app.as_ref(), request).await,
            Ok(None) => break,
            Err(e) => {
                warn!(%peer, "Dropping application client: {}", e);
                let _ = channel
                    .send(&Response::Exception {
                        error: e.to_string(),
                    })
                    .await;
                break;
            }
        };
        if let Err(e) = channel.send(&response).await {
            debug!(%peer, "Failed to answer application client: {}", e);
            break;
        }
    }
    debug!(%peer, "Application client disconnected");
}

async fn dispatch(app: &dyn Application, request: Request) -> Response {
    let result: Result<Response, AppError> = match request {
        Request::Echo { message } => Ok(Response::Echo { message }),
        Request::Info => app.info().await.map(Response::Info),
        Request::Query(query) => app.query(query).await.map(Response::Query),
        Request::CheckTx { tx } => app.check_tx(tx).await.map(Response::CheckTx),
        Request::BeginBlock { height } => app.begin_block(height).await.map(|_| Response::BeginBlock),
        Request::DeliverTx { tx } => app.deliver_tx(tx).await.map(Response::DeliverTx),
        Request::EndBlock { height } => app.end_block(height).await.map(|_| Response::EndBlock),
        Request::Commit => app.commit().await.map(Response::Commit),
    };
    result.unwrap_or_else(|e| Response::Exception {
        error: e.to_string(),
    })
}
