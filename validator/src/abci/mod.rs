// Copyright (c) 2024 Botho Foundation

//! Application server wire protocol.
//!
//! The "socket" protocol carries one JSON-encoded [`Request`] or [`Response`]
//! per length-delimited frame over TCP. Requests on a connection are answered
//! in order.

mod client;
mod server;

pub use client::RemoteApp;
pub use server::AbciServer;

#[cfg(test)]
pub(crate) use server::tests::CountingApp;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::app::{CommitResponse, InfoResponse, QueryRequest, QueryResponse, TxResponse};

/// The only protocol selector served.
pub const SOCKET_PROTOCOL: &str = "socket";

/// Largest accepted frame.
pub const MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("unknown abci protocol {0:?}")]
    UnknownProtocol(String),

    #[error("invalid abci address {0:?}")]
    InvalidAddress(String),

    #[error("failed to listen on {address}: {source}")]
    Bind { address: String, source: io::Error },

    #[error("abci server already started")]
    AlreadyStarted,

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed abci message: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Reject protocol selectors other than [`SOCKET_PROTOCOL`].
pub fn check_protocol(protocol: &str) -> Result<(), ServerError> {
    if protocol == SOCKET_PROTOCOL {
        Ok(())
    } else {
        Err(ServerError::UnknownProtocol(protocol.to_string()))
    }
}

/// `tcp://host:port` or `host:port` to `host:port`.
pub fn parse_address(address: &str) -> Result<String, ServerError> {
    let host_port = match address.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some(_) => return Err(ServerError::InvalidAddress(address.to_string())),
        None => address,
    };
    match host_port.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(host_port.to_string())
        }
        _ => Err(ServerError::InvalidAddress(address.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    Echo {
        message: String,
    },
    Info,
    Query(QueryRequest),
    CheckTx {
        #[serde(with = "hex::serde")]
        tx: Vec<u8>,
    },
    BeginBlock {
        height: u64,
    },
    DeliverTx {
        #[serde(with = "hex::serde")]
        tx: Vec<u8>,
    },
    EndBlock {
        height: u64,
    },
    Commit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Echo { message: String },
    Info(InfoResponse),
    Query(QueryResponse),
    CheckTx(TxResponse),
    BeginBlock,
    DeliverTx(TxResponse),
    EndBlock,
    Commit(CommitResponse),
    /// The application failed to handle the request
    Exception { error: String },
}

/// Framed JSON messages over a byte stream.
pub struct AbciChannel<S> {
    framed: Framed<S, LengthDelimitedCodec>,
}

impl<S> AbciChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        let mut codec = LengthDelimitedCodec::new();
        codec.set_max_frame_length(MAX_FRAME_LENGTH);
        Self {
            framed: Framed::new(stream, codec),
        }
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), ServerError> {
        let bytes = serde_json::to_vec(message)?;
        self.framed.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    /// The next message, or `None` once the peer closes the stream.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ServerError> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(serde_json::from_slice(&frame)?)),
            Some(Err(e)) => Err(ServerError::Io(e)),
            None => Ok(None),
        }
    }
}

/// A started server that can be stopped.
#[async_trait]
pub trait ApplicationServer: Send + Sync {
    async fn start(&self) -> Result<(), ServerError>;

    async fn stop(&self);

    /// Bound address once started.
    fn local_addr(&self) -> Option<SocketAddr>;
}
