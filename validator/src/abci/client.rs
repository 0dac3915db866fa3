// Copyright (c) 2024 Botho Foundation

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::{check_protocol, parse_address, AbciChannel, Request, Response, ServerError};
use crate::app::{
    AppError, Application, CommitResponse, InfoResponse, QueryRequest, QueryResponse, TxResponse,
};

/// An [`Application`] reached over the socket protocol.
///
/// Requests are serialised over one connection, so responses always match
/// the request they answer.
pub struct RemoteApp {
    address: String,
    channel: Mutex<AbciChannel<TcpStream>>,
}

impl RemoteApp {
    pub async fn connect(address: &str, protocol: &str) -> Result<Self, ServerError> {
        check_protocol(protocol)?;
        let address = parse_address(address)?;
        let stream = TcpStream::connect(&address).await?;
        stream.set_nodelay(true)?;
        debug!(%address, "Connected to application");
        Ok(Self {
            address,
            channel: Mutex::new(AbciChannel::new(stream)),
        })
    }

    pub async fn echo(&self, message: &str) -> Result<String, AppError> {
        match self
            .roundtrip(Request::Echo {
                message: message.to_string(),
            })
            .await?
        {
            Response::Echo { message } => Ok(message),
            other => Err(unexpected(other)),
        }
    }

    async fn roundtrip(&self, request: Request) -> Result<Response, AppError> {
        let mut channel = self.channel.lock().await;
        channel
            .send(&request)
            .await
            .map_err(|e| AppError::Connection(format!("{}: {}", self.address, e)))?;
        match channel.recv::<Response>().await {
            Ok(Some(Response::Exception { error })) => Err(AppError::Remote(error)),
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(AppError::Connection(format!(
                "{}: connection closed",
                self.address
            ))),
            Err(e) => Err(AppError::Connection(format!("{}: {}", self.address, e))),
        }
    }
}

fn unexpected(response: Response) -> AppError {
    AppError::Connection(format!("unexpected response {:?}", response))
}

#[async_trait]
impl Application for RemoteApp {
    async fn info(&self) -> Result<InfoResponse, AppError> {
        match self.roundtrip(Request::Info).await? {
            Response::Info(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    async fn query(&self, request: QueryRequest) -> Result<QueryResponse, AppError> {
        match self.roundtrip(Request::Query(request)).await? {
            Response::Query(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn check_tx(&self, tx: Vec<u8>) -> Result<TxResponse, AppError> {
        match self.roundtrip(Request::CheckTx { tx }).await? {
            Response::CheckTx(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn begin_block(&self, height: u64) -> Result<(), AppError> {
        match self.roundtrip(Request::BeginBlock { height }).await? {
            Response::BeginBlock => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn deliver_tx(&self, tx: Vec<u8>) -> Result<TxResponse, AppError> {
        match self.roundtrip(Request::DeliverTx { tx }).await? {
            Response::DeliverTx(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn end_block(&self, height: u64) -> Result<(), AppError> {
        match self.roundtrip(Request::EndBlock { height }).await? {
            Response::EndBlock => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn commit(&self) -> Result<CommitResponse, AppError> {
        match self.roundtrip(Request::Commit).await? {
            Response::Commit(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }
}
