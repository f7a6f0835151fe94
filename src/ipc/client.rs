use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::app::GroupInfo;
use crate::config::ServiceConfig;
use crate::tunnel::{Metrics, Status};

use super::{Request, Response};

#[derive(Error, Debug)]
pub enum IpcError {
    /// socket / 管道不存在：服务未运行
    #[error("service is not running")]
    NotRunning,

    #[error("request failed ({code}): {message}")]
    Status { code: u16, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("decode response: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl IpcError {
    fn from_connect(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => IpcError::NotRunning,
            _ => IpcError::Io(e),
        }
    }
}

/// IPC 客户端：每次调用一个连接，一问一答，不做重试
#[derive(Debug, Clone)]
pub struct IpcClient {
    endpoint: PathBuf,
    timeout: Duration,
}

impl IpcClient {
    pub fn new(endpoint: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(5),
        }
    }

    #[cfg(unix)]
    pub fn from_config(cfg: &ServiceConfig) -> Self {
        Self::new(cfg.socket_path()).with_timeout(cfg.ipc_timeout())
    }

    #[cfg(windows)]
    pub fn from_config(cfg: &ServiceConfig) -> Self {
        Self::new(super::PIPE_NAME).with_timeout(cfg.ipc_timeout())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 发送请求；非 200 响应转为 `IpcError::Status`
    pub async fn call(&self, request: &Request) -> Result<Response, IpcError> {
        let response = tokio::time::timeout(self.timeout, self.roundtrip(request))
            .await
            .map_err(|_| IpcError::Timeout(self.timeout))??;
        if !response.is_ok() {
            return Err(IpcError::Status {
                code: response.code,
                message: response.error.unwrap_or_default(),
            });
        }
        Ok(response)
    }

    #[cfg(unix)]
    async fn roundtrip(&self, request: &Request) -> Result<Response, IpcError> {
        let stream = tokio::net::UnixStream::connect(&self.endpoint)
            .await
            .map_err(IpcError::from_connect)?;
        exchange(stream, request).await
    }

    #[cfg(windows)]
    async fn roundtrip(&self, request: &Request) -> Result<Response, IpcError> {
        use tokio::net::windows::named_pipe::ClientOptions;
        // ERROR_PIPE_BUSY：所有实例都忙，稍后重试由总超时兜底
        const ERROR_PIPE_BUSY: i32 = 231;
        let stream = loop {
            match ClientOptions::new().open(&self.endpoint) {
                Ok(client) => break client,
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(IpcError::from_connect(e)),
            }
        };
        exchange(stream, request).await
    }

    pub async fn start(&self, category: &str, tag: &str) -> Result<(), IpcError> {
        self.call(&Request::Start {
            category: category.to_string(),
            tag: tag.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn close(&self) -> Result<(), IpcError> {
        self.call(&Request::Close).await.map(|_| ())
    }

    pub async fn restart(&self) -> Result<(), IpcError> {
        self.call(&Request::Restart).await.map(|_| ())
    }

    pub async fn status(&self) -> Result<Status, IpcError> {
        self.call_data(&Request::Status).await
    }

    pub async fn select(&self, category: &str, tag: &str) -> Result<(), IpcError> {
        self.call(&Request::Select {
            category: category.to_string(),
            tag: tag.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn groups(&self) -> Result<Vec<GroupInfo>, IpcError> {
        self.call_data(&Request::Groups).await
    }

    pub async fn metrics(&self) -> Result<Metrics, IpcError> {
        self.call_data(&Request::Metrics).await
    }

    async fn call_data<T: DeserializeOwned>(&self, request: &Request) -> Result<T, IpcError> {
        let response = self.call(request).await?;
        let data = response
            .data
            .ok_or_else(|| IpcError::Decode(format!("{} response has no data", request.name())))?;
        serde_json::from_value(data).map_err(|e| IpcError::Decode(e.to_string()))
    }
}

async fn exchange<S>(stream: S, request: &Request) -> Result<Response, IpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut payload = serde_json::to_vec(request).map_err(|e| IpcError::Decode(e.to_string()))?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.flush().await?;

    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await?;
    if line.trim().is_empty() {
        return Err(IpcError::Decode("empty response".into()));
    }
    serde_json::from_str(line.trim()).map_err(|e| IpcError::Decode(e.to_string()))
}
