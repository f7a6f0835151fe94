//! 本地控制通道
//!
//! 每个连接一问一答，消息为一行 JSON。Unix 使用数据目录下的 socket 文件，
//! Windows 使用带访问控制的命名管道。

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::common::{ErrorKind, TunnelError};
use crate::tunnel::TunnelService;

pub use crate::app::GroupInfo;
pub use crate::tunnel::Metrics;
pub use client::{IpcClient, IpcError};
pub use server::IpcServer;

/// Windows 命名管道名
pub const PIPE_NAME: &str = r"\\.\pipe\openworld-vpn";

/// 单个请求的最大字节数
pub const MAX_REQUEST_BYTES: u64 = 64 * 1024;

pub const CODE_OK: u16 = 200;
pub const CODE_BAD_REQUEST: u16 = 400;
pub const CODE_CONFLICT: u16 = 409;
pub const CODE_INTERNAL: u16 = 500;
pub const CODE_UNAVAILABLE: u16 = 503;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Start {
        #[serde(default)]
        category: String,
        #[serde(default)]
        tag: String,
    },
    Close,
    Restart,
    Status,
    Select {
        category: String,
        #[serde(default)]
        tag: String,
    },
    Groups,
    Metrics,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Start { .. } => "start",
            Request::Close => "close",
            Request::Restart => "restart",
            Request::Status => "status",
            Request::Select { .. } => "select",
            Request::Groups => "groups",
            Request::Metrics => "metrics",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub code: u16,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            code: CODE_OK,
            data,
            error: None,
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => Self::ok(Some(v)),
            Err(e) => Self::error(CODE_INTERNAL, format!("encode response: {}", e)),
        }
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

impl From<&TunnelError> for Response {
    fn from(err: &TunnelError) -> Self {
        Response::error(status_code(err.kind()), err.to_string())
    }
}

/// 错误类别到状态码
pub fn status_code(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::InvalidSelection => CODE_BAD_REQUEST,
        ErrorKind::AlreadyRunning | ErrorKind::NotRunning | ErrorKind::NotReady => CODE_CONFLICT,
        ErrorKind::EngineClosed | ErrorKind::Cancelled => CODE_UNAVAILABLE,
        ErrorKind::Build
        | ErrorKind::Engine
        | ErrorKind::InvariantViolation
        | ErrorKind::Timeout
        | ErrorKind::Reconcile
        | ErrorKind::Io
        | ErrorKind::Other => CODE_INTERNAL,
    }
}

/// 执行一条命令
pub async fn dispatch(service: &TunnelService, request: Request) -> Response {
    debug!(command = request.name(), "ipc request");
    let result = match request {
        Request::Start { category, tag } => service.start(&category, &tag).await.map(|_| None),
        Request::Close => service.close().await.map(|_| None),
        Request::Restart => service.restart().await.map(|_| None),
        Request::Status => return Response::json(&service.status()),
        Request::Select { category, tag } => service.select(&category, &tag).await.map(|_| None),
        Request::Groups => match service.groups().await {
            Ok(groups) => return Response::json(&groups),
            Err(e) => Err(e),
        },
        Request::Metrics => return Response::json(&service.metrics().await),
    };
    match result {
        Ok(data) => Response::ok(data),
        Err(err) => Response::from(&err),
    }
}
