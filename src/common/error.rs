use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::tunnel::status::Status;

/// 引擎（代理内核）适配层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine closed")]
    Closed,

    #[error("engine already started")]
    AlreadyStarted,

    #[error("missing cache_file options")]
    MissingCacheFile,

    #[error("duplicate tag '{0}'")]
    DuplicateTag(String),

    #[error("unknown tag '{0}'")]
    UnknownTag(String),

    #[error("unsupported protocol '{protocol}' for '{tag}'")]
    UnsupportedProtocol { tag: String, protocol: String },

    #[error("invalid options for '{tag}': {reason}")]
    InvalidOptions { tag: String, reason: String },
}

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("build options: {0}")]
    Build(String),

    #[error("tunnel already running")]
    AlreadyRunning,

    #[error("tunnel not running")]
    NotRunning,

    #[error("tunnel is {0}, not running")]
    NotReady(Status),

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error("engine: {0}")]
    Engine(EngineError),

    #[error("engine closed")]
    EngineClosed,

    #[error("cancelled")]
    Cancelled,

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("shutdown timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Reconcile(ReconcileErrors),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<EngineError> for TunnelError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Closed => TunnelError::EngineClosed,
            other => TunnelError::Engine(other),
        }
    }
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::Build(_) => ErrorKind::Build,
            TunnelError::AlreadyRunning => ErrorKind::AlreadyRunning,
            TunnelError::NotRunning => ErrorKind::NotRunning,
            TunnelError::NotReady(_) => ErrorKind::NotReady,
            TunnelError::InvalidSelection(_) => ErrorKind::InvalidSelection,
            TunnelError::Engine(_) => ErrorKind::Engine,
            TunnelError::EngineClosed => ErrorKind::EngineClosed,
            TunnelError::Cancelled => ErrorKind::Cancelled,
            TunnelError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            TunnelError::Timeout(_) => ErrorKind::Timeout,
            TunnelError::Reconcile(_) => ErrorKind::Reconcile,
            TunnelError::Io(_) => ErrorKind::Io,
            TunnelError::Other(_) => ErrorKind::Other,
        }
    }

    /// 一致性被破坏，调用方可以选择在最外层终止进程
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, TunnelError::InvariantViolation(_))
    }
}

/// Lightweight error category, used for IPC status codes and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Build,
    AlreadyRunning,
    NotRunning,
    NotReady,
    InvalidSelection,
    Engine,
    EngineClosed,
    Cancelled,
    InvariantViolation,
    Timeout,
    Reconcile,
    Io,
    Other,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Build => "BUILD",
            ErrorKind::AlreadyRunning => "ALREADY_RUNNING",
            ErrorKind::NotRunning => "NOT_RUNNING",
            ErrorKind::NotReady => "NOT_READY",
            ErrorKind::InvalidSelection => "INVALID_SELECTION",
            ErrorKind::Engine => "ENGINE",
            ErrorKind::EngineClosed => "ENGINE_CLOSED",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::InvariantViolation => "INVARIANT",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Reconcile => "RECONCILE",
            ErrorKind::Io => "IO",
            ErrorKind::Other => "OTHER",
        }
    }
}

/// 单个成员的失败记录
#[derive(Debug)]
pub struct MemberFailure {
    pub tag: String,
    pub op: &'static str,
    pub error: EngineError,
}

/// 一次调和过程中收集到的全部成员错误
#[derive(Debug, Default)]
pub struct ReconcileErrors {
    pub failures: Vec<MemberFailure>,
}

impl ReconcileErrors {
    pub fn push(&mut self, tag: &str, op: &'static str, error: EngineError) {
        self.failures.push(MemberFailure {
            tag: tag.to_string(),
            op,
            error,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn tags(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.tag.as_str()).collect()
    }
}

impl fmt::Display for ReconcileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} member operation(s) failed", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{} {}: {}", sep, failure.op, failure.tag, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ReconcileErrors {}
