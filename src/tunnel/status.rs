use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// 隧道生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Status {
    Initializing = 0,
    Connecting = 1,
    Running = 2,
    Closing = 3,
    Closed = 4,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "initializing" => Some(Self::Initializing),
            "connecting" => Some(Self::Connecting),
            "running" => Some(Self::Running),
            "closing" => Some(Self::Closing),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Initializing,
            1 => Self::Connecting,
            2 => Self::Running,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 无锁状态寄存器：只做 load / store
#[derive(Debug)]
pub struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub fn new(status: Status) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn load(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, status: Status) {
        let prev = Status::from_u8(self.0.swap(status as u8, Ordering::AcqRel));
        if prev != status {
            tracing::debug!(from = prev.as_str(), to = status.as_str(), "tunnel status changed");
        }
    }
}

impl Default for AtomicStatus {
    fn default() -> Self {
        Self::new(Status::Initializing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings() {
        for s in [
            Status::Initializing,
            Status::Connecting,
            Status::Running,
            Status::Closing,
            Status::Closed,
        ] {
            assert_eq!(Status::from_str(s.as_str()), Some(s));
        }
        assert_eq!(Status::from_str("RUNNING"), Some(Status::Running));
        assert_eq!(Status::from_str("paused"), None);
        assert_eq!(serde_json::to_string(&Status::Closing).unwrap(), "\"closing\"");
    }

    #[test]
    fn register_defaults_to_initializing() {
        let reg = AtomicStatus::default();
        assert_eq!(reg.load(), Status::Initializing);
        reg.store(Status::Running);
        assert_eq!(reg.load(), Status::Running);
    }
}
