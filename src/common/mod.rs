pub mod error;

pub use error::{EngineError, ErrorKind, ReconcileErrors, TunnelError};
