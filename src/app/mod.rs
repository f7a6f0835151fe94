pub mod adapter_manager;
pub mod engine;
pub mod tracker;

pub use adapter_manager::AdapterManager;
pub use engine::{Engine, GroupInfo};
pub use tracker::ClientInfoTracker;
