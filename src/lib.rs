// Suppress clippy lints that predate the -D warnings CI policy.
#![allow(
    clippy::len_without_is_empty,
    clippy::new_without_default,
    clippy::should_implement_trait,
    clippy::type_complexity,
    clippy::unnecessary_map_or
)]

pub mod app;
pub mod common;
pub mod config;
pub mod ipc;
pub mod options;
pub mod proxy;
pub mod tunnel;
