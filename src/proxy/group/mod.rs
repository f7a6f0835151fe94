pub mod selector;
pub mod urltest;

pub use selector::SelectorGroup;
pub use urltest::UrlTestGroup;
