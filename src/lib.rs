pub mod buffer;
pub mod cache;
pub mod common;
pub mod config;
pub mod console;
pub mod error;
pub mod lock;
pub mod page;
pub mod recency;

#[cfg(test)]
pub mod test_helpers;
