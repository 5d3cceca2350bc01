//! Support Pipeline: classify support emails into tickets, send a daily digest.

pub mod api;
pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod scheduler;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
