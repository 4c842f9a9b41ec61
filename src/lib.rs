//! Mailpilot: discovers unread mail, summarizes it with an AI model and
//! replies in-thread with the summary, one credit per message.

pub mod config;
pub mod error;
pub mod http;
pub mod pipeline;
pub mod providers;
pub mod resilience;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod test_support;
