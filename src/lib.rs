//! Lead Agent: conversational sales pipeline for solar-savings leads.

pub mod channels;
pub mod config;
pub mod error;
pub mod lead;
pub mod llm;
pub mod media;
pub mod notify;
pub mod pipeline;
pub mod store;
