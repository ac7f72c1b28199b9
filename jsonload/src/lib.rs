pub mod chunker;
pub mod cli;
pub mod config;
pub mod error;
pub mod hash;
pub mod pipeline;
pub mod poll;
pub mod queue;
pub mod retry;
pub mod sinks;
pub mod size;
pub mod source;
pub mod transform;
