pub mod config;
pub mod mapper;
pub mod offsets;
pub mod parser;
pub mod pipeline;
pub mod queue;
pub mod rules;
pub mod sink;
pub mod watcher;
pub mod writer;
