pub mod agent;
pub mod catalog;
pub mod config;
pub mod demo;
pub mod embedding;
pub mod error;
pub mod executor;
pub mod http_client;
pub mod llm_client;
pub mod memory;
pub mod runtime;
pub mod server;
pub mod session;
pub mod table_index;
