pub mod config;
pub mod database;
pub mod directives;
pub mod gate;
pub mod http_client;
pub mod llm_client;
pub mod orchestrator;
pub mod prompt;
pub mod runtime;
pub mod session;
pub mod store;
pub mod tools;
