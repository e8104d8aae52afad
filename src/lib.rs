pub mod authorization;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod http;
pub mod integrations;
pub mod locks;
pub mod model;
pub mod orchestrator;
pub mod pipe;
pub mod queue;
pub mod scheduler;
pub mod snapshot;
pub mod splitter;
pub mod status;
pub mod workspace;
