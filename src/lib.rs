pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod handler;
pub mod lock;
pub mod logger;
pub mod message;
pub mod node;
pub mod plugins;
pub mod scheduler;
pub mod sender;
pub mod server;
pub mod topology;
pub mod worker;
