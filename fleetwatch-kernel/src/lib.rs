pub mod aggregator;
pub mod config;
pub mod contracts;
pub mod fanout;
pub mod health;
pub mod history;
pub mod http;
pub mod models;
pub mod mqtt;
pub mod state;
pub mod ws;
