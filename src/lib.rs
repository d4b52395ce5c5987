pub mod account;
pub mod api;
pub mod backend;
pub mod capture;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod fingerprint;
pub mod health;
pub mod history;
pub mod http;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod queue;
pub mod security;
pub mod store;
pub mod uploader;
