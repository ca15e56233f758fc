pub mod admin;
pub mod balance;
pub mod config;
pub mod engine;
pub mod exchange;
pub mod fallback;
pub mod monitor;
pub mod observability;
pub mod persistence;
pub mod realtime;
pub mod reconciler;
pub mod rules;
pub mod settlement;
pub mod submitter;
pub mod types;
