pub mod aggregator;
pub mod batch;
pub mod calendar;
pub mod commands;
pub mod config;
pub mod context;
pub mod data_context;
pub mod database;
pub mod error;
pub mod events;
pub mod frequency;
pub mod models;
pub mod pg_store;
pub(crate) mod retry;
pub mod search;
pub mod search_status;
pub mod simulator;
pub mod store;
