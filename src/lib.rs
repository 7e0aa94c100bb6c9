pub mod concurrency;
pub mod config;
pub mod database;
pub mod event;
pub mod transaction;
