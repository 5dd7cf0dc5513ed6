pub mod config;
pub mod database;
pub mod models;
pub mod monitoring;
pub mod pool;
