pub mod analyzers;
pub mod catalog;
pub mod config;
pub mod error;
pub mod export;
pub mod fetch;
pub mod history;
pub mod infra;
pub mod output;
pub mod pipeline;
pub mod readings;
pub mod records;
pub mod services;
pub mod trim;
