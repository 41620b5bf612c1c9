pub mod aqi;
pub mod config;
pub mod corrections;
pub mod epa;
pub mod error;
pub mod fetcher;
pub mod merge;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod scheduler;
