pub mod config;
pub mod error;
pub mod evaluator;
pub mod event;
pub mod feed;
pub mod model;
pub mod price_store;
pub mod runtime;
pub mod schedule;
pub mod symbols;
