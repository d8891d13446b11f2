pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod lock;
pub mod models;
pub mod observability;
pub mod outbox;
pub mod repositories;
pub mod retry;
pub mod services;
pub mod webhook;
