//! Payment gateway backend: asynchronous payment/refund processing and signed
//! webhook delivery with retry.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod queue;
pub mod services;
pub mod utils;
pub mod workers;
