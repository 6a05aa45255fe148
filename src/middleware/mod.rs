//! HTTP middleware: merchant authentication, error rendering, request logging

pub mod auth;
pub mod error;
pub mod logging;

pub use self::auth::AuthenticatedMerchant;
