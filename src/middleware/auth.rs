//! Merchant authentication extractor

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::api::AppState;
use crate::database::merchant_repository::Merchant;
use crate::error::AppError;
use crate::services::resolve_merchant;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const API_SECRET_HEADER: &str = "x-api-secret";

/// The merchant identified by the `X-Api-Key` / `X-Api-Secret` headers
#[derive(Debug, Clone)]
pub struct AuthenticatedMerchant(pub Merchant);

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

pub fn request_id(parts: &Parts) -> Option<String> {
    header(parts, "x-request-id").map(str::to_string)
}

impl FromRequestParts<AppState> for AuthenticatedMerchant {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let merchant = resolve_merchant(
            state.stores.merchants.as_ref(),
            header(parts, API_KEY_HEADER),
            header(parts, API_SECRET_HEADER),
        )
        .await
        .map_err(|e| match request_id(parts) {
            Some(id) => e.with_request_id(id),
            None => e,
        })?;

        Ok(AuthenticatedMerchant(merchant))
    }
}
