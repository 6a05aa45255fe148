//! Merchant authentication by API key and secret

use tracing::{debug, warn};

use crate::database::merchant_repository::{Merchant, MerchantStore};
use crate::error::{AppError, AppResult, AuthFailure};
use crate::utils::secure_eq;

/// Resolve the merchant owning `api_key`, checking `api_secret` in constant
/// time. Blank credentials count as missing.
pub async fn resolve_merchant(
    merchants: &dyn MerchantStore,
    api_key: Option<&str>,
    api_secret: Option<&str>,
) -> AppResult<Merchant> {
    let (api_key, api_secret) = match (
        api_key.map(str::trim).filter(|k| !k.is_empty()),
        api_secret.map(str::trim).filter(|s| !s.is_empty()),
    ) {
        (Some(key), Some(secret)) => (key, secret),
        _ => return Err(AppError::authentication(AuthFailure::MissingCredentials)),
    };

    let Some(merchant) = merchants.find_by_api_key(api_key).await? else {
        warn!(api_key = %api_key, "unknown API key");
        return Err(AppError::authentication(AuthFailure::InvalidCredentials));
    };

    if !secure_eq(merchant.api_secret.as_bytes(), api_secret.as_bytes()) {
        warn!(merchant_id = %merchant.id, "API secret mismatch");
        return Err(AppError::authentication(AuthFailure::InvalidCredentials));
    }

    debug!(merchant_id = %merchant.id, "merchant authenticated");
    Ok(merchant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::merchant_repository::{InMemoryMerchantStore, NewMerchant};
    use crate::error::AppErrorKind;

    async fn store() -> InMemoryMerchantStore {
        let store = InMemoryMerchantStore::new();
        store
            .upsert(NewMerchant {
                name: "Test Merchant".to_string(),
                email: "test@example.com".to_string(),
                api_key: "key_test_abc123".to_string(),
                api_secret: "secret_test_xyz789".to_string(),
                webhook_url: None,
                webhook_secret: None,
            })
            .await
            .unwrap();
        store
    }

    fn failure(err: AppError) -> AuthFailure {
        match err.kind {
            AppErrorKind::Authentication { reason } => reason,
            other => panic!("unexpected error kind {:?}", other),
        }
    }

    #[tokio::test]
    async fn valid_credentials_resolve_merchant() {
        let store = store().await;
        let merchant = resolve_merchant(&store, Some("key_test_abc123"), Some("secret_test_xyz789"))
            .await
            .unwrap();
        assert_eq!(merchant.email, "test@example.com");
    }

    #[tokio::test]
    async fn missing_credentials() {
        let store = store().await;
        let err = resolve_merchant(&store, Some("key_test_abc123"), None)
            .await
            .unwrap_err();
        assert_eq!(failure(err), AuthFailure::MissingCredentials);

        let err = resolve_merchant(&store, Some(""), Some("secret"))
            .await
            .unwrap_err();
        assert_eq!(failure(err), AuthFailure::MissingCredentials);
    }

    #[tokio::test]
    async fn wrong_secret_or_key_is_invalid() {
        let store = store().await;
        let err = resolve_merchant(&store, Some("key_test_abc123"), Some("nope"))
            .await
            .unwrap_err();
        assert_eq!(failure(err), AuthFailure::InvalidCredentials);

        let err = resolve_merchant(&store, Some("key_unknown"), Some("secret_test_xyz789"))
            .await
            .unwrap_err();
        assert_eq!(failure(err), AuthFailure::InvalidCredentials);
    }
}
