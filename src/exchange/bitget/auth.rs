//! Authentication for the Bitget REST API
//!
//! Requests are signed with HMAC-SHA256 over
//! `timestamp + METHOD + requestPath[?query] + body`, base64 encoded.

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::path::Path;

use crate::exchange::{ExchangeError, ExchangeResult};

type HmacSha256 = Hmac<Sha256>;

/// Build the string that gets signed
pub fn prehash(timestamp: &str, method: &str, request_path: &str, body: &str) -> String {
    format!(
        "{}{}{}{}",
        timestamp,
        method.to_uppercase(),
        request_path,
        body
    )
}

/// Base64 HMAC-SHA256 signature of `prehash`
pub fn sign(secret: &str, prehash: &str) -> ExchangeResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Auth(format!("invalid secret: {}", e)))?;
    mac.update(prehash.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// API credentials (key, secret, passphrase)
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    secret: String,
    passphrase: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretEntry {
    api_key: String,
    secret: String,
    password: String,
}

impl Credentials {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
        }
    }

    /// Looks for `BITGET_API_KEY`, `BITGET_API_SECRET` and `BITGET_API_PASSPHRASE`
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("BITGET_API_KEY").ok()?;
        let secret = std::env::var("BITGET_API_SECRET").ok()?;
        let passphrase = std::env::var("BITGET_API_PASSPHRASE").ok()?;
        Some(Self::new(api_key, secret, passphrase))
    }

    /// Read entry `key_name` from a secret file shaped like
    /// `{"envelope": {"apiKey": "...", "secret": "...", "password": "..."}}`
    pub fn from_secret_file(path: impl AsRef<Path>, key_name: &str) -> ExchangeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ExchangeError::Auth(format!("cannot read secret file {}: {}", path.display(), e))
        })?;
        let mut entries: std::collections::HashMap<String, SecretEntry> =
            serde_json::from_str(&content).map_err(|e| {
                ExchangeError::Auth(format!("malformed secret file {}: {}", path.display(), e))
            })?;
        let entry = entries.remove(key_name).ok_or_else(|| {
            ExchangeError::Auth(format!(
                "no entry '{}' in secret file {}",
                key_name,
                path.display()
            ))
        })?;
        Ok(Self::new(entry.api_key, entry.secret, entry.password))
    }

    /// Environment first, then the secret file
    pub fn load(secret_path: impl AsRef<Path>, key_name: &str) -> ExchangeResult<Self> {
        match Self::from_env() {
            Some(credentials) => {
                tracing::debug!("Using Bitget credentials from environment");
                Ok(credentials)
            }
            None => Self::from_secret_file(secret_path, key_name),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    pub fn sign(&self, prehash: &str) -> ExchangeResult<String> {
        sign(&self.secret, prehash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prehash_layout() {
        assert_eq!(
            prehash("1700000000000", "get", "/api/v2/spot/account/assets", ""),
            "1700000000000GET/api/v2/spot/account/assets"
        );
    }

    #[test]
    fn test_sign_get() {
        let pre = prehash("1700000000000", "GET", "/api/v2/spot/account/assets", "");
        assert_eq!(
            sign("test-secret", &pre).unwrap(),
            "NWgiyXfUwDZ1wyMDarowE42SSc2pILk98Lup40soRJY="
        );
    }

    #[test]
    fn test_sign_post_with_body() {
        let pre = prehash(
            "1700000000000",
            "POST",
            "/api/v2/spot/trade/place-order",
            r#"{"symbol":"BTCUSDT"}"#,
        );
        assert_eq!(
            sign("test-secret", &pre).unwrap(),
            "yjlr8IX9eyYNbY7wF9jrlU4S42LuWxiz9zEPDPOxfl8="
        );
    }

    #[test]
    fn test_secret_file_lookup() {
        let path = std::env::temp_dir().join(format!("secret-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{"envelope": {"apiKey": "k", "secret": "s", "password": "p"}}"#,
        )
        .unwrap();

        let creds = Credentials::from_secret_file(&path, "envelope").unwrap();
        assert_eq!(creds.api_key(), "k");
        assert_eq!(creds.passphrase(), "p");

        assert!(matches!(
            Credentials::from_secret_file(&path, "grid"),
            Err(ExchangeError::Auth(_))
        ));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_debug_hides_secret() {
        let creds = Credentials::new("key", "super-secret", "phrase");
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("super-secret"));
        assert!(!printed.contains("phrase"));
    }
}
