//! Credentials and request signing for Coinbase WebSocket feeds.
//!
//! Exchange, International and Prime feeds sign subscribe messages with an
//! HMAC keyed by the base64-decoded API secret. Advanced Trade uses a JWT,
//! which is produced by a pluggable [`JwtProvider`].

use std::{
    fmt,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};

use crate::error::{WsError, WsResult};

/// Digest used for HMAC signing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HmacAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

/// Sign `message` with the base64 encoded `secret`, returning a base64
/// signature.
pub fn sign_message(message: &str, secret: &str, algorithm: HmacAlgorithm) -> WsResult<String> {
    let key = STANDARD.decode(secret.trim())?;
    let digest = match algorithm {
        HmacAlgorithm::Sha256 => {
            type HmacSha256 = Hmac<sha2::Sha256>;
            let mut mac = HmacSha256::new_from_slice(&key)
                .map_err(|_| WsError::auth("invalid HMAC key"))?;
            mac.update(message.as_bytes());
            mac.finalize().into_bytes().to_vec()
        }
        HmacAlgorithm::Sha512 => {
            type HmacSha512 = Hmac<sha2::Sha512>;
            let mut mac = HmacSha512::new_from_slice(&key)
                .map_err(|_| WsError::auth("invalid HMAC key"))?;
            mac.update(message.as_bytes());
            mac.finalize().into_bytes().to_vec()
        }
    };
    Ok(STANDARD.encode(digest))
}

/// Current unix time in whole seconds, as Coinbase expects it in signatures.
pub fn timestamp_secs() -> WsResult<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| WsError::internal(format!("system clock before unix epoch: {e}")))?;
    Ok(now.as_secs().to_string())
}

/// Signature for Exchange feeds: `timestamp + "GET" + "/users/self/verify"`.
pub fn exchange_ws_signature(secret: &str, timestamp: &str) -> WsResult<String> {
    let payload = format!("{timestamp}GET/users/self/verify");
    sign_message(&payload, secret, HmacAlgorithm::Sha256)
}

/// Signature for the International (INTX) feed.
pub fn international_ws_signature(
    api_key: &str,
    secret: &str,
    passphrase: &str,
    timestamp: &str,
) -> WsResult<String> {
    let payload = format!("{timestamp}{api_key}CBINTLMD{passphrase}");
    sign_message(&payload, secret, HmacAlgorithm::Sha256)
}

/// Inputs of a Prime subscribe signature.
#[derive(Debug, Clone, Copy)]
pub struct PrimeSignParams<'a> {
    pub channel: &'a str,
    pub api_key: &'a str,
    pub secret: &'a str,
    pub svc_account_id: &'a str,
    pub portfolio_id: &'a str,
    pub product_ids: &'a [String],
}

/// Signature for the Prime feed: channel, key, service account id,
/// timestamp, portfolio id and product ids, concatenated.
pub fn prime_ws_signature(params: PrimeSignParams<'_>, timestamp: &str) -> WsResult<String> {
    let payload = format!(
        "{}{}{}{}{}{}",
        params.channel,
        params.api_key,
        params.svc_account_id,
        timestamp,
        params.portfolio_id,
        params.product_ids.concat()
    );
    sign_message(&payload, params.secret, HmacAlgorithm::Sha256)
}

/// Produces the JWT attached to private Advanced Trade subscriptions.
pub trait JwtProvider: Send + Sync {
    fn ws_jwt(&self) -> WsResult<String>;
}

impl<F> JwtProvider for F
where
    F: Fn() -> WsResult<String> + Send + Sync,
{
    fn ws_jwt(&self) -> WsResult<String> {
        self()
    }
}

/// API credentials. Secrets never appear in `Debug` output.
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: Option<String>,
    /// Prime service account id.
    pub svc_account_id: Option<String>,
    jwt_provider: Option<Arc<dyn JwtProvider>>,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.api_passphrase = Some(passphrase.into());
        self
    }

    #[must_use]
    pub fn with_svc_account_id(mut self, id: impl Into<String>) -> Self {
        self.svc_account_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_jwt_provider(mut self, provider: impl JwtProvider + 'static) -> Self {
        self.jwt_provider = Some(Arc::new(provider));
        self
    }

    pub fn passphrase(&self) -> WsResult<&str> {
        self.api_passphrase
            .as_deref()
            .ok_or_else(|| WsError::auth("API passphrase is required"))
    }

    pub fn svc_account_id(&self) -> WsResult<&str> {
        self.svc_account_id
            .as_deref()
            .ok_or_else(|| WsError::auth("service account id is required"))
    }

    /// Fetch a fresh JWT from the configured provider.
    pub fn jwt(&self) -> WsResult<String> {
        match &self.jwt_provider {
            Some(provider) => provider.ws_jwt(),
            None => Err(WsError::auth("no JWT provider configured")),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .field(
                "api_passphrase",
                &self.api_passphrase.as_ref().map(|_| "<redacted>"),
            )
            .field("svc_account_id", &self.svc_account_id)
            .field("jwt_provider", &self.jwt_provider.is_some())
            .finish()
    }
}
