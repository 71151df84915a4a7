use base64::Engine;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use ring::signature::RsaKeyPair;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::credentials::{CredentialError, ServiceAccount};
use crate::sheets::SheetsError;

/// Read/write access to spreadsheets.
pub const SPREADSHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Tokens this close to expiry are refreshed before use.
const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Serialize)]
struct JwtHeader {
    alg: &'static str,
    typ: &'static str,
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Build the signed assertion for the JWT-bearer grant
///
/// # Arguments
/// * `account` - The service account to sign as
/// * `now` - Issue time
///
/// # Returns
/// * `Result<String, CredentialError>` - The compact JWT or a key/signing error
pub fn signed_assertion(
    account: &ServiceAccount,
    now: DateTime<Utc>,
) -> Result<String, CredentialError> {
    let claims = JwtClaims {
        iss: &account.client_email,
        scope: SPREADSHEETS_SCOPE,
        aud: &account.token_uri,
        iat: now.timestamp(),
        exp: (now + Duration::hours(1)).timestamp(),
    };
    let header = JwtHeader {
        alg: "RS256",
        typ: "JWT",
    };

    let header_b64 = BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
    let claims_b64 = BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
    let signing_input = format!("{}.{}", header_b64, claims_b64);

    let key_pair = rsa_key_pair(&account.private_key)?;

    // PKCS#1 v1.5 SHA-256 (RS256)
    let mut signature = vec![0; key_pair.public().modulus_len()];
    key_pair
        .sign(
            &ring::signature::RSA_PKCS1_SHA256,
            &ring::rand::SystemRandom::new(),
            signing_input.as_bytes(),
            &mut signature,
        )
        .map_err(|_| CredentialError::Signing("RSA signing failed".to_string()))?;

    Ok(format!(
        "{}.{}",
        signing_input,
        BASE64_URL_SAFE_NO_PAD.encode(&signature)
    ))
}

fn rsa_key_pair(pem: &str) -> Result<RsaKeyPair, CredentialError> {
    let mut reader = std::io::Cursor::new(pem.as_bytes());
    let item = rustls_pemfile::read_one(&mut reader)
        .map_err(|e| CredentialError::Pem(e.to_string()))?;

    match item {
        Some(rustls_pemfile::Item::Pkcs8Key(der)) => RsaKeyPair::from_pkcs8(der.secret_pkcs8_der())
            .map_err(|e| CredentialError::Pem(format!("rejected pkcs8 key: {}", e))),
        Some(rustls_pemfile::Item::Pkcs1Key(der)) => RsaKeyPair::from_der(der.secret_pkcs1_der())
            .map_err(|e| CredentialError::Pem(format!("rejected pkcs1 key: {}", e))),
        _ => Err(CredentialError::Pem("no private key found".to_string())),
    }
}

/// Access-token source for a single service account
///
/// Tokens are fetched lazily and reused until they are about to expire.
/// The cache lock is held across the refresh so concurrent callers wait
/// for one exchange instead of each performing their own.
pub struct TokenSource {
    account: ServiceAccount,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(account: ServiceAccount, http: reqwest::Client) -> Self {
        TokenSource {
            account,
            http,
            cached: Mutex::new(None),
        }
    }

    pub fn client_email(&self) -> &str {
        &self.account.client_email
    }

    /// Return a valid bearer token, exchanging a new assertion if needed
    ///
    /// # Errors
    /// * `SheetsError::Credential` if the key cannot sign
    /// * `SheetsError::Http` / `SheetsError::Api` if the token endpoint fails
    pub async fn token(&self) -> Result<String, SheetsError> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now();

        if let Some(token) = cached.as_ref() {
            if token.expires_at - Duration::seconds(REFRESH_MARGIN_SECS) > now {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.exchange(now).await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    async fn exchange(&self, now: DateTime<Utc>) -> Result<CachedToken, SheetsError> {
        let assertion = signed_assertion(&self.account, now)?;
        let params = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];

        let response = self
            .http
            .post(&self.account.token_uri)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SheetsError::from_error_body(status.as_u16(), &body));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| SheetsError::Decode(format!("token response: {}", e)))?;
        log::debug!(
            "Obtained access token for {} (expires in {}s)",
            self.account.client_email,
            token.expires_in
        );

        Ok(CachedToken {
            value: token.access_token,
            expires_at: now + Duration::seconds(token.expires_in),
        })
    }
}
