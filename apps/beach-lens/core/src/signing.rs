use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

/// Query parameter carrying a signed path token.
pub const SIGN_QUERY_PARAM: &str = "authSig";

const ISSUER: &str = "beach-lens";

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signature missing")]
    Missing,
    #[error("signature verification failed: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("signature bound to {signed}, not {requested}")]
    PathMismatch { signed: String, requested: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct PathClaims {
    iss: String,
    path: String,
    iat: i64,
    exp: i64,
}

/// Signs and verifies tokens that authorize exactly one request path.
#[derive(Clone)]
pub struct PathSigner {
    enc: EncodingKey,
    dec: DecodingKey,
}

impl PathSigner {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            enc: EncodingKey::from_secret(secret),
            dec: DecodingKey::from_secret(secret),
        }
    }

    pub fn sign(&self, path: &str, ttl: Duration) -> Result<String, SignatureError> {
        let now = OffsetDateTime::now_utc();
        let claims = PathClaims {
            iss: ISSUER.to_string(),
            path: path.to_string(),
            iat: now.unix_timestamp(),
            exp: (now + ttl).unix_timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.enc)?)
    }

    /// Checks the signature, the expiry and that the token was minted for
    /// `path`. A token for `/api/webrtc/ws` cannot be replayed elsewhere.
    pub fn verify(&self, token: Option<&str>, path: &str) -> Result<(), SignatureError> {
        let token = token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(SignatureError::Missing)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let data = decode::<PathClaims>(token, &self.dec, &validation)?;

        if data.claims.path != path {
            return Err(SignatureError::PathMismatch {
                signed: data.claims.path,
                requested: path.to_string(),
            });
        }
        Ok(())
    }
}
