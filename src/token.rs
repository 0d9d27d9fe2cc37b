use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{GatewayError, GatewayResult};

/// What a verified bearer entitles its holder to.
///
/// User bearers are issued at login and reference a server-side session.
/// Display bearers are issued alongside connection info, are short-lived, and
/// carry the upstream token directly so the WebSocket URL is self-contained.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Grant {
    UserSession {
        session_id: String,
        user_id: String,
    },
    Display {
        vm_id: String,
        upstream_token: String,
    },
}

#[derive(Debug, Deserialize, Serialize)]
struct BearerClaims {
    iat: i64,
    exp: i64,
    #[serde(flatten)]
    grant: Grant,
}

/// Issues and verifies HS256-signed bearers.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenService {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked by hand below so the error can carry the
        // timestamp of the expired credential.
        validation.validate_exp = false;
        validation.set_required_spec_claims::<&str>(&[]);
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn issue_user(&self, session_id: &str, user_id: &str, ttl: Duration) -> GatewayResult<String> {
        self.issue(Grant::UserSession {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
        }, ttl)
    }

    pub fn issue_display(
        &self,
        vm_id: &str,
        upstream_token: &str,
        ttl: Duration,
    ) -> GatewayResult<String> {
        self.issue(Grant::Display {
            vm_id: vm_id.to_string(),
            upstream_token: upstream_token.to_string(),
        }, ttl)
    }

    fn issue(&self, grant: Grant, ttl: Duration) -> GatewayResult<String> {
        let now = Utc::now();
        let claims = BearerClaims {
            iat: now.timestamp(),
            exp: now.timestamp() + ttl.as_secs() as i64,
            grant,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| GatewayError::Internal(format!("failed to sign bearer: {e}")))
    }

    /// Verify signature and expiry, returning the typed grant.
    pub fn verify(&self, token: &str) -> GatewayResult<Grant> {
        let data = decode::<BearerClaims>(token, &self.decoding, &self.validation)
            .map_err(|_| GatewayError::InvalidToken)?;
        let claims = data.claims;
        if claims.exp <= Utc::now().timestamp() {
            return Err(GatewayError::TokenExpired(expiry_timestamp(claims.exp)));
        }
        Ok(claims.grant)
    }
}

fn expiry_timestamp(exp: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(exp, 0).single().unwrap_or_else(Utc::now)
}
