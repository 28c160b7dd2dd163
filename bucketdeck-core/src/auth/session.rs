//! HS256 session tokens carrying the caller's groups

use jwt_simple::prelude::*;
use serde::{Deserialize, Serialize};

use super::Principal;
use crate::{DeckError, Result};

/// Custom claims of a session token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Verifies session tokens with the shared login secret
#[derive(Clone)]
pub struct SessionVerifier {
    key: HS256Key,
}

impl std::fmt::Debug for SessionVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionVerifier").finish_non_exhaustive()
    }
}

impl SessionVerifier {
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(DeckError::Config("session secret must not be empty".to_string()));
        }
        Ok(SessionVerifier {
            key: HS256Key::from_bytes(secret),
        })
    }

    /// Verify a token and extract the caller
    pub fn verify(&self, token: &str) -> Result<Principal> {
        let claims = self
            .key
            .verify_token::<SessionClaims>(token, None)
            .map_err(|e| DeckError::Unauthenticated(format!("invalid session token: {}", e)))?;

        let subject = claims
            .subject
            .ok_or_else(|| DeckError::Unauthenticated("session token has no subject".to_string()))?;

        Ok(Principal {
            subject,
            name: claims.custom.name,
            groups: claims.custom.groups,
        })
    }

    /// Sign a token for `principal`; used by tooling and tests
    pub fn issue(&self, principal: &Principal, validity: std::time::Duration) -> Result<String> {
        let custom = SessionClaims {
            name: principal.name.clone(),
            groups: principal.groups.clone(),
        };
        let claims = Claims::with_custom_claims(custom, Duration::from_secs(validity.as_secs()))
            .with_subject(principal.subject.clone());

        self.key
            .authenticate(claims)
            .map_err(|e| DeckError::Internal(format!("signing session token failed: {}", e)))
    }
}
