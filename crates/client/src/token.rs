//! Access-token collaborator and user identity extraction.

use std::sync::Mutex;

use async_trait::async_trait;
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tracing::{debug, info};

/// Supplies the current access token. Refresh is owned by the session
/// layer; the call core only asks for it.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;
    async fn refresh(&self) -> anyhow::Result<()>;
}

/// Fixed token handed in on the command line.
pub struct StaticToken {
    token: Mutex<Option<String>>,
}

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: Mutex::new(token),
        }
    }

    pub fn set(&self, token: Option<String>) {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = token;
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    fn access_token(&self) -> Option<String> {
        self.token.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn refresh(&self) -> anyhow::Result<()> {
        info!("Token refresh requested, static token cannot be refreshed");
        Ok(())
    }
}

#[derive(Deserialize)]
struct IdentityClaims {
    sub: Option<serde_json::Value>,
    #[serde(rename = "userId")]
    user_id: Option<serde_json::Value>,
    id: Option<serde_json::Value>,
}

fn claim_to_string(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// User identifier carried by a JWT access token (`sub`, then `userId`,
/// then `id`). The signature is not checked: the token is only read here,
/// the server verifies it.
pub fn user_id_from_token(token: &str) -> Option<String> {
    let header = match decode_header(token) {
        Ok(h) => h,
        Err(e) => {
            debug!("Access token is not a JWT: {e}");
            return None;
        }
    };

    let mut validation = Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = match decode::<IdentityClaims>(token, &DecodingKey::from_secret(&[]), &validation)
    {
        Ok(d) => d,
        Err(e) => {
            debug!("Failed to read access token claims: {e}");
            return None;
        }
    };

    let claims = data.claims;
    [claims.sub, claims.user_id, claims.id]
        .into_iter()
        .flatten()
        .find_map(claim_to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn token_with(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"server-side-secret"),
        )
        .unwrap()
    }

    #[test]
    fn reads_sub_claim() {
        let token = token_with(serde_json::json!({ "sub": "user-42", "exp": 1 }));
        assert_eq!(user_id_from_token(&token).as_deref(), Some("user-42"));
    }

    #[test]
    fn falls_back_to_user_id_and_numeric_id() {
        let token = token_with(serde_json::json!({ "userId": "u-7" }));
        assert_eq!(user_id_from_token(&token).as_deref(), Some("u-7"));

        let token = token_with(serde_json::json!({ "id": 99 }));
        assert_eq!(user_id_from_token(&token).as_deref(), Some("99"));
    }

    #[test]
    fn garbage_token_yields_none() {
        assert_eq!(user_id_from_token("not-a-jwt"), None);
        let token = token_with(serde_json::json!({ "role": "guest" }));
        assert_eq!(user_id_from_token(&token), None);
    }

    #[test]
    fn static_token_can_be_replaced() {
        let provider = StaticToken::new(None);
        assert_eq!(provider.access_token(), None);
        provider.set(Some("abc".into()));
        assert_eq!(provider.access_token().as_deref(), Some("abc"));
    }
}
