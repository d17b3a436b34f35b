use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub role: String,
}

/// Issues and validates admin API bearer tokens
#[derive(Clone)]
pub struct AuthManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_expiry_hours: i64,
}

impl AuthManager {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            token_expiry_hours: 24,
        }
    }

    pub fn create_token(
        &self,
        username: &str,
        role: &str,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let exp = now + Duration::hours(self.token_expiry_hours);

        let claims = Claims {
            sub: username.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            role: role.to_string(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
    }

    pub fn verify_token(
        &self,
        token: &str,
    ) -> Result<TokenData<Claims>, jsonwebtoken::errors::Error> {
        let validation = Validation::default();
        decode::<Claims>(token, &self.decoding_key, &validation)
    }
}

/// Hash a password into its stored verifier (SHA-256 hex digest)
pub fn hash_password(password: &str) -> String {
    format!("{:x}", Sha256::digest(password.as_bytes()))
}

/// Constant-shape check of a password against its stored verifier
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    hash_password(password) == stored_hash
}

/// Decode `Authorization: Basic ...` into (username, password)
pub fn decode_basic_auth(header_value: &str) -> Option<(String, String)> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let creds = String::from_utf8(decoded).ok()?;
    let (username, password) = creds.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        let auth = AuthManager::new("test-secret");
        let token = auth.create_token("alice", "admin").unwrap();

        let data = auth.verify_token(&token).unwrap();
        assert_eq!(data.claims.sub, "alice");
        assert_eq!(data.claims.role, "admin");
        assert!(data.claims.exp > data.claims.iat);
    }

    #[test]
    fn test_token_rejected_with_wrong_secret() {
        let auth = AuthManager::new("secret-a");
        let token = auth.create_token("alice", "viewer").unwrap();

        let other = AuthManager::new("secret-b");
        assert!(other.verify_token(&token).is_err());
    }

    #[test]
    fn test_password_hash_verify() {
        let hash = hash_password("hunter2");
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
    }

    #[test]
    fn test_decode_basic_auth() {
        // "alice:secret" base64-encoded
        let decoded = decode_basic_auth("Basic YWxpY2U6c2VjcmV0").unwrap();
        assert_eq!(decoded, ("alice".to_string(), "secret".to_string()));

        assert!(decode_basic_auth("Bearer abc").is_none());
        assert!(decode_basic_auth("Basic !!!").is_none());
    }

    #[test]
    fn test_decode_basic_auth_password_with_colon() {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let header = format!("Basic {}", STANDARD.encode("bob:pa:ss"));
        let decoded = decode_basic_auth(&header).unwrap();
        assert_eq!(decoded, ("bob".to_string(), "pa:ss".to_string()));
    }
}
