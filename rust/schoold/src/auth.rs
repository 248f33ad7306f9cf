//! Password hashing and HS256 bearer tokens.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

const HASH_SCHEME: &str = "pbkdf2-sha256";
pub const DEFAULT_PBKDF2_ROUNDS: u32 = 100_000;
pub const MIN_PASSWORD_LEN: usize = 6;
/// Longest accepted token lifetime (one year).
pub const MAX_TOKEN_TTL_SECS: i64 = 365 * 24 * 60 * 60;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("unsupported token algorithm")]
    UnsupportedAlgorithm,
    #[error("bad token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token could not be signed")]
    Signing,
    #[error("malformed password hash")]
    MalformedHash,
    #[error("secret must be at least 16 bytes")]
    WeakSecret,
    #[error("token lifetime must be between 1 and {MAX_TOKEN_TTL_SECS} seconds")]
    BadTtl,
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature => AuthError::BadSignature,
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                AuthError::UnsupportedAlgorithm
            }
            _ => AuthError::Malformed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_secs: i64,
}

impl TokenKeys {
    pub fn new(secret: impl Into<Vec<u8>>, ttl_secs: i64) -> Result<Self, AuthError> {
        let secret = secret.into();
        if secret.len() < 16 {
            return Err(AuthError::WeakSecret);
        }
        Self::from_secret(&secret, ttl_secs)
    }

    /// Per-process secret for deployments that did not configure one.
    /// Tokens do not survive a restart.
    pub fn ephemeral(ttl_secs: i64) -> Result<Self, AuthError> {
        let secret = format!("{}{}", uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
        Self::from_secret(secret.as_bytes(), ttl_secs)
    }

    fn from_secret(secret: &[u8], ttl_secs: i64) -> Result<Self, AuthError> {
        if !(1..=MAX_TOKEN_TTL_SECS).contains(&ttl_secs) {
            return Err(AuthError::BadTtl);
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl_secs,
        })
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    pub fn issue(
        &self,
        user_id: &str,
        username: &str,
        role: &str,
        now: i64,
    ) -> Result<String, AuthError> {
        let exp = now.checked_add(self.ttl_secs).ok_or(AuthError::BadTtl)?;
        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            role: role.to_string(),
            iat: now,
            exp,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|_| AuthError::Signing)
    }

    /// Checks signature, algorithm and expiry against the system clock.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        Ok(decode::<Claims>(token, &self.decoding, &self.validation)?.claims)
    }
}

fn random_salt() -> [u8; 16] {
    *uuid::Uuid::new_v4().as_bytes()
}

fn derive(password: &str, salt: &[u8], rounds: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, rounds, &mut out);
    out
}

pub fn hash_password(password: &str, rounds: u32) -> String {
    hash_password_with(password, &random_salt(), rounds.max(1))
}

fn hash_password_with(password: &str, salt: &[u8], rounds: u32) -> String {
    let hash = derive(password, salt, rounds);
    format!(
        "{}${}${}${}",
        HASH_SCHEME,
        rounds,
        STANDARD_NO_PAD.encode(salt),
        STANDARD_NO_PAD.encode(hash)
    )
}

pub fn verify_password(password: &str, stored: &str) -> Result<bool, AuthError> {
    let parts: Vec<&str> = stored.split('$').collect();
    let [scheme, rounds, salt, hash] = parts.as_slice() else {
        return Err(AuthError::MalformedHash);
    };
    if *scheme != HASH_SCHEME {
        return Err(AuthError::MalformedHash);
    }
    let rounds: u32 = rounds.parse().map_err(|_| AuthError::MalformedHash)?;
    if rounds == 0 {
        return Err(AuthError::MalformedHash);
    }
    let salt = STANDARD_NO_PAD
        .decode(salt)
        .map_err(|_| AuthError::MalformedHash)?;
    let expected = STANDARD_NO_PAD
        .decode(hash)
        .map_err(|_| AuthError::MalformedHash)?;
    let actual = derive(password, &salt, rounds);
    Ok(actual.as_slice().ct_eq(expected.as_slice()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> TokenKeys {
        TokenKeys::new("0123456789abcdef0123", 3600).expect("keys")
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    #[test]
    fn token_verifies_until_expiry() {
        let k = keys();
        let issued = now();
        let t = k.issue("u1", "alice", "admin", issued).expect("issue");
        let c = k.verify(&t).expect("valid");
        assert_eq!(c.sub, "u1");
        assert_eq!(c.role, "admin");
        assert_eq!(c.exp, issued + 3600);

        let stale = k.issue("u1", "alice", "admin", issued - 7200).expect("issue");
        assert_eq!(k.verify(&stale), Err(AuthError::Expired));
    }

    #[test]
    fn token_rejects_tampering_and_foreign_keys() {
        let k = keys();
        let t = k.issue("u1", "alice", "parent", now()).expect("issue");
        let forged = k.issue("u1", "alice", "admin", now()).expect("issue");
        let mut parts: Vec<&str> = t.split('.').collect();
        let forged_claims = forged.split('.').nth(1).expect("claims segment");
        parts[1] = forged_claims;
        assert_eq!(k.verify(&parts.join(".")), Err(AuthError::BadSignature));

        let other = TokenKeys::new("another-secret-value!", 3600).expect("keys");
        assert_eq!(other.verify(&t), Err(AuthError::BadSignature));
        assert_eq!(k.verify("a.b"), Err(AuthError::Malformed));
    }

    #[test]
    fn other_algorithms_are_refused() {
        let k = keys();
        let claims = Claims {
            sub: "u1".into(),
            username: "alice".into(),
            role: "admin".into(),
            iat: now(),
            exp: now() + 60,
        };
        let t = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(b"0123456789abcdef0123"),
        )
        .expect("encode");
        assert_eq!(k.verify(&t), Err(AuthError::UnsupportedAlgorithm));
    }

    #[test]
    fn short_secret_is_refused() {
        assert!(matches!(TokenKeys::new("short", 60), Err(AuthError::WeakSecret)));
    }

    #[test]
    fn token_lifetime_is_bounded() {
        assert!(matches!(
            TokenKeys::new("0123456789abcdef0123", MAX_TOKEN_TTL_SECS + 1),
            Err(AuthError::BadTtl)
        ));
        assert!(matches!(TokenKeys::ephemeral(0), Err(AuthError::BadTtl)));
        let k = TokenKeys::new("0123456789abcdef0123", MAX_TOKEN_TTL_SECS).expect("keys");
        assert_eq!(k.issue("u1", "a", "admin", i64::MAX), Err(AuthError::BadTtl));
    }

    #[test]
    fn password_hash_verifies() {
        let stored = hash_password_with("hunter22", b"fixed-salt-bytes", 1_000);
        assert!(verify_password("hunter22", &stored).expect("verify"));
        assert!(!verify_password("hunter23", &stored).expect("verify"));
        assert_eq!(
            verify_password("x", "md5$abc"),
            Err(AuthError::MalformedHash)
        );
    }
}
