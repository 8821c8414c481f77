use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("токен не передан")]
    MissingToken,
    #[error("токен поврежден: {0}")]
    Malformed(String),
    #[error("алгоритм подписи '{0}' не поддерживается")]
    UnsupportedAlgorithm(String),
    #[error("подпись токена не сходится")]
    BadSignature,
    #[error("срок действия токена истек")]
    Expired,
    #[error("неверные учетные данные")]
    InvalidCredentials,
    #[error("секрет подписи не задан")]
    EmptySecret,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    user_id: String,
    email: String,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    exp: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default)]
    typ: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: i64,
}

pub struct TokenSigner {
    key: Vec<u8>,
    ttl: Duration,
}

impl TokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>, ttl: Duration) -> Result<Self, AuthError> {
        let key = secret.into();
        if key.is_empty() {
            return Err(AuthError::EmptySecret);
        }
        Ok(Self { key, ttl })
    }

    pub fn issue(&self, principal: &Principal, now_unix: i64) -> Result<IssuedToken, AuthError> {
        let expires_at = now_unix.saturating_add(self.ttl.as_secs() as i64);
        let header = Header {
            alg: "HS256".to_string(),
            typ: Some("JWT".to_string()),
        };
        let claims = Claims {
            user_id: principal.user_id.clone(),
            email: principal.email.clone(),
            iat: Some(now_unix),
            exp: Some(expires_at),
        };

        let header = encode_segment(&header)?;
        let claims = encode_segment(&claims)?;
        let signing_input = format!("{header}.{claims}");
        let signature = URL_SAFE_NO_PAD.encode(self.mac(&signing_input)?.finalize().into_bytes());

        Ok(IssuedToken {
            token: format!("{signing_input}.{signature}"),
            expires_at,
        })
    }

    pub fn verify(&self, token: &str, now_unix: i64) -> Result<Principal, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let mut parts = token.split('.');
        let (Some(header), Some(claims), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed("ожидалось три сегмента".to_string()));
        };

        let decoded_header: Header = decode_segment(header)?;
        if decoded_header.alg != "HS256" {
            return Err(AuthError::UnsupportedAlgorithm(decoded_header.alg));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|err| AuthError::Malformed(format!("подпись: {err}")))?;
        self.mac(&format!("{header}.{claims}"))?
            .verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let claims: Claims = decode_segment(claims)?;
        match claims.exp {
            Some(exp) if exp > now_unix => {}
            _ => return Err(AuthError::Expired),
        }

        Ok(Principal {
            user_id: claims.user_id,
            email: claims.email,
        })
    }

    fn mac(&self, input: &str) -> Result<HmacSha256, AuthError> {
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|_| AuthError::EmptySecret)?;
        mac.update(input.as_bytes());
        Ok(mac)
    }
}

fn encode_segment<T: Serialize>(value: &T) -> Result<String, AuthError> {
    let json = serde_json::to_vec(value).map_err(|err| AuthError::Malformed(err.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

fn decode_segment<T: for<'de> Deserialize<'de>>(segment: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|err| AuthError::Malformed(format!("base64: {err}")))?;
    serde_json::from_slice(&bytes).map_err(|err| AuthError::Malformed(format!("json: {err}")))
}

pub struct SessionGate {
    signer: TokenSigner,
}

impl SessionGate {
    pub fn new(signer: TokenSigner) -> Self {
        Self { signer }
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    pub fn authorize(&self, token: Option<&str>, now_unix: i64) -> Result<Principal, AuthError> {
        match token {
            Some(token) => self.signer.verify(token, now_unix),
            None => Err(AuthError::MissingToken),
        }
    }
}

pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, email: &str, password: &str) -> Result<Principal, AuthError>;
}

#[derive(Debug, Clone)]
pub struct StaticUser {
    pub id: String,
    pub email: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: Vec<StaticUser>,
}

impl StaticCredentials {
    pub fn new(users: Vec<StaticUser>) -> Self {
        Self { users }
    }

    #[cfg(test)]
    pub fn with_password(mut self, id: &str, email: &str, password: &str) -> Self {
        self.users.push(StaticUser {
            id: id.to_string(),
            email: email.to_string(),
            password_hash: bcrypt::hash(password, 4).unwrap(),
        });
        self
    }
}

impl CredentialVerifier for StaticCredentials {
    fn verify(&self, email: &str, password: &str) -> Result<Principal, AuthError> {
        self.users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email.trim()))
            .filter(|u| bcrypt::verify(password, u.password_hash.trim()).unwrap_or(false))
            .map(|u| Principal {
                user_id: u.id.clone(),
                email: u.email.clone(),
            })
            .ok_or(AuthError::InvalidCredentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn signer() -> TokenSigner {
        TokenSigner::new("test_secret", Duration::from_secs(3600)).unwrap()
    }

    fn principal() -> Principal {
        Principal {
            user_id: "1".to_string(),
            email: "test@example.com".to_string(),
        }
    }

    #[test]
    fn issued_token_round_trips() {
        let signer = signer();
        let issued = signer.issue(&principal(), NOW).unwrap();
        assert_eq!(issued.expires_at, NOW + 3600);
        assert_eq!(signer.verify(&issued.token, NOW + 10).unwrap(), principal());
    }

    #[test]
    fn expired_token_rejected() {
        let signer = signer();
        let issued = signer.issue(&principal(), NOW).unwrap();
        assert!(matches!(
            signer.verify(&issued.token, NOW + 3600),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn foreign_signature_rejected() {
        let other = TokenSigner::new("other_secret", Duration::from_secs(3600)).unwrap();
        let issued = other.issue(&principal(), NOW).unwrap();
        assert!(matches!(
            signer().verify(&issued.token, NOW),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn tampered_claims_rejected() {
        let signer = signer();
        let issued = signer.issue(&principal(), NOW).unwrap();
        let parts: Vec<&str> = issued.token.split('.').collect();
        let forged = encode_segment(&Claims {
            user_id: "0".to_string(),
            email: "root@example.com".to_string(),
            iat: Some(NOW),
            exp: Some(NOW + 99_999),
        })
        .unwrap();
        let token = format!("{}.{}.{}", parts[0], forged, parts[2]);
        assert!(matches!(
            signer.verify(&token, NOW),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn token_without_expiry_rejected() {
        let signer = signer();
        let header = encode_segment(&Header {
            alg: "HS256".to_string(),
            typ: None,
        })
        .unwrap();
        let claims = encode_segment(&Claims {
            user_id: "1".to_string(),
            email: "test@example.com".to_string(),
            iat: None,
            exp: None,
        })
        .unwrap();
        let input = format!("{header}.{claims}");
        let sig = URL_SAFE_NO_PAD.encode(signer.mac(&input).unwrap().finalize().into_bytes());
        assert!(matches!(
            signer.verify(&format!("{input}.{sig}"), NOW),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn garbage_and_empty_tokens_rejected() {
        let gate = SessionGate::new(signer());
        assert!(matches!(gate.authorize(None, NOW), Err(AuthError::MissingToken)));
        assert!(matches!(
            gate.authorize(Some(""), NOW),
            Err(AuthError::MissingToken)
        ));
        assert!(matches!(
            gate.authorize(Some("invalid_token"), NOW),
            Err(AuthError::Malformed(_))
        ));
        assert!(gate.authorize(Some("a.b.c.d"), NOW).is_err());
        assert!(gate.authorize(Some("!!.??.**"), NOW).is_err());
    }

    #[test]
    fn none_algorithm_rejected() {
        let header = encode_segment(&Header {
            alg: "none".to_string(),
            typ: None,
        })
        .unwrap();
        let claims = encode_segment(&Claims {
            user_id: "1".to_string(),
            email: "test@example.com".to_string(),
            iat: None,
            exp: Some(NOW + 100),
        })
        .unwrap();
        assert!(matches!(
            signer().verify(&format!("{header}.{claims}."), NOW),
            Err(AuthError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn empty_secret_refused() {
        assert!(matches!(
            TokenSigner::new("", Duration::from_secs(1)),
            Err(AuthError::EmptySecret)
        ));
    }

    #[test]
    fn static_credentials_check_bcrypt_hash() {
        let creds = StaticCredentials::default().with_password("1", "Ops@Example.com", "hunter2");
        let p = creds.verify("ops@example.com", "hunter2").unwrap();
        assert_eq!(p.user_id, "1");
        assert!(matches!(
            creds.verify("ops@example.com", "wrong"),
            Err(AuthError::InvalidCredentials)
        ));
        assert!(creds.verify("nobody@example.com", "hunter2").is_err());
    }

    #[test]
    fn bundled_example_hash_verifies() {
        let creds = StaticCredentials::new(vec![StaticUser {
            id: "1".to_string(),
            email: "ops@example.com".to_string(),
            password_hash: "$2b$10$JqdAfWRmg2KdAhJwvwmEkuVIeDUVaU.aWtLc9hctIkCE4WekywDTa"
                .to_string(),
        }]);
        assert!(creds.verify("ops@example.com", "change-me").is_ok());
        assert!(creds.verify("ops@example.com", "change-me ").is_err());
    }

    #[test]
    fn malformed_or_unsalted_hash_never_matches() {
        let creds = StaticCredentials::new(vec![StaticUser {
            id: "1".to_string(),
            email: "ops@example.com".to_string(),
            password_hash: "e2186dbdb1bb4193608605e84f33208765b5693b55edd4f730a719a100eeea6f"
                .to_string(),
        }]);
        assert!(matches!(
            creds.verify("ops@example.com", "change-me"),
            Err(AuthError::InvalidCredentials)
        ));
    }
}
