use actix_web::dev::Payload;
use actix_web::error::InternalError;
use actix_web::{web, FromRequest, HttpRequest, HttpResponse};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::{ready, Ready};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use std::{fs, io};
use thiserror::Error;

use crate::models::ErrorResponse;

const BCRYPT_COST: u32 = 12;
const RSA_KEY_BITS: usize = 2048;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("key file error: {0}")]
    KeyFile(#[from] io::Error),
    #[error("key generation error: {0}")]
    KeyGen(#[from] rsa::Error),
    #[error("key encoding error: {0}")]
    KeyEncoding(#[from] rsa::pkcs1::Error),
    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("password hash error: {0}")]
    Password(#[from] bcrypt::BcryptError),
    #[error("invalid token")]
    InvalidToken,
}

/// JWT claims. Both token kinds share this shape; access tokens carry
/// no `jti`, refresh tokens carry the id of their store record.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(rename = "type")]
    pub token_type: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

/// Claims extracted from a verified refresh token. The caller still has
/// to check the store record looked up by token hash against these.
#[derive(Debug)]
pub struct RefreshClaims {
    pub user_id: String,
    pub token_id: String,
    pub device_id: String,
}

/// Issues and verifies RS256-signed tokens and bcrypt password hashes.
/// The key pair is immutable after startup.
pub struct AuthService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_token_expiry: Duration,
    refresh_token_expiry: Duration,
}

impl AuthService {
    /// Load the PKCS#1 private key at `path`, generating and writing a
    /// new one (mode 0600) if the file does not exist. The public half
    /// is reconstructed from the private key in memory.
    pub fn from_key_file(
        path: &str,
        access_token_expiry: Duration,
        refresh_token_expiry: Duration,
    ) -> Result<Self, AuthError> {
        let pem = load_or_generate_key(Path::new(path))?;
        Self::from_private_pem(&pem, access_token_expiry, refresh_token_expiry)
    }

    pub fn from_private_pem(
        pem: &str,
        access_token_expiry: Duration,
        refresh_token_expiry: Duration,
    ) -> Result<Self, AuthError> {
        let private_key = RsaPrivateKey::from_pkcs1_pem(pem)?;
        let public_pem = RsaPublicKey::from(&private_key).to_pkcs1_pem(LineEnding::LF)?;

        Ok(Self {
            encoding_key: EncodingKey::from_rsa_pem(pem.as_bytes())?,
            decoding_key: DecodingKey::from_rsa_pem(public_pem.as_bytes())?,
            access_token_expiry,
            refresh_token_expiry,
        })
    }

    /// Generate a fresh PKCS#1 PEM private key. Used at startup when no
    /// key file exists yet, and by tests.
    pub fn generate_key_pem() -> Result<String, AuthError> {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)?;
        Ok(key.to_pkcs1_pem(LineEnding::LF)?.to_string())
    }

    pub fn refresh_token_expiry(&self) -> Duration {
        self.refresh_token_expiry
    }

    /// Hash a password with bcrypt at the configured work factor.
    pub fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        Ok(bcrypt::hash(password, BCRYPT_COST)?)
    }

    /// Constant-time password check against a stored bcrypt hash.
    pub fn verify_password(&self, password: &str, hash: &str) -> Result<bool, AuthError> {
        Ok(bcrypt::verify(password, hash)?)
    }

    pub fn issue_access_token(&self, user_id: &str, device_id: &str) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            device_id: device_id.to_string(),
            token_type: "access".to_string(),
            iat: now,
            exp: now + self.access_token_expiry.as_secs() as i64,
            jti: None,
        };
        Ok(jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)?)
    }

    pub fn issue_refresh_token(
        &self,
        token_id: &str,
        user_id: &str,
        device_id: &str,
    ) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            device_id: device_id.to_string(),
            token_type: "refresh".to_string(),
            iat: now,
            exp: now + self.refresh_token_expiry.as_secs() as i64,
            jti: Some(token_id.to_string()),
        };
        Ok(jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)?)
    }

    /// Verify an access token: RS256 signature, unexpired, correct
    /// `type`, non-empty subject.
    pub fn verify_access_token(&self, token: &str) -> Result<AuthDevice, AuthError> {
        let claims = self.decode(token)?;
        if claims.token_type != "access" || claims.sub.is_empty() {
            return Err(AuthError::InvalidToken);
        }
        Ok(AuthDevice {
            user_id: claims.sub,
            device_id: claims.device_id,
        })
    }

    /// Verify a refresh token's signature and claims. The store lookup
    /// by hash happens at the call site.
    pub fn verify_refresh_token(&self, token: &str) -> Result<RefreshClaims, AuthError> {
        let claims = self.decode(token)?;
        if claims.token_type != "refresh" || claims.sub.is_empty() {
            return Err(AuthError::InvalidToken);
        }
        let token_id = claims.jti.ok_or(AuthError::InvalidToken)?;
        Ok(RefreshClaims {
            user_id: claims.sub,
            token_id,
            device_id: claims.device_id,
        })
    }

    fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        let validation = Validation::new(Algorithm::RS256);
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &validation)?;
        Ok(data.claims)
    }
}

/// SHA-256 hex digest of a token, the form stored in the database.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn load_or_generate_key(path: &Path) -> Result<String, AuthError> {
    match fs::read_to_string(path) {
        Ok(pem) => {
            RsaPrivateKey::from_pkcs1_pem(&pem)?;
            Ok(pem)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::info!("generating RSA key pair at {}", path.display());
            let pem = AuthService::generate_key_pem()?;
            write_key_file(path, &pem)?;
            Ok(pem)
        }
        Err(e) => Err(AuthError::KeyFile(e)),
    }
}

#[cfg(unix)]
fn write_key_file(path: &Path, pem: &str) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(pem.as_bytes())
}

#[cfg(not(unix))]
fn write_key_file(path: &Path, pem: &str) -> io::Result<()> {
    fs::write(path, pem)
}

/// The authenticated principal: which user, from which device. Handlers
/// take this as an extractor argument; requests without a valid bearer
/// access token never reach them.
#[derive(Debug, Clone)]
pub struct AuthDevice {
    pub user_id: String,
    pub device_id: String,
}

impl FromRequest for AuthDevice {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(extract_auth_device(req))
    }
}

fn extract_auth_device(req: &HttpRequest) -> Result<AuthDevice, actix_web::Error> {
    let auth_service = req
        .app_data::<web::Data<Arc<AuthService>>>()
        .ok_or_else(|| unauthorized("server configuration error"))?;

    let header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| unauthorized("missing authorization header"))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| unauthorized("invalid authorization format"))?;

    auth_service
        .verify_access_token(token)
        .map_err(|e| {
            log::debug!("access token rejected: {}", e);
            unauthorized("invalid token")
        })
}

fn unauthorized(msg: &'static str) -> actix_web::Error {
    InternalError::from_response(msg, HttpResponse::Unauthorized().json(ErrorResponse::new(msg)))
        .into()
}
