use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use argon2::{
    password_hash::rand_core::{OsRng, RngCore},
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::http::{
    header::{AUTHORIZATION, COOKIE},
    HeaderMap,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use parley_core::UserId;
use pasetors::{
    claims::{Claims, ClaimsValidationRules},
    local,
    token::UntrustedToken,
    version4::V4,
    Local,
};
use sha2::{Digest, Sha256};

use super::{
    core::{
        AppState, AuthContext, ACCESS_TOKEN_TTL_SECS, MAX_REFRESH_TOKEN_CHARS,
        REFRESH_COOKIE_NAME, REFRESH_COOKIE_PATH, REFRESH_TOKEN_TTL_SECS,
    },
    errors::ApiFailure,
    storage::{repository, ChatPersistence},
};

pub(crate) fn validate_password(value: &str) -> Result<(), ApiFailure> {
    let len = value.chars().count();
    if (6..=100).contains(&len) {
        Ok(())
    } else {
        Err(ApiFailure::Validation("password"))
    }
}

pub(crate) fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("password hash failed: {e}"))?
        .to_string();
    Ok(hash)
}

pub(crate) fn verify_password(stored_hash: &str, supplied_password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(supplied_password.as_bytes(), &parsed)
        .is_ok()
}

pub(crate) fn issue_access_token(
    state: &AppState,
    user_id: UserId,
    username: &str,
) -> anyhow::Result<String> {
    let ttl = Duration::from_secs(ACCESS_TOKEN_TTL_SECS.unsigned_abs());
    let mut claims = Claims::new_expires_in(&ttl).map_err(|e| anyhow!("claims init failed: {e}"))?;
    claims
        .subject(&user_id.to_string())
        .map_err(|e| anyhow!("claim sub failed: {e}"))?;
    claims
        .add_additional("username", username)
        .map_err(|e| anyhow!("claim username failed: {e}"))?;

    local::encrypt(&state.token_key, &claims, None, None)
        .map_err(|e| anyhow!("access token mint failed: {e}"))
}

/// Mints an opaque refresh credential. Only its hash is ever persisted.
pub(crate) fn issue_refresh_token() -> (String, [u8; 32]) {
    let mut secret = [0_u8; 32];
    OsRng.fill_bytes(&mut secret);
    let refresh_token = URL_SAFE_NO_PAD.encode(secret);
    let refresh_hash = hash_refresh_token(&refresh_token);
    (refresh_token, refresh_hash)
}

pub(crate) fn verify_access_token(state: &AppState, token: &str) -> anyhow::Result<Claims> {
    let untrusted = UntrustedToken::<Local, V4>::try_from(token).map_err(|e| anyhow!("{e}"))?;
    let validation_rules = ClaimsValidationRules::new();
    let trusted = local::decrypt(&state.token_key, &untrusted, &validation_rules, None, None)
        .map_err(|e| anyhow!("token decrypt failed: {e}"))?;
    trusted
        .payload_claims()
        .cloned()
        .ok_or_else(|| anyhow!("token claims missing"))
}

pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthContext, ApiFailure> {
    let access_token = bearer_token(headers).ok_or(ApiFailure::Unauthorized)?;
    authenticate_with_token(state, access_token).await
}

/// Verifies signature and expiry, then confirms the subject still exists so
/// a token minted for a since-removed account is not honoured.
pub(crate) async fn authenticate_with_token(
    state: &AppState,
    access_token: &str,
) -> Result<AuthContext, ApiFailure> {
    let claims = verify_access_token(state, access_token).map_err(|_| ApiFailure::Unauthorized)?;
    let subject = claims
        .get_claim("sub")
        .and_then(serde_json::Value::as_str)
        .ok_or(ApiFailure::Unauthorized)?;
    let user_id = UserId::try_from(subject).map_err(|_| ApiFailure::Unauthorized)?;
    let user = repository(state)
        .await?
        .find_user(user_id)
        .await?
        .ok_or(ApiFailure::Unauthorized)?;
    Ok(AuthContext {
        user_id,
        username: user.username,
    })
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    header.strip_prefix("Bearer ")
}

pub(crate) fn refresh_token_from_cookies(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == REFRESH_COOKIE_NAME)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty() && value.len() <= MAX_REFRESH_TOKEN_CHARS)
}

pub(crate) fn refresh_cookie(refresh_token: &str, secure: bool) -> String {
    let mut cookie = format!(
        "{REFRESH_COOKIE_NAME}={refresh_token}; HttpOnly; SameSite=Strict; Path={REFRESH_COOKIE_PATH}; Max-Age={REFRESH_TOKEN_TTL_SECS}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub(crate) fn clear_refresh_cookie(secure: bool) -> String {
    let mut cookie = format!(
        "{REFRESH_COOKIE_NAME}=; HttpOnly; SameSite=Strict; Path={REFRESH_COOKIE_PATH}; Max-Age=0"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub(crate) fn hash_refresh_token(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

pub(crate) fn now_unix() -> i64 {
    let now = SystemTime::now();
    let seconds = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs();
    i64::try_from(seconds).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use axum::http::{header::COOKIE, HeaderMap, HeaderValue};

    use super::{
        clear_refresh_cookie, hash_password, issue_refresh_token, refresh_cookie,
        refresh_token_from_cookies, validate_password, verify_password,
    };

    #[test]
    fn password_length_rules() {
        assert!(validate_password("secret").is_ok());
        assert!(validate_password("short").is_err());
        assert!(validate_password(&"p".repeat(101)).is_err());
    }

    #[test]
    fn password_hash_verifies_only_the_original() {
        let hash = hash_password("hunter22").unwrap();
        assert!(verify_password(&hash, "hunter22"));
        assert!(!verify_password(&hash, "hunter23"));
        assert!(!verify_password("not-a-phc-string", "hunter22"));
    }

    #[test]
    fn refresh_tokens_are_unique_and_hashed() {
        let (first, first_hash) = issue_refresh_token();
        let (second, second_hash) = issue_refresh_token();
        assert_ne!(first, second);
        assert_ne!(first_hash, second_hash);
        assert_eq!(first.len(), 43);
    }

    #[test]
    fn cookie_is_scoped_and_script_hidden() {
        let cookie = refresh_cookie("abc", true);
        assert!(cookie.starts_with("refresh_token=abc;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(cookie.contains("Path=/auth"));
        assert!(cookie.contains("Max-Age=604800"));
        assert!(cookie.ends_with("; Secure"));
        assert!(!refresh_cookie("abc", false).contains("Secure"));
        assert!(clear_refresh_cookie(false).contains("Max-Age=0"));
    }

    #[test]
    fn refresh_cookie_is_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; refresh_token=tok123; lang=en"),
        );
        assert_eq!(refresh_token_from_cookies(&headers), Some("tok123"));

        let mut empty = HeaderMap::new();
        empty.insert(COOKIE, HeaderValue::from_static("refresh_token="));
        assert_eq!(refresh_token_from_cookies(&empty), None);
    }
}
