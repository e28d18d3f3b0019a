//! GitHub App authentication for short-lived repo-clone tokens.
//!
//! Mirrors the JWT-signing idiom used elsewhere for session tokens, but
//! here the signer is the platform's GitHub App private key (RS256) and
//! the audience is GitHub's own token-exchange endpoint, not a user.

use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::config::{GITHUB_APP_ID, GITHUB_APP_PRIVATE_KEY_B64};

#[derive(Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Deserialize)]
struct InstallationTokenResponse {
    token: String,
}

fn private_key_pem() -> anyhow::Result<Vec<u8>> {
    Ok(base64::engine::general_purpose::STANDARD.decode(GITHUB_APP_PRIVATE_KEY_B64.as_str())?)
}

fn app_jwt() -> anyhow::Result<String> {
    let now = Utc::now().timestamp();
    let claims = AppClaims { iat: now - 60, exp: now + 9 * 60, iss: GITHUB_APP_ID.clone() };
    let key = EncodingKey::from_rsa_pem(&private_key_pem()?)?;
    Ok(encode(&Header::new(Algorithm::RS256), &claims, &key)?)
}

/// Exchanges the App JWT for a short-lived (one hour) installation token
/// scoped to clone `installation_id`'s repositories.
pub async fn installation_token(installation_id: &str) -> anyhow::Result<String> {
    let jwt = app_jwt()?;
    let client = reqwest::Client::new();
    let resp: InstallationTokenResponse = client
        .post(format!("https://api.github.com/app/installations/{installation_id}/access_tokens"))
        .bearer_auth(jwt)
        .header("Accept", "application/vnd.github+json")
        .header("User-Agent", "zeitwork")
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(resp.token)
}

/// The registry path a build's resulting image is pushed to.
pub fn registry_repository(project_id: uuid::Uuid) -> String {
    format!("zeitwork/{}", crate::ids::encode(project_id))
}
