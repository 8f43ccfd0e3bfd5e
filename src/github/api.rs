//! GitHub REST API client: repository creation and Actions secrets.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crypto_box::aead::OsRng;
use crypto_box::PublicKey;
use serde::Deserialize;
use tracing::info;

const API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "turbobackend-worker";

#[derive(Debug, Clone)]
pub struct RepoInfo {
    pub name: String,
    pub html_url: String,
    /// True when the API reported the repo already existed.
    pub already_existed: bool,
}

#[derive(Debug, Deserialize)]
struct CreateRepoResponse {
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct RepoPublicKey {
    key_id: String,
    key: String,
}

pub struct GithubApi {
    http: reqwest::Client,
    token: String,
    owner: String,
}

impl GithubApi {
    pub fn new(token: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.into(),
            owner: owner.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", API_BASE, path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
    }

    /// Create the repository under the configured owner (private, no
    /// auto-init). "Already exists" is treated as the existing repo.
    pub async fn ensure_repo(&self, name: &str) -> Result<RepoInfo> {
        let response = self
            .request(reqwest::Method::POST, "/user/repos")
            .json(&serde_json::json!({
                "name": name,
                "private": true,
                "auto_init": false,
            }))
            .send()
            .await
            .context("Repo creation request failed")?;

        let status = response.status();
        if status.is_success() {
            let created: CreateRepoResponse = response
                .json()
                .await
                .context("Failed to decode repo creation response")?;
            info!(repo = name, "Created repository");
            return Ok(RepoInfo {
                name: name.to_string(),
                html_url: created.html_url,
                already_existed: false,
            });
        }

        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY && body.contains("already exists") {
            info!(repo = name, "Repository already exists, reusing");
            return Ok(RepoInfo {
                name: name.to_string(),
                html_url: format!("https://github.com/{}/{}", self.owner, name),
                already_existed: true,
            });
        }

        anyhow::bail!("Repo creation failed ({}): {}", status, body)
    }

    async fn repo_public_key(&self, repo: &str) -> Result<RepoPublicKey> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{}/{}/actions/secrets/public-key", self.owner, repo),
            )
            .send()
            .await
            .context("Public key request failed")?
            .error_for_status()
            .context("Public key request rejected")?;
        response
            .json()
            .await
            .context("Failed to decode repo public key")
    }

    /// Install a repository Actions secret: fetch the repo public key, seal
    /// the value against it (libsodium sealed-box format), PUT the encrypted
    /// value under the secret name.
    pub async fn put_actions_secret(&self, repo: &str, name: &str, value: &str) -> Result<()> {
        let public_key = self.repo_public_key(repo).await?;
        let encrypted = seal_secret(&public_key.key, value)?;

        self.request(
            reqwest::Method::PUT,
            &format!("/repos/{}/{}/actions/secrets/{}", self.owner, repo, name),
        )
        .json(&serde_json::json!({
            "encrypted_value": encrypted,
            "key_id": public_key.key_id,
        }))
        .send()
        .await
        .context("Secret installation request failed")?
        .error_for_status()
        .context("Secret installation rejected")?;

        info!(repo, secret = name, "Installed Actions secret");
        Ok(())
    }
}

/// Seal `value` against a base64-encoded X25519 public key, returning the
/// base64 sealed box GitHub expects.
fn seal_secret(public_key_b64: &str, value: &str) -> Result<String> {
    let key_bytes = BASE64
        .decode(public_key_b64)
        .context("Repo public key is not valid base64")?;
    let key_array: [u8; 32] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("Repo public key is not 32 bytes"))?;
    let public_key = PublicKey::from(key_array);

    let sealed = public_key
        .seal(&mut OsRng, value.as_bytes())
        .map_err(|_| anyhow::anyhow!("Sealed-box encryption failed"))?;
    Ok(BASE64.encode(sealed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto_box::SecretKey;

    #[test]
    fn test_seal_secret_round_trip() {
        let secret_key = SecretKey::generate(&mut OsRng);
        let public_b64 = BASE64.encode(secret_key.public_key().as_bytes());

        let sealed_b64 = seal_secret(&public_b64, "super-secret-token").unwrap();
        let sealed = BASE64.decode(sealed_b64).unwrap();
        let opened = secret_key.unseal(&sealed).unwrap();
        assert_eq!(opened, b"super-secret-token");
    }

    #[test]
    fn test_seal_secret_rejects_bad_key() {
        assert!(seal_secret("not-base64!!!", "v").is_err());
        let short = BASE64.encode([0u8; 16]);
        assert!(seal_secret(&short, "v").is_err());
    }
}
