//! Deployment platform integration (Fly.io).
//!
//! App creation is idempotent through the platform API; secrets are set
//! through the platform CLI inside the sandbox. Deployment itself is
//! triggered indirectly: pushing to `main` runs the CI workflow. The worker
//! records a `pending` deployment and publishes a `deployment_triggered`
//! message; a webhook outside this worker flips the status later.

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::sandbox::{shell_quote, Sandbox, INSTALL_TIMEOUT};
use crate::schema::DatabaseInfo;

const MACHINES_API_BASE: &str = "https://api.machines.dev/v1";
const FLYCTL: &str = "/root/.fly/bin/flyctl";

#[derive(Debug, Deserialize)]
struct AppsResponse {
    #[serde(default)]
    apps: Vec<AppSummary>,
}

#[derive(Debug, Deserialize)]
struct AppSummary {
    name: String,
}

pub struct FlyApi {
    http: reqwest::Client,
    token: String,
    org: String,
}

impl FlyApi {
    pub fn new(token: impl Into<String>, org: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.into(),
            org: org.into(),
        }
    }

    /// Create the app if it does not exist. "Already exists" from the API is
    /// treated as success. Returns true when the app was created.
    pub async fn ensure_app(&self, app_name: &str) -> Result<bool> {
        let listing: AppsResponse = self
            .http
            .get(format!("{}/apps?org_slug={}", MACHINES_API_BASE, self.org))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("App listing request failed")?
            .error_for_status()
            .context("App listing rejected")?
            .json()
            .await
            .context("Failed to decode app listing")?;

        if listing.apps.iter().any(|a| a.name == app_name) {
            info!(app = app_name, "App already exists");
            return Ok(false);
        }

        let response = self
            .http
            .post(format!("{}/apps", MACHINES_API_BASE))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "app_name": app_name,
                "org_slug": self.org,
            }))
            .send()
            .await
            .context("App creation request failed")?;

        let status = response.status();
        if status.is_success() {
            info!(app = app_name, "Created app");
            return Ok(true);
        }
        let body = response.text().await.unwrap_or_default();
        if body.contains("already exists") || body.contains("has already been taken") {
            info!(app = app_name, "App creation raced, reusing");
            return Ok(false);
        }
        anyhow::bail!("App creation failed ({}): {}", status, body)
    }
}

/// Install the platform CLI into the sandbox. Idempotent: an existing
/// install is reused.
pub async fn install_flyctl(sandbox: &dyn Sandbox) -> Result<()> {
    let out = sandbox
        .exec_with_timeout(
            &format!(
                "test -x {} || (curl -fsSL https://fly.io/install.sh | sh)",
                FLYCTL
            ),
            INSTALL_TIMEOUT,
        )
        .await?;
    if !out.success() {
        anyhow::bail!("flyctl installation failed: {}", out.stderr.trim());
    }
    Ok(())
}

/// Set secrets on the app via the CLI. `--stage` defers the restart to the
/// CI-triggered deployment.
pub async fn set_secrets(
    sandbox: &dyn Sandbox,
    token: &str,
    app_name: &str,
    pairs: &[(String, String)],
) -> Result<()> {
    if pairs.is_empty() {
        return Ok(());
    }
    let assignments = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, shell_quote(v)))
        .collect::<Vec<_>>()
        .join(" ");
    let command = format!(
        "FLY_API_TOKEN={} {} secrets set -a {} --stage {}",
        shell_quote(token),
        FLYCTL,
        shell_quote(app_name),
        assignments
    );
    let out = sandbox.exec_with_timeout(&command, INSTALL_TIMEOUT).await?;
    if !out.success() {
        anyhow::bail!("Secret installation failed: {}", out.stderr.trim());
    }
    info!(app = app_name, count = pairs.len(), "Installed app secrets");
    Ok(())
}

/// The database credential secrets installed on the app when a database was
/// provisioned.
pub fn database_secret_pairs(db: &DatabaseInfo) -> Vec<(String, String)> {
    vec![
        ("DB_HOST".to_string(), db.host.clone()),
        ("DB_PORT".to_string(), db.port.to_string()),
        ("DB_NAME".to_string(), db.db_name.clone()),
        ("DB_USER".to_string(), db.user.clone()),
        ("DB_PASSWORD".to_string(), db.password.clone()),
    ]
}
