//! Project skeleton initialization inside a fresh sandbox, and the
//! object-store mirror.
//!
//! Only the creation pipeline initializes; the modification pipeline assumes
//! the clone has populated the directory.

use anyhow::{Context, Result};
use tracing::info;

use super::{Sandbox, INSTALL_TIMEOUT};
use crate::config::ObjectStoreConfig;
use crate::schema::DatabaseInfo;

/// What the initializer needs to know about the detected intents.
pub struct ProjectInit<'a> {
    pub project_id: &'a str,
    pub database: Option<&'a DatabaseInfo>,
    pub auth_needed: bool,
    pub payment_needed: bool,
    /// Extra worker-environment keys copied into the project `.env`.
    pub extra_env: &'a [(String, String)],
}

const PACKAGE_JSON: &str = r#"{
  "name": "generated-backend",
  "private": true,
  "scripts": {
    "dev": "nitro dev",
    "build": "nitro build",
    "preview": "node .output/server/index.mjs"
  }
}
"#;

const NITRO_CONFIG: &str = r#"import { defineNitroConfig } from "nitropack/config";

export default defineNitroConfig({
  srcDir: ".",
  compatibilityDate: "2025-01-01",
});
"#;

const HEALTH_ENDPOINT: &str = r#"export default defineEventHandler(() => ({
  status: "ok",
  timestamp: Date.now(),
}));
"#;

const GITIGNORE: &str = "node_modules/\n.output/\n.nitro/\n.cache/\ndist/\n.env\n.DS_Store\n*.log\n";

/// Render the project `.env`. Database credentials when present, then
/// placeholder entries for integration keys the user must fill in.
pub fn render_env_file(
    database: Option<&DatabaseInfo>,
    auth_needed: bool,
    payment_needed: bool,
    extra_env: &[(String, String)],
) -> String {
    let mut lines: Vec<String> = Vec::new();

    for (key, value) in extra_env {
        lines.push(format!("{}={}", key, value));
    }

    if let Some(db) = database {
        lines.push(format!("DB_HOST={}", db.host));
        lines.push(format!("DB_PORT={}", db.port));
        lines.push(format!("DB_NAME={}", db.db_name));
        lines.push(format!("DB_USER={}", db.user));
        lines.push(format!("DB_PASSWORD={}", db.password));
    }

    if auth_needed {
        lines.push("# REQUIRED - user must add the Clerk keys below".to_string());
        lines.push("CLERK_SECRET_KEY=<YOUR_CLERK_SECRET_KEY>".to_string());
        lines.push("CLERK_PUBLISHABLE_KEY=<YOUR_CLERK_PUBLISHABLE_KEY>".to_string());
        lines.push("CLERK_WEBHOOK_SECRET=<YOUR_CLERK_WEBHOOK_SECRET>".to_string());
    }

    if payment_needed {
        lines.push("# REQUIRED - user must add the Stripe keys below".to_string());
        lines.push("STRIPE_SECRET_KEY=<YOUR_STRIPE_SECRET_KEY>".to_string());
        lines.push("STRIPE_WEBHOOK_SECRET=<YOUR_STRIPE_WEBHOOK_SECRET>".to_string());
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// The package set implied by the detected intents. The HTTP server is
/// always installed.
pub fn packages_for(database: bool, auth: bool, payment: bool) -> Vec<&'static str> {
    let mut packages = vec!["nitropack", "h3"];
    if database {
        packages.push("pg");
    }
    if auth {
        packages.push("@clerk/backend");
    }
    if payment {
        packages.push("stripe");
    }
    packages
}

/// Initialize a minimal HTTP server project in a fresh sandbox: package
/// manager, skeleton files, dependencies, `.env`, health endpoint, and an
/// initial git commit.
pub async fn initialize_project(sandbox: &dyn Sandbox, init: &ProjectInit<'_>) -> Result<()> {
    let install_pm = sandbox
        .exec_with_timeout("npm install -g pnpm", INSTALL_TIMEOUT)
        .await?;
    if !install_pm.success() {
        anyhow::bail!("pnpm installation failed: {}", install_pm.stderr.trim());
    }

    sandbox.write_file("package.json", PACKAGE_JSON).await?;
    sandbox.write_file("nitro.config.ts", NITRO_CONFIG).await?;

    let packages = packages_for(
        init.database.is_some(),
        init.auth_needed,
        init.payment_needed,
    );
    let add = sandbox
        .exec_with_timeout(&format!("pnpm add {}", packages.join(" ")), INSTALL_TIMEOUT)
        .await?;
    if !add.success() {
        anyhow::bail!("Dependency installation failed: {}", add.stderr.trim());
    }

    let env_file = render_env_file(
        init.database,
        init.auth_needed,
        init.payment_needed,
        init.extra_env,
    );
    sandbox.write_file(".env", &env_file).await?;
    sandbox
        .write_file("server/api/health.get.js", HEALTH_ENDPOINT)
        .await?;
    sandbox.write_file(".gitignore", GITIGNORE).await?;

    let git_setup = sandbox
        .exec(
            "git init -q && \
             git config user.email 'worker@turbobackend.dev' && \
             git config user.name 'TurboBackend Worker' && \
             git add -A && \
             git commit -q -m 'Initial project scaffold'",
        )
        .await?;
    if !git_setup.success() {
        anyhow::bail!("Git initialization failed: {}", git_setup.stderr.trim());
    }

    info!(project_id = init.project_id, "Initialized project skeleton");
    Ok(())
}

/// Paths excluded from the object-store mirror.
const SYNC_EXCLUDES: &[&str] = &[
    "node_modules/*",
    ".git/*",
    ".output/*",
    ".nitro/*",
    ".cache/*",
    ".env",
    "fly.toml",
];

/// Mirror the sandbox tree to `s3://{bucket}/{project_id}/`, then upload a
/// `<file>.metadata.json` sidecar per source file for knowledge-base
/// ingestion.
pub async fn sync_to_object_store(
    sandbox: &dyn Sandbox,
    store: &ObjectStoreConfig,
    project_id: &str,
    user_id: &str,
) -> Result<()> {
    let excludes = SYNC_EXCLUDES
        .iter()
        .map(|e| format!("--exclude '{}'", e))
        .collect::<Vec<_>>()
        .join(" ");
    let prefix = format!("s3://{}/{}/", store.bucket, project_id);

    let sync = sandbox
        .exec_with_timeout(
            &format!("aws s3 sync . {} {} --only-show-errors", prefix, excludes),
            INSTALL_TIMEOUT,
        )
        .await?;
    if !sync.success() {
        anyhow::bail!("Object-store sync failed: {}", sync.stderr.trim());
    }

    // Sidecars are generated into a scratch mirror and synced separately so
    // the repository tree stays clean.
    let sidecars = format!(
        "rm -rf /tmp/kb-meta && mkdir -p /tmp/kb-meta && \
         git ls-files | while read -r f; do \
           mkdir -p \"/tmp/kb-meta/$(dirname \"$f\")\"; \
           printf '{{\"projectid\":\"%s\",\"userid\":\"%s\",\"language\":\"%s\",\"filepath\":\"%s\"}}' \
             '{project}' '{user}' \"${{f##*.}}\" \"$f\" > \"/tmp/kb-meta/$f.metadata.json\"; \
         done && aws s3 sync /tmp/kb-meta {prefix} --only-show-errors",
        project = project_id,
        user = user_id,
        prefix = prefix,
    );
    let meta = sandbox.exec_with_timeout(&sidecars, INSTALL_TIMEOUT).await?;
    if !meta.success() {
        anyhow::bail!("Metadata sidecar sync failed: {}", meta.stderr.trim());
    }

    info!(project_id, bucket = %store.bucket, "Mirrored project to object store");
    Ok(())
}
