//! Deterministic file injections after the agentic loop (creation intent):
//! CORS middleware, CI deploy workflow, deployment config, container recipe.

use anyhow::Result;

use crate::sandbox::Sandbox;

pub const CORS_MIDDLEWARE_PATH: &str = "server/middleware/cors.js";
pub const WORKFLOW_PATH: &str = ".github/workflows/deploy.yml";
pub const FLY_CONFIG_PATH: &str = "fly.toml";
pub const DOCKERFILE_PATH: &str = "Dockerfile";

/// Name of the repository secret the CI workflow deploys with.
pub const DEPLOY_SECRET_NAME: &str = "FLY_API_TOKEN";

/// Permissive CORS defaults; preflight requests are short-circuited.
pub fn cors_middleware() -> &'static str {
    r#"export default defineEventHandler((event) => {
  setResponseHeaders(event, {
    "Access-Control-Allow-Origin": "*",
    "Access-Control-Allow-Methods": "GET, POST, PUT, PATCH, DELETE, OPTIONS",
    "Access-Control-Allow-Headers": "Content-Type, Authorization",
    "Access-Control-Max-Age": "86400",
  });
  if (event.method === "OPTIONS") {
    setResponseStatus(event, 204);
    return "";
  }
});
"#
}

/// CI workflow: pushes to `main` deploy through the platform CLI using the
/// installed repository secret.
pub fn deploy_workflow() -> String {
    format!(
        r#"name: Deploy
on:
  push:
    branches: [main]
jobs:
  deploy:
    runs-on: ubuntu-latest
    concurrency: deploy-group
    steps:
      - uses: actions/checkout@v4
      - uses: superfly/flyctl-actions/setup-flyctl@master
      - run: flyctl deploy --remote-only
        env:
          FLY_API_TOKEN: ${{{{ secrets.{} }}}}
"#,
        DEPLOY_SECRET_NAME
    )
}

/// Deployment config: app name, primary region, port, auto-stop/start,
/// tiny VM resources.
pub fn fly_config(app_name: &str) -> String {
    format!(
        r#"app = "{}"
primary_region = "iad"

[build]

[http_service]
  internal_port = 3000
  force_https = true
  auto_stop_machines = "stop"
  auto_start_machines = true
  min_machines_running = 0

[[vm]]
  size = "shared-cpu-1x"
  memory = "256mb"
"#,
        app_name
    )
}

/// Container recipe for the Nitro server runtime.
pub fn dockerfile() -> &'static str {
    r#"FROM node:20-bookworm-slim AS build
WORKDIR /app
RUN npm install -g pnpm
COPY package.json pnpm-lock.yaml* ./
RUN pnpm install
COPY . .
RUN pnpm build

FROM node:20-bookworm-slim
WORKDIR /app
ENV NODE_ENV=production PORT=3000
COPY --from=build /app/.output ./.output
EXPOSE 3000
CMD ["node", ".output/server/index.mjs"]
"#
}

/// Write all injected files into the sandbox. Does not commit; the pipeline
/// stages and commits them in a single deterministic commit separate from
/// the agent's commits.
pub async fn inject_deploy_files(sandbox: &dyn Sandbox, app_name: &str) -> Result<()> {
    sandbox
        .write_file(CORS_MIDDLEWARE_PATH, cors_middleware())
        .await?;
    sandbox.write_file(WORKFLOW_PATH, &deploy_workflow()).await?;
    sandbox
        .write_file(FLY_CONFIG_PATH, &fly_config(app_name))
        .await?;
    sandbox.write_file(DOCKERFILE_PATH, dockerfile()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::MemorySandbox;

    #[test]
    fn test_cors_short_circuits_preflight() {
        let cors = cors_middleware();
        assert!(cors.contains("Access-Control-Allow-Origin"));
        assert!(cors.contains("OPTIONS"));
        assert!(cors.contains("204"));
    }

    #[test]
    fn test_workflow_targets_main_and_uses_secret() {
        let workflow = deploy_workflow();
        assert!(workflow.contains("branches: [main]"));
        assert!(workflow.contains("${{ secrets.FLY_API_TOKEN }}"));
        assert!(workflow.contains("flyctl deploy"));
    }

    #[test]
    fn test_fly_config_carries_app_name_and_resources() {
        let config = fly_config("turbobackend-p1");
        assert!(config.contains("app = \"turbobackend-p1\""));
        assert!(config.contains("internal_port = 3000"));
        assert!(config.contains("auto_stop_machines"));
        assert!(config.contains("shared-cpu-1x"));
    }

    #[test]
    fn test_dockerfile_runs_built_output() {
        let recipe = dockerfile();
        assert!(recipe.contains("pnpm build"));
        assert!(recipe.contains(".output/server/index.mjs"));
    }

    #[tokio::test]
    async fn test_inject_writes_all_four_files() {
        let sandbox = MemorySandbox::new();
        inject_deploy_files(&sandbox, "turbobackend-p1").await.unwrap();

        let files = sandbox.files.lock().unwrap();
        assert!(files.contains_key(CORS_MIDDLEWARE_PATH));
        assert!(files.contains_key(WORKFLOW_PATH));
        assert!(files.contains_key(FLY_CONFIG_PATH));
        assert!(files.contains_key(DOCKERFILE_PATH));
    }
}
