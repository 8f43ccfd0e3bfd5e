//! Project context loader for the modification pipeline.
//!
//! Reads the active project-database row and discovers existing route files
//! in the checked-out sandbox, deriving the HTTP method and route path from
//! each filename.

use anyhow::Result;
use sqlx::PgConnection;

use crate::agent::prompt::Endpoint;
use crate::config::ClusterConfig;
use crate::db::models::ProjectDatabase;
use crate::db::Store;
use crate::sandbox::Sandbox;
use crate::schema::{DatabaseInfo, DesignedSchema};

#[derive(Debug, Default)]
pub struct ProjectContext {
    pub database: Option<DatabaseInfo>,
    /// Reflected table schema of the existing database. Not implemented yet.
    pub database_schema: Option<DesignedSchema>,
    pub files: Vec<String>,
    pub endpoints: Vec<Endpoint>,
}

/// Derive an endpoint from a route file path.
///
/// `server/api/users/index.get.js` becomes `GET /api/users`;
/// `server/api/users/[id].put.ts` becomes `PUT /api/users/[id]`.
pub fn endpoint_from_path(path: &str) -> Option<Endpoint> {
    let relative = path.split("server/api/").nth(1)?;
    let mut segments: Vec<&str> = relative.rsplitn(3, '.').collect();
    if segments.len() != 3 {
        return None;
    }
    segments.reverse();
    let (stem, verb, ext) = (segments[0], segments[1], segments[2]);
    if ext != "js" && ext != "ts" {
        return None;
    }

    let mut route = stem.to_string();
    if route == "index" {
        route.clear();
    } else if let Some(prefix) = route.strip_suffix("/index") {
        route = prefix.to_string();
    }

    let route_path = if route.is_empty() {
        "/api".to_string()
    } else {
        format!("/api/{}", route)
    };

    Some(Endpoint {
        method: verb.to_uppercase(),
        path: route_path,
        file: path.to_string(),
    })
}

/// Discover route files under `server/api` in the sandbox.
async fn discover_route_files(sandbox: &dyn Sandbox) -> Result<Vec<String>> {
    let out = sandbox
        .exec("find server/api -type f \\( -name '*.js' -o -name '*.ts' \\) 2>/dev/null | sort")
        .await?;
    Ok(out
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| l.strip_prefix("./").unwrap_or(l).to_string())
        .collect())
}

fn database_info_from_record(record: &ProjectDatabase, cluster: &ClusterConfig) -> DatabaseInfo {
    DatabaseInfo {
        database_id: record.database_id.clone(),
        db_name: record.db_name.clone(),
        host: cluster.host.clone(),
        port: cluster.port,
        user: cluster.user.clone(),
        password: cluster.password.clone(),
        schema: DesignedSchema { tables: vec![] },
    }
}

pub async fn load_project_context(
    sandbox: &dyn Sandbox,
    store: &Store,
    conn: &mut PgConnection,
    cluster: &ClusterConfig,
    project_id: &str,
) -> Result<ProjectContext> {
    let database = store
        .active_project_database(conn, project_id)
        .await?
        .map(|record| database_info_from_record(&record, cluster));

    let files = discover_route_files(sandbox).await?;
    let endpoints = files
        .iter()
        .filter_map(|f| endpoint_from_path(f))
        .collect();

    Ok(ProjectContext {
        database,
        database_schema: None,
        files,
        endpoints,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{ExecOutput, MemorySandbox};

    #[test]
    fn test_endpoint_from_index_file() {
        let endpoint = endpoint_from_path("server/api/users/index.get.js").unwrap();
        assert_eq!(endpoint.method, "GET");
        assert_eq!(endpoint.path, "/api/users");
        assert_eq!(endpoint.file, "server/api/users/index.get.js");
    }

    #[test]
    fn test_endpoint_from_named_file() {
        let endpoint = endpoint_from_path("server/api/health.get.js").unwrap();
        assert_eq!(endpoint.method, "GET");
        assert_eq!(endpoint.path, "/api/health");
    }

    #[test]
    fn test_endpoint_from_param_file() {
        let endpoint = endpoint_from_path("server/api/users/[id].put.ts").unwrap();
        assert_eq!(endpoint.method, "PUT");
        assert_eq!(endpoint.path, "/api/users/[id]");
    }

    #[test]
    fn test_endpoint_root_index() {
        let endpoint = endpoint_from_path("server/api/index.get.js").unwrap();
        assert_eq!(endpoint.path, "/api");
    }

    #[test]
    fn test_endpoint_rejects_non_route_files() {
        assert!(endpoint_from_path("server/utils/db.js").is_none());
        assert!(endpoint_from_path("server/api/readme.md").is_none());
        assert!(endpoint_from_path("server/api/plain.js").is_none());
    }

    #[tokio::test]
    async fn test_discover_route_files_trims_and_sorts() {
        let sandbox = MemorySandbox::new();
        sandbox.script(
            "find server/api",
            ExecOutput {
                exit_code: 0,
                stdout: "server/api/users/index.get.js\nserver/api/users/index.post.js\n".into(),
                stderr: String::new(),
            },
        );
        let files = discover_route_files(&sandbox).await.unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("index.get.js"));
    }
}
