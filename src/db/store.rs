//! Store-of-record layer over the control database.
//!
//! Every function takes a `&mut PgConnection` so it runs on whatever the
//! caller holds: the job's outer transaction (`&mut *tx`) or a plain pooled
//! connection. The `Store` itself only carries the schema namespace.

use anyhow::{Context, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};

use super::models::*;

const MIGRATION_0001: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Clone)]
pub struct Store {
    schema: String,
}

impl Store {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Apply the control-database schema. Postgres does not allow multiple
    /// statements in one prepared query, so the migration file is split on
    /// `;` and applied statement by statement.
    pub async fn migrate(&self, pool: &PgPool) -> Result<()> {
        let sql = MIGRATION_0001.replace("{schema}", &self.schema);
        for stmt in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(stmt)
                .execute(pool)
                .await
                .with_context(|| format!("Migration statement failed: {}", crate::util::truncate(stmt, 80)))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // request log
    // ------------------------------------------------------------------

    pub async fn insert_request_log(
        &self,
        conn: &mut PgConnection,
        entry: &RequestLog,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {}.request_log \
             (request_id, project_id, user_id, intent, request_params, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            self.schema
        );
        sqlx::query(&sql)
            .bind(&entry.request_id)
            .bind(&entry.project_id)
            .bind(&entry.user_id)
            .bind(&entry.intent)
            .bind(&entry.request_params)
            .bind(&entry.status)
            .bind(entry.created_at)
            .execute(conn)
            .await
            .context("Failed to insert request log")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // project databases
    // ------------------------------------------------------------------

    /// Insert an active project-database row, deactivating any prior active
    /// row first so at most one active row exists per project.
    pub async fn insert_project_database(
        &self,
        conn: &mut PgConnection,
        record: &ProjectDatabase,
    ) -> Result<()> {
        let deactivate = format!(
            "UPDATE {}.project_databases SET is_active = FALSE, updated_at = $2 \
             WHERE project_id = $1 AND is_active",
            self.schema
        );
        sqlx::query(&deactivate)
            .bind(&record.project_id)
            .bind(record.updated_at)
            .execute(&mut *conn)
            .await
            .context("Failed to deactivate prior project databases")?;

        let insert = format!(
            "INSERT INTO {}.project_databases \
             (database_id, project_id, user_id, db_name, schema_name, environment, is_active, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            self.schema
        );
        sqlx::query(&insert)
            .bind(&record.database_id)
            .bind(&record.project_id)
            .bind(&record.user_id)
            .bind(&record.db_name)
            .bind(&record.schema_name)
            .bind(&record.environment)
            .bind(record.is_active)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(conn)
            .await
            .context("Failed to insert project database")?;
        Ok(())
    }

    pub async fn active_project_database(
        &self,
        conn: &mut PgConnection,
        project_id: &str,
    ) -> Result<Option<ProjectDatabase>> {
        let sql = format!(
            "SELECT * FROM {}.project_databases \
             WHERE project_id = $1 AND is_active \
             ORDER BY created_at DESC LIMIT 1",
            self.schema
        );
        let row = sqlx::query(&sql)
            .bind(project_id)
            .fetch_optional(conn)
            .await
            .context("Failed to query active project database")?;
        row.map(|r| project_database_from_row(&r)).transpose()
    }

    // ------------------------------------------------------------------
    // generated queries
    // ------------------------------------------------------------------

    pub async fn insert_generated_query(
        &self,
        conn: &mut PgConnection,
        record: &GeneratedQuery,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {}.generated_queries \
             (query_id, project_id, query_text, query_type, schema_name, execution_status, error_message, environment, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            self.schema
        );
        sqlx::query(&sql)
            .bind(&record.query_id)
            .bind(&record.project_id)
            .bind(&record.query_text)
            .bind(&record.query_type)
            .bind(&record.schema_name)
            .bind(record.execution_status.as_str())
            .bind(&record.error_message)
            .bind(&record.environment)
            .bind(record.created_at)
            .execute(conn)
            .await
            .context("Failed to insert generated query")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // github repos
    // ------------------------------------------------------------------

    pub async fn insert_github_repo(
        &self,
        conn: &mut PgConnection,
        record: &GithubRepo,
    ) -> Result<()> {
        let deactivate = format!(
            "UPDATE {}.github_repos SET is_active = FALSE, updated_at = $2 \
             WHERE project_id = $1 AND is_active",
            self.schema
        );
        sqlx::query(&deactivate)
            .bind(&record.project_id)
            .bind(record.updated_at)
            .execute(&mut *conn)
            .await
            .context("Failed to deactivate prior repos")?;

        let insert = format!(
            "INSERT INTO {}.github_repos \
             (repo_id, project_id, user_id, repo_url, repo_name, branch, is_active, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            self.schema
        );
        sqlx::query(&insert)
            .bind(&record.repo_id)
            .bind(&record.project_id)
            .bind(&record.user_id)
            .bind(&record.repo_url)
            .bind(&record.repo_name)
            .bind(&record.branch)
            .bind(record.is_active)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(conn)
            .await
            .context("Failed to insert github repo")?;
        Ok(())
    }

    pub async fn active_github_repo(
        &self,
        conn: &mut PgConnection,
        project_id: &str,
    ) -> Result<Option<GithubRepo>> {
        let sql = format!(
            "SELECT * FROM {}.github_repos \
             WHERE project_id = $1 AND is_active \
             ORDER BY created_at DESC LIMIT 1",
            self.schema
        );
        let row = sqlx::query(&sql)
            .bind(project_id)
            .fetch_optional(conn)
            .await
            .context("Failed to query active repo")?;
        row.map(|r| github_repo_from_row(&r)).transpose()
    }

    // ------------------------------------------------------------------
    // push history
    // ------------------------------------------------------------------

    pub async fn insert_push_history(
        &self,
        conn: &mut PgConnection,
        record: &PushHistory,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {}.push_history \
             (push_id, project_id, commit_sha, commit_message, files_changed, repo_url, environment, pushed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            self.schema
        );
        sqlx::query(&sql)
            .bind(&record.push_id)
            .bind(&record.project_id)
            .bind(&record.commit_sha)
            .bind(&record.commit_message)
            .bind(serde_json::json!(record.files_changed))
            .bind(&record.repo_url)
            .bind(&record.environment)
            .bind(record.pushed_at)
            .execute(conn)
            .await
            .context("Failed to insert push history")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // container sessions
    // ------------------------------------------------------------------

    pub async fn insert_container_session(
        &self,
        conn: &mut PgConnection,
        record: &ContainerSession,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {}.container_sessions \
             (session_id, project_id, container_id, provider, status, environment, started_at, stopped_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            self.schema
        );
        sqlx::query(&sql)
            .bind(&record.session_id)
            .bind(&record.project_id)
            .bind(&record.container_id)
            .bind(&record.provider)
            .bind(record.status.as_str())
            .bind(&record.environment)
            .bind(record.started_at)
            .bind(record.stopped_at)
            .execute(conn)
            .await
            .context("Failed to insert container session")?;
        Ok(())
    }

    pub async fn finish_container_session(
        &self,
        conn: &mut PgConnection,
        session_id: &str,
        status: SessionStatus,
        stopped_at: i64,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {}.container_sessions SET status = $2, stopped_at = $3 WHERE session_id = $1",
            self.schema
        );
        sqlx::query(&sql)
            .bind(session_id)
            .bind(status.as_str())
            .bind(stopped_at)
            .execute(conn)
            .await
            .context("Failed to finish container session")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // deployments
    // ------------------------------------------------------------------

    pub async fn insert_deployment(
        &self,
        conn: &mut PgConnection,
        record: &Deployment,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {}.deployments \
             (deployment_id, project_id, platform, app_name, url, status, deployed_at, last_updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            self.schema
        );
        sqlx::query(&sql)
            .bind(&record.deployment_id)
            .bind(&record.project_id)
            .bind(&record.platform)
            .bind(&record.app_name)
            .bind(&record.url)
            .bind(record.status.as_str())
            .bind(record.deployed_at)
            .bind(record.last_updated)
            .execute(conn)
            .await
            .context("Failed to insert deployment")?;
        Ok(())
    }

    pub async fn latest_deployment(
        &self,
        conn: &mut PgConnection,
        project_id: &str,
    ) -> Result<Option<Deployment>> {
        let sql = format!(
            "SELECT * FROM {}.deployments \
             WHERE project_id = $1 ORDER BY deployed_at DESC LIMIT 1",
            self.schema
        );
        let row = sqlx::query(&sql)
            .bind(project_id)
            .fetch_optional(conn)
            .await
            .context("Failed to query latest deployment")?;
        row.map(|r| deployment_from_row(&r)).transpose()
    }

    // ------------------------------------------------------------------
    // activity ledger
    // ------------------------------------------------------------------

    pub async fn insert_activity(
        &self,
        conn: &mut PgConnection,
        entry: &ActivityEntry,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {}.activity_log \
             (action_id, project_id, user_id, request_id, action_type, action_details, status, environment, reference_ids, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            self.schema
        );
        sqlx::query(&sql)
            .bind(&entry.action_id)
            .bind(&entry.project_id)
            .bind(&entry.user_id)
            .bind(&entry.request_id)
            .bind(&entry.action_type)
            .bind(&entry.action_details)
            .bind(&entry.status)
            .bind(&entry.environment)
            .bind(&entry.reference_ids)
            .bind(entry.created_at)
            .execute(conn)
            .await
            .context("Failed to insert activity entry")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // message costs
    // ------------------------------------------------------------------

    pub async fn insert_message_cost(
        &self,
        conn: &mut PgConnection,
        entry: &MessageCost,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {}.message_costs \
             (cost_id, project_id, job_id, user_id, prompt_content, message_type, model, input_tokens, output_tokens, cost_usd, time_to_completion, started_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            self.schema
        );
        sqlx::query(&sql)
            .bind(&entry.cost_id)
            .bind(&entry.project_id)
            .bind(&entry.job_id)
            .bind(&entry.user_id)
            .bind(&entry.prompt_content)
            .bind(&entry.message_type)
            .bind(&entry.model)
            .bind(entry.input_tokens)
            .bind(entry.output_tokens)
            .bind(entry.cost_usd)
            .bind(entry.time_to_completion)
            .bind(entry.started_at)
            .bind(entry.created_at)
            .execute(conn)
            .await
            .context("Failed to insert message cost")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // api blueprints
    // ------------------------------------------------------------------

    pub async fn insert_api_blueprint(
        &self,
        conn: &mut PgConnection,
        record: &ApiBlueprint,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {}.api_blueprints \
             (blueprint_id, project_id, request_id, blueprint_content, last_updated, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.schema
        );
        sqlx::query(&sql)
            .bind(&record.blueprint_id)
            .bind(&record.project_id)
            .bind(&record.request_id)
            .bind(&record.blueprint_content)
            .bind(record.last_updated)
            .bind(record.created_at)
            .execute(conn)
            .await
            .context("Failed to insert api blueprint")?;
        Ok(())
    }

    pub async fn latest_api_blueprint(
        &self,
        conn: &mut PgConnection,
        project_id: &str,
    ) -> Result<Option<ApiBlueprint>> {
        let sql = format!(
            "SELECT * FROM {}.api_blueprints \
             WHERE project_id = $1 ORDER BY created_at DESC LIMIT 1",
            self.schema
        );
        let row = sqlx::query(&sql)
            .bind(project_id)
            .fetch_optional(conn)
            .await
            .context("Failed to query latest blueprint")?;
        row.map(|r| api_blueprint_from_row(&r)).transpose()
    }

    pub async fn update_api_blueprint(
        &self,
        conn: &mut PgConnection,
        blueprint_id: &str,
        content: &serde_json::Value,
        last_updated: i64,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {}.api_blueprints SET blueprint_content = $2, last_updated = $3 \
             WHERE blueprint_id = $1",
            self.schema
        );
        sqlx::query(&sql)
            .bind(blueprint_id)
            .bind(content)
            .bind(last_updated)
            .execute(conn)
            .await
            .context("Failed to update api blueprint")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // credentials
    // ------------------------------------------------------------------

    pub async fn insert_credential_placeholder(
        &self,
        conn: &mut PgConnection,
        record: &CredentialPlaceholder,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {}.project_credentials \
             (credential_id, project_id, provider, variable_name, value, is_active, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            self.schema
        );
        sqlx::query(&sql)
            .bind(&record.credential_id)
            .bind(&record.project_id)
            .bind(&record.provider)
            .bind(&record.variable_name)
            .bind(&record.value)
            .bind(record.is_active)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(conn)
            .await
            .context("Failed to insert credential placeholder")?;
        Ok(())
    }
}

fn project_database_from_row(row: &PgRow) -> Result<ProjectDatabase> {
    Ok(ProjectDatabase {
        database_id: row.try_get("database_id")?,
        project_id: row.try_get("project_id")?,
        user_id: row.try_get("user_id")?,
        db_name: row.try_get("db_name")?,
        schema_name: row.try_get("schema_name")?,
        environment: row.try_get("environment")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn github_repo_from_row(row: &PgRow) -> Result<GithubRepo> {
    Ok(GithubRepo {
        repo_id: row.try_get("repo_id")?,
        project_id: row.try_get("project_id")?,
        user_id: row.try_get("user_id")?,
        repo_url: row.try_get("repo_url")?,
        repo_name: row.try_get("repo_name")?,
        branch: row.try_get("branch")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn deployment_from_row(row: &PgRow) -> Result<Deployment> {
    let status: String = row.try_get("status")?;
    Ok(Deployment {
        deployment_id: row.try_get("deployment_id")?,
        project_id: row.try_get("project_id")?,
        platform: row.try_get("platform")?,
        app_name: row.try_get("app_name")?,
        url: row.try_get("url")?,
        status: status
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?,
        deployed_at: row.try_get("deployed_at")?,
        last_updated: row.try_get("last_updated")?,
    })
}

fn api_blueprint_from_row(row: &PgRow) -> Result<ApiBlueprint> {
    Ok(ApiBlueprint {
        blueprint_id: row.try_get("blueprint_id")?,
        project_id: row.try_get("project_id")?,
        request_id: row.try_get("request_id")?,
        blueprint_content: row.try_get("blueprint_content")?,
        last_updated: row.try_get("last_updated")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_carry_schema_prefix() {
        let store = Store::new("turbobackend");
        // The migration template must qualify every table with the namespace.
        let sql = MIGRATION_0001.replace("{schema}", store.schema());
        assert!(sql.contains("turbobackend.activity_log"));
        assert!(sql.contains("turbobackend.project_databases"));
        assert!(!sql.contains("{schema}"));
    }

    #[test]
    fn test_migration_splits_into_statements() {
        let count = MIGRATION_0001
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .count();
        // One CREATE SCHEMA, eleven tables, one partial index.
        assert_eq!(count, 13);
    }
}
