//! Per-project database provisioner.
//!
//! Creates the project's database on the cluster (admin connection), records
//! the project-database row inside the caller's outer transaction, applies
//! the designed DDL inside a transaction on the new database, and writes one
//! generated-query audit row per attempted statement.

use anyhow::{Context, Result};
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};
use tracing::{info, warn};

use super::designer::DesignedSchema;
use crate::config::ClusterConfig;
use crate::db::models::{ExecutionStatus, GeneratedQuery, ProjectDatabase};
use crate::db::Store;
use crate::ledger::{action, Ledger, NewActivity};
use crate::util::{database_name_for, epoch_seconds, new_id};

/// Connection parameters plus the designed schema, handed to the sandbox
/// initializer and the agent prompt.
#[derive(Debug, Clone)]
pub struct DatabaseInfo {
    pub database_id: String,
    pub db_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub schema: DesignedSchema,
}

/// Postgres "duplicate_database" SQLSTATE.
const DUPLICATE_DATABASE: &str = "42P04";

fn is_duplicate_database(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(DUPLICATE_DATABASE))
}

/// First two keywords of a DDL statement, uppercased ("CREATE TABLE").
fn query_type_of(query: &str) -> String {
    query
        .split_whitespace()
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

async fn connect_cluster(cluster: &ClusterConfig, database: &str) -> Result<PgConnection> {
    let options = PgConnectOptions::new()
        .host(&cluster.host)
        .port(cluster.port)
        .username(&cluster.user)
        .password(&cluster.password)
        .database(database);
    PgConnection::connect_with(&options)
        .await
        .with_context(|| format!("Failed to connect cluster database {}", database))
}

/// Provision the project database and apply the designed DDL.
///
/// `conn` is the job's outer transaction on the control database; the
/// project-database row and the generated-query audit rows are written there
/// so a pipeline failure rolls them back. The DDL itself runs in its own
/// transaction against the newly created database and is rolled back as a
/// unit on the first error, which is then surfaced to the caller.
pub async fn provision_database(
    cluster: &ClusterConfig,
    store: &Store,
    ledger: &Ledger,
    conn: &mut PgConnection,
    project_id: &str,
    user_id: &str,
    environment: &str,
    schema: DesignedSchema,
) -> Result<DatabaseInfo> {
    let db_name = database_name_for(project_id);

    // CREATE DATABASE cannot run inside a transaction; use a one-shot admin
    // connection. "Already exists" is tolerated so a retried job converges.
    let mut admin = connect_cluster(cluster, "postgres").await?;
    let create = format!("CREATE DATABASE {}", db_name);
    match sqlx::query(&create).execute(&mut admin).await {
        Ok(_) => info!(db_name = %db_name, "Created project database"),
        Err(e) if is_duplicate_database(&e) => {
            warn!(db_name = %db_name, "Project database already exists, reusing");
        }
        Err(e) => {
            return Err(e).with_context(|| format!("CREATE DATABASE {} failed", db_name));
        }
    }
    admin.close().await.ok();

    let now = epoch_seconds();
    let record = ProjectDatabase {
        database_id: new_id(),
        project_id: project_id.to_string(),
        user_id: user_id.to_string(),
        db_name: db_name.clone(),
        schema_name: "public".to_string(),
        environment: environment.to_string(),
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    store.insert_project_database(conn, &record).await?;

    // Apply the DDL transactionally on the new database.
    let mut project_conn = connect_cluster(cluster, &db_name).await?;
    let mut ddl_tx = project_conn.begin().await?;
    let mut failure: Option<(usize, String)> = None;

    for (index, table) in schema.tables.iter().enumerate() {
        if let Err(e) = sqlx::query(&table.create_query).execute(&mut *ddl_tx).await {
            failure = Some((index, e.to_string()));
            break;
        }
    }

    if let Some((failed_index, ref error)) = failure {
        ddl_tx.rollback().await.ok();
        // Audit every attempted statement, including the failing one.
        for (index, table) in schema.tables.iter().take(failed_index + 1).enumerate() {
            let failed = index == failed_index;
            store
                .insert_generated_query(
                    conn,
                    &GeneratedQuery {
                        query_id: new_id(),
                        project_id: project_id.to_string(),
                        query_text: table.create_query.clone(),
                        query_type: query_type_of(&table.create_query),
                        schema_name: table.table_name.clone(),
                        execution_status: if failed {
                            ExecutionStatus::Failed
                        } else {
                            ExecutionStatus::Executed
                        },
                        error_message: failed.then(|| error.clone()),
                        environment: environment.to_string(),
                        created_at: epoch_seconds(),
                    },
                )
                .await?;
        }
        project_conn.close().await.ok();
        anyhow::bail!(
            "DDL failed on table {}: {}",
            schema.tables[failed_index].table_name,
            error
        );
    }

    ddl_tx.commit().await?;
    project_conn.close().await.ok();

    for table in &schema.tables {
        store
            .insert_generated_query(
                conn,
                &GeneratedQuery {
                    query_id: new_id(),
                    project_id: project_id.to_string(),
                    query_text: table.create_query.clone(),
                    query_type: query_type_of(&table.create_query),
                    schema_name: table.table_name.clone(),
                    execution_status: ExecutionStatus::Executed,
                    error_message: None,
                    environment: environment.to_string(),
                    created_at: epoch_seconds(),
                },
            )
            .await?;
    }

    ledger
        .record_activity(
            conn,
            NewActivity {
                project_id,
                user_id,
                request_id: None,
                action_type: action::DATABASE_CREATED,
                action_details: format!(
                    "Created database {} with {} tables",
                    db_name,
                    schema.tables.len()
                ),
                status: "success",
                reference_ids: serde_json::json!({
                    "database_id": record.database_id,
                    "database_name": db_name,
                }),
            },
        )
        .await;

    Ok(DatabaseInfo {
        database_id: record.database_id,
        db_name,
        host: cluster.host.clone(),
        port: cluster.port,
        user: cluster.user.clone(),
        password: cluster.password.clone(),
        schema,
    })
}

/// Apply deferred agent DDL (CREATE TABLE statements collected during a
/// modification run) to the project's existing database. Same discipline as
/// initial provisioning: one transaction on the project database, an audit
/// row per attempted statement in the caller's outer transaction.
#[allow(clippy::too_many_arguments)]
pub async fn apply_agent_ddl(
    cluster: &ClusterConfig,
    store: &Store,
    ledger: &Ledger,
    conn: &mut PgConnection,
    project_id: &str,
    user_id: &str,
    environment: &str,
    db_name: &str,
    queries: &[crate::agent::commands::DeferredQuery],
) -> Result<()> {
    if queries.is_empty() {
        return Ok(());
    }

    let mut project_conn = connect_cluster(cluster, db_name).await?;
    let mut ddl_tx = project_conn.begin().await?;
    let mut failure: Option<(usize, String)> = None;

    for (index, deferred) in queries.iter().enumerate() {
        if let Err(e) = sqlx::query(&deferred.query).execute(&mut *ddl_tx).await {
            failure = Some((index, e.to_string()));
            break;
        }
    }

    if let Some((failed_index, ref error)) = failure {
        ddl_tx.rollback().await.ok();
        for (index, deferred) in queries.iter().take(failed_index + 1).enumerate() {
            let failed = index == failed_index;
            store
                .insert_generated_query(
                    conn,
                    &GeneratedQuery {
                        query_id: new_id(),
                        project_id: project_id.to_string(),
                        query_text: deferred.query.clone(),
                        query_type: query_type_of(&deferred.query),
                        schema_name: deferred.schema_name.clone(),
                        execution_status: if failed {
                            ExecutionStatus::Failed
                        } else {
                            ExecutionStatus::Executed
                        },
                        error_message: failed.then(|| error.clone()),
                        environment: environment.to_string(),
                        created_at: epoch_seconds(),
                    },
                )
                .await?;
        }
        project_conn.close().await.ok();
        anyhow::bail!(
            "DDL failed on {}: {}",
            queries[failed_index].schema_name,
            error
        );
    }

    ddl_tx.commit().await?;
    project_conn.close().await.ok();

    for deferred in queries {
        store
            .insert_generated_query(
                conn,
                &GeneratedQuery {
                    query_id: new_id(),
                    project_id: project_id.to_string(),
                    query_text: deferred.query.clone(),
                    query_type: query_type_of(&deferred.query),
                    schema_name: deferred.schema_name.clone(),
                    execution_status: ExecutionStatus::Executed,
                    error_message: None,
                    environment: environment.to_string(),
                    created_at: epoch_seconds(),
                },
            )
            .await?;
    }

    let tables: Vec<&str> = queries.iter().map(|q| q.schema_name.as_str()).collect();
    ledger
        .record_activity(
            conn,
            NewActivity {
                project_id,
                user_id,
                request_id: None,
                action_type: action::TABLES_ADDED,
                action_details: format!("Added tables: {}", tables.join(", ")),
                status: "success",
                reference_ids: serde_json::json!({"tables": tables}),
            },
        )
        .await;

    info!(db_name, count = queries.len(), "Applied agent DDL");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_type_of() {
        assert_eq!(
            query_type_of("CREATE TABLE users (id VARCHAR(32))"),
            "CREATE TABLE"
        );
        assert_eq!(query_type_of("create index idx on t (c)"), "CREATE INDEX");
        assert_eq!(query_type_of("ALTER TABLE t ADD c BIGINT"), "ALTER TABLE");
    }

    #[test]
    fn test_query_type_of_single_word() {
        assert_eq!(query_type_of("VACUUM"), "VACUUM");
    }
}
