//! LLM-driven schema designer.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;

use crate::detectors::CostMeta;
use crate::ledger::{Ledger, NewCost};
use crate::llm::LlmClient;
use crate::util::{epoch_millis, epoch_seconds, extract_json_object};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesignedColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub col_type: String,
    #[serde(default)]
    pub constraints: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesignedTable {
    pub table_name: String,
    pub columns: Vec<DesignedColumn>,
    pub create_query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignedSchema {
    pub tables: Vec<DesignedTable>,
}

impl DesignedSchema {
    /// Render the schema for the agent's system prompt: every table with its
    /// columns, types, and constraints.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            out.push_str(&format!("Table: {}\n", table.table_name));
            for column in &table.columns {
                if column.constraints.is_empty() {
                    out.push_str(&format!("  - {} {}\n", column.name, column.col_type));
                } else {
                    out.push_str(&format!(
                        "  - {} {} ({})\n",
                        column.name, column.col_type, column.constraints
                    ));
                }
            }
        }
        out
    }
}

const DESIGNER_SYSTEM_PROMPT: &str = r#"You are a relational schema designer for generated HTTP APIs. Produce a PostgreSQL schema for the described application.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "tables": [
    {
      "tableName": "users",
      "columns": [
        {"name": "id", "type": "VARCHAR(32)", "constraints": "PRIMARY KEY"},
        {"name": "created_at", "type": "BIGINT", "constraints": "NOT NULL"}
      ],
      "createQuery": "CREATE TABLE users (id VARCHAR(32) PRIMARY KEY, created_at BIGINT NOT NULL)"
    }
  ]
}

Rules:
- Identifier columns use VARCHAR, never SERIAL or UUID types.
- Timestamp columns use BIGINT seconds since the epoch.
- Encode PRIMARY KEY, UNIQUE, NOT NULL, and FOREIGN KEY constraints inline in createQuery.
- Use unqualified table names: no schema prefix anywhere in createQuery.
- Order the tables so every FOREIGN KEY target is created first.
- Only include tables the application actually needs."#;

/// Ask the LLM for a schema. Accrues one cost entry and returns its USD
/// cost alongside the schema. Unlike the detectors, a failure here
/// propagates: the pipeline cannot continue without a schema once the
/// database detector said one is needed.
pub async fn design_schema(
    llm: &dyn LlmClient,
    ledger: &Ledger,
    conn: &mut PgConnection,
    meta: &CostMeta,
    user_request: &str,
) -> Result<(DesignedSchema, f64)> {
    let started_at = epoch_seconds();
    let started_ms = epoch_millis();

    let generation = llm
        .generate(user_request, Some(DESIGNER_SYSTEM_PROMPT))
        .await
        .context("Schema designer call failed")?;

    let cost = ledger
        .record_cost(
            conn,
            NewCost {
                project_id: &meta.project_id,
                job_id: &meta.job_id,
                user_id: &meta.user_id,
                prompt_content: user_request,
                message_type: "schema-design",
                model: llm.model(),
                input_tokens: generation.usage.input_tokens,
                output_tokens: generation.usage.output_tokens,
                time_to_completion_ms: epoch_millis() - started_ms,
                started_at,
            },
        )
        .await;

    Ok((parse_schema(&generation.text)?, cost))
}

fn parse_schema(text: &str) -> Result<DesignedSchema> {
    let json = extract_json_object(text)
        .ok_or_else(|| anyhow::anyhow!("Designer response contained no JSON object"))?;
    let schema: DesignedSchema =
        serde_json::from_str(&json).context("Failed to parse designer response")?;
    if schema.tables.is_empty() {
        anyhow::bail!("Designer returned an empty table list");
    }
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "tables": [
                {
                    "tableName": "users",
                    "columns": [
                        {"name": "id", "type": "VARCHAR(32)", "constraints": "PRIMARY KEY"},
                        {"name": "email", "type": "VARCHAR(255)", "constraints": "UNIQUE NOT NULL"}
                    ],
                    "createQuery": "CREATE TABLE users (id VARCHAR(32) PRIMARY KEY, email VARCHAR(255) UNIQUE NOT NULL)"
                },
                {
                    "tableName": "posts",
                    "columns": [
                        {"name": "id", "type": "VARCHAR(32)", "constraints": "PRIMARY KEY"},
                        {"name": "user_id", "type": "VARCHAR(32)", "constraints": "FOREIGN KEY REFERENCES users(id)"}
                    ],
                    "createQuery": "CREATE TABLE posts (id VARCHAR(32) PRIMARY KEY, user_id VARCHAR(32) REFERENCES users(id))"
                }
            ]
        }"#
    }

    #[test]
    fn test_parse_schema_two_tables() {
        let schema = parse_schema(sample_json()).unwrap();
        assert_eq!(schema.tables.len(), 2);
        assert_eq!(schema.tables[0].table_name, "users");
        assert!(schema.tables[1].create_query.starts_with("CREATE TABLE posts"));
    }

    #[test]
    fn test_parse_schema_with_markdown_wrapping() {
        let wrapped = format!("Here is the schema:\n```json\n{}\n```", sample_json());
        let schema = parse_schema(&wrapped).unwrap();
        assert_eq!(schema.tables.len(), 2);
    }

    #[test]
    fn test_parse_schema_rejects_empty() {
        assert!(parse_schema(r#"{"tables": []}"#).is_err());
    }

    #[test]
    fn test_parse_schema_rejects_prose() {
        assert!(parse_schema("I would suggest a users table").is_err());
    }

    #[test]
    fn test_render_lists_tables_and_columns() {
        let schema = parse_schema(sample_json()).unwrap();
        let rendered = schema.render();
        assert!(rendered.contains("Table: users"));
        assert!(rendered.contains("- email VARCHAR(255) (UNIQUE NOT NULL)"));
        assert!(rendered.contains("Table: posts"));
    }
}
