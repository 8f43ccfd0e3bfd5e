//! System prompt assembly for the agentic loop.
//!
//! The prompt is composed deterministically from the base role prompt and
//! optional sections: database schema, auth integration, payment
//! integration, existing endpoints (modification intent). Re-assembling
//! with the same inputs yields the same prompt.

use super::integrations::IntegrationPack;
use crate::schema::DatabaseInfo;

/// A discovered HTTP endpoint in an existing project.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub method: String,
    pub path: String,
    pub file: String,
}

impl Endpoint {
    pub fn render(&self) -> String {
        format!("- {} {} ({})", self.method, self.path, self.file)
    }
}

const BASE_PROMPT: &str = r#"You are a backend engineer working inside an ephemeral Debian Linux sandbox with a POSIX shell. You are building a Node.js HTTP API with the Nitro server framework. The project root is the current working directory; every path and command you emit is relative to it.

You work in iterations. Each of your responses MUST be exactly one JSON document, no markdown fences, with this shape:
{
  "reasoning": "what you are doing and why, briefly",
  "commands": [
    {"type": "execute", "command": "shell command"},
    {"type": "write", "path": "relative/path.js", "content": "full file content"},
    {"type": "read", "path": "relative/path.js"},
    {"type": "delete", "path": "relative/path.js"},
    {"type": "db_query", "query": "CREATE TABLE ...", "schemaName": "table_name", "queryType": "CREATE TABLE"}
  ],
  "taskComplete": false,
  "summary": "one paragraph describing what was built, filled in when taskComplete is true",
  "apiBlueprint": { "endpoints": [ {"method": "GET", "path": "/api/...", "description": "...", "authRequired": false, "requestSchema": {}, "responseSchema": {}, "errors": []} ] }
}

Rules:
- Route files live under server/api/ and follow Nitro conventions: server/api/users/index.get.js handles GET /api/users, server/api/users/[id].get.js handles GET /api/users/[id].
- write commands replace the whole file; always emit complete file content.
- db_query commands are applied for you after the session; do not run DDL through execute.
- Set taskComplete to true only when the API is fully built; include apiBlueprint describing every endpoint when you do.
- After each iteration you receive the results of your commands as the next user message."#;

/// Inputs to system-prompt assembly.
#[derive(Default)]
pub struct PromptContext<'a> {
    pub database: Option<&'a DatabaseInfo>,
    pub auth: Option<&'a IntegrationPack>,
    pub payments: Option<&'a IntegrationPack>,
    pub existing_endpoints: Option<&'a [Endpoint]>,
    /// Set when the user explicitly asked for broader webhook handling.
    pub handle_all_payment_events: bool,
}

fn integration_section(title: &str, pack: &IntegrationPack, extra_rule: Option<&str>) -> String {
    let mut out = format!("\n\n## {}\n\n{}", title, pack.docs.trim());
    out.push_str(
        "\n\nExample files (paths are for reference only; adapt imports to this project's layout):\n",
    );
    for example in &pack.examples {
        out.push_str(&format!("\n--- {} ---\n{}\n", example.path, example.content.trim()));
    }
    if let Some(rule) = extra_rule {
        out.push_str(&format!("\n{}\n", rule));
    }
    out
}

pub fn build_system_prompt(ctx: &PromptContext<'_>) -> String {
    let mut prompt = BASE_PROMPT.to_string();

    if let Some(db) = ctx.database {
        prompt.push_str(&format!(
            "\n\n## Database\n\nA PostgreSQL database has been provisioned for this project. \
             Credentials are in the environment as DB_HOST, DB_PORT, DB_NAME, DB_USER, \
             DB_PASSWORD. The schema:\n\n{}\n\
             Create a connection utility at server/utils/db.js that reads the credentials \
             from the environment and exports a pg connection pool. Use parameterized \
             queries everywhere and handle query errors in every endpoint.",
            db.schema.render()
        ));
    }

    if let Some(pack) = ctx.auth {
        prompt.push_str(&integration_section("Authentication (Clerk)", pack, None));
    }

    if let Some(pack) = ctx.payments {
        let rule = if ctx.handle_all_payment_events {
            "The user asked for broader webhook coverage; handle the event types they requested."
        } else {
            "The webhook handler must by default handle only the payment succeeded event \
             (payment_intent.succeeded); ignore other event types."
        };
        prompt.push_str(&integration_section("Payments (Stripe)", pack, Some(rule)));
    }

    if let Some(endpoints) = ctx.existing_endpoints {
        prompt.push_str(
            "\n\n## Existing endpoints\n\nThis project already exists. Its current route files:\n\n",
        );
        for endpoint in endpoints {
            prompt.push_str(&endpoint.render());
            prompt.push('\n');
        }
        prompt.push_str(
            "\nPreserve the existing behavior of these endpoints unless the request explicitly \
             asks you to change them.",
        );
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::integrations::IntegrationExample;
    use crate::schema::{DesignedColumn, DesignedSchema, DesignedTable, DatabaseInfo};

    fn db_info() -> DatabaseInfo {
        DatabaseInfo {
            database_id: "db1".into(),
            db_name: "turbobackend_proj_p2".into(),
            host: "h".into(),
            port: 5432,
            user: "u".into(),
            password: "p".into(),
            schema: DesignedSchema {
                tables: vec![DesignedTable {
                    table_name: "users".into(),
                    columns: vec![DesignedColumn {
                        name: "id".into(),
                        col_type: "VARCHAR(32)".into(),
                        constraints: "PRIMARY KEY".into(),
                    }],
                    create_query: "CREATE TABLE users (id VARCHAR(32) PRIMARY KEY)".into(),
                }],
            },
        }
    }

    fn pack(provider: &str) -> IntegrationPack {
        IntegrationPack {
            provider: provider.into(),
            docs: format!("{} documentation summary", provider),
            examples: vec![IntegrationExample {
                path: format!("examples/{}/middleware.js", provider),
                content: "// example".into(),
            }],
        }
    }

    #[test]
    fn test_base_prompt_alone() {
        let prompt = build_system_prompt(&PromptContext::default());
        assert!(prompt.contains("taskComplete"));
        assert!(!prompt.contains("## Database"));
        assert!(!prompt.contains("## Existing endpoints"));
    }

    #[test]
    fn test_database_section_renders_schema() {
        let db = db_info();
        let ctx = PromptContext {
            database: Some(&db),
            ..Default::default()
        };
        let prompt = build_system_prompt(&ctx);
        assert!(prompt.contains("Table: users"));
        assert!(prompt.contains("server/utils/db.js"));
        assert!(prompt.contains("parameterized"));
    }

    #[test]
    fn test_auth_section_embeds_docs_and_examples() {
        let auth = pack("clerk");
        let ctx = PromptContext {
            auth: Some(&auth),
            ..Default::default()
        };
        let prompt = build_system_prompt(&ctx);
        assert!(prompt.contains("clerk documentation summary"));
        assert!(prompt.contains("examples/clerk/middleware.js"));
        assert!(prompt.contains("adapt imports"));
    }

    #[test]
    fn test_payment_section_default_webhook_rule() {
        let payments = pack("stripe");
        let ctx = PromptContext {
            payments: Some(&payments),
            ..Default::default()
        };
        let prompt = build_system_prompt(&ctx);
        assert!(prompt.contains("payment_intent.succeeded"));
        assert!(prompt.contains("only the payment succeeded event"));
    }

    #[test]
    fn test_existing_endpoints_section() {
        let endpoints = vec![
            Endpoint {
                method: "GET".into(),
                path: "/api/users".into(),
                file: "server/api/users/index.get.js".into(),
            },
            Endpoint {
                method: "POST".into(),
                path: "/api/users".into(),
                file: "server/api/users/index.post.js".into(),
            },
        ];
        let ctx = PromptContext {
            existing_endpoints: Some(&endpoints),
            ..Default::default()
        };
        let prompt = build_system_prompt(&ctx);
        assert!(prompt.contains("- GET /api/users (server/api/users/index.get.js)"));
        assert!(prompt.contains("Preserve the existing behavior"));
    }

    #[test]
    fn test_assembly_is_deterministic() {
        let db = db_info();
        let ctx = PromptContext {
            database: Some(&db),
            ..Default::default()
        };
        assert_eq!(build_system_prompt(&ctx), build_system_prompt(&ctx));
    }
}
