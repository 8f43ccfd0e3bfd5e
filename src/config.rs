//! Runtime configuration for the worker.
//!
//! Everything comes from the environment. Required variables fail fast at
//! startup with the variable name in the error; optional ones carry the
//! defaults documented on each field.

use std::path::PathBuf;

use crate::errors::WorkerError;

/// Cluster credentials for the per-project database cluster. Distinct from
/// the control database: the provisioner connects to the cluster's admin
/// database to issue `CREATE DATABASE`.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// Object-store parameters handed to the sandbox for the CLI mirror.
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub database_url: String,
    /// Namespace prefix for every control-database statement.
    pub db_schema: String,
    pub cluster: ClusterConfig,
    pub object_store: ObjectStoreConfig,
    pub anthropic_api_key: String,
    /// Model used for the main agentic loop.
    pub agent_model: String,
    /// Model used for the classifiers and the schema designer.
    pub detector_model: String,
    pub github_token: String,
    pub github_owner: String,
    pub fly_api_token: String,
    pub fly_org: String,
    pub sandbox_image: String,
    /// Directory holding curated integration docs and example files.
    pub integrations_dir: PathBuf,
    pub concurrency: usize,
    /// Finite agentic-loop iteration cap. Required for production cost bounds.
    pub max_agent_iterations: u32,
    /// `production` disables the shutdown queue wipe.
    pub environment: String,
}

fn required(var: &'static str) -> Result<String, WorkerError> {
    std::env::var(var).map_err(|_| WorkerError::MissingEnv(var))
}

fn optional(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, WorkerError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| WorkerError::InvalidEnv { var, value: raw }),
        Err(_) => Ok(default),
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, WorkerError> {
        Ok(Self {
            redis_url: required("REDIS_URL")?,
            database_url: required("DATABASE_URL")?,
            db_schema: optional("DB_SCHEMA", "turbobackend"),
            cluster: ClusterConfig {
                host: required("DB_CLUSTER_HOST")?,
                port: parse_var("DB_CLUSTER_PORT", 5432)?,
                user: required("DB_CLUSTER_USER")?,
                password: required("DB_CLUSTER_PASSWORD")?,
            },
            object_store: ObjectStoreConfig {
                bucket: required("S3_BUCKET")?,
                region: optional("AWS_REGION", "us-east-1"),
                access_key_id: required("AWS_ACCESS_KEY_ID")?,
                secret_access_key: required("AWS_SECRET_ACCESS_KEY")?,
            },
            anthropic_api_key: required("ANTHROPIC_API_KEY")?,
            agent_model: optional("AGENT_MODEL", "claude-sonnet-4-20250514"),
            detector_model: optional("DETECTOR_MODEL", "claude-3-5-haiku-20241022"),
            github_token: required("GITHUB_TOKEN")?,
            github_owner: required("GITHUB_OWNER")?,
            fly_api_token: required("FLY_API_TOKEN")?,
            fly_org: optional("FLY_ORG", "personal"),
            sandbox_image: optional("SANDBOX_IMAGE", "node:20-bookworm"),
            integrations_dir: PathBuf::from(optional("INTEGRATIONS_DIR", "assets/integrations")),
            concurrency: parse_var("WORKER_CONCURRENCY", 5)?,
            max_agent_iterations: parse_var("MAX_AGENT_ITERATIONS", 25)?,
            environment: optional("WORKER_ENV", "development"),
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Worker-environment API keys copied into a generated project's `.env`
    /// during initialization, so the app can call the model provider without
    /// the user supplying a key first.
    pub fn project_env(&self) -> Vec<(String, String)> {
        vec![(
            "ANTHROPIC_API_KEY".to_string(),
            self.anthropic_api_key.clone(),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; each uses distinct variable names
    // to stay independent of execution order.

    #[test]
    fn test_parse_var_default_when_unset() {
        let v: usize = parse_var("TB_TEST_UNSET_CONCURRENCY", 5).unwrap();
        assert_eq!(v, 5);
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        unsafe { std::env::set_var("TB_TEST_BAD_PORT", "not-a-number") };
        let err = parse_var::<u16>("TB_TEST_BAD_PORT", 5432).unwrap_err();
        assert!(err.to_string().contains("TB_TEST_BAD_PORT"));
        unsafe { std::env::remove_var("TB_TEST_BAD_PORT") };
    }

    #[test]
    fn test_required_reports_variable_name() {
        let err = required("TB_TEST_DEFINITELY_MISSING").unwrap_err();
        assert!(err.to_string().contains("TB_TEST_DEFINITELY_MISSING"));
    }

    fn config_with_environment(env: &str) -> WorkerConfig {
        WorkerConfig {
            redis_url: String::new(),
            database_url: String::new(),
            db_schema: "turbobackend".into(),
            cluster: ClusterConfig {
                host: String::new(),
                port: 5432,
                user: String::new(),
                password: String::new(),
            },
            object_store: ObjectStoreConfig {
                bucket: String::new(),
                region: String::new(),
                access_key_id: String::new(),
                secret_access_key: String::new(),
            },
            anthropic_api_key: String::new(),
            agent_model: String::new(),
            detector_model: String::new(),
            github_token: String::new(),
            github_owner: String::new(),
            fly_api_token: String::new(),
            fly_org: String::new(),
            sandbox_image: String::new(),
            integrations_dir: PathBuf::new(),
            concurrency: 5,
            max_agent_iterations: 25,
            environment: env.to_string(),
        }
    }

    #[test]
    fn test_is_production() {
        assert!(config_with_environment("production").is_production());
        assert!(!config_with_environment("development").is_production());
    }

    #[test]
    fn test_project_env_carries_api_key() {
        let mut config = config_with_environment("test");
        config.anthropic_api_key = "sk-ant-test".into();
        let env = config.project_env();
        assert_eq!(
            env,
            vec![("ANTHROPIC_API_KEY".to_string(), "sk-ant-test".to_string())]
        );
    }
}
