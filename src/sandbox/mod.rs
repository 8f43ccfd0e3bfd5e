//! Sandbox lifecycle.
//!
//! A sandbox is an externally-managed ephemeral compute environment with a
//! filesystem and a shell. The worker talks to it through the `Sandbox`
//! capability set: exec, read, write, delete, sync, stop. All paths are
//! relative to the project root, which is the sandbox user's home directory.

pub mod docker;
pub mod project;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// Default per-command timeout.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(120);
/// Package installation gets longer.
pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Provider-side identifier (container id).
    fn id(&self) -> &str;

    async fn exec_with_timeout(&self, command: &str, timeout: Duration) -> Result<ExecOutput>;

    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        self.exec_with_timeout(command, EXEC_TIMEOUT).await
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    async fn read_file(&self, path: &str) -> Result<String>;

    async fn delete_file(&self, path: &str) -> Result<()>;

    /// Stop and delete the sandbox. Callers whose outer operation already
    /// succeeded log and tolerate teardown errors.
    async fn stop(&self) -> Result<()>;
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provider tag recorded on the container session row.
    fn name(&self) -> &str;

    /// Create a fresh sandbox with the given environment and the build tools
    /// later phases rely on (file-tree utility, object-store CLI).
    async fn provision(
        &self,
        project_id: &str,
        env: &[(String, String)],
    ) -> Result<Box<dyn Sandbox>>;
}

/// Quote a string for POSIX shell interpolation.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// In-memory sandbox double for tests: records every exec, keeps files in a
/// map, and replays scripted exec outputs (default: exit 0, empty output).
#[derive(Default)]
pub struct MemorySandbox {
    pub files: Mutex<HashMap<String, String>>,
    execs: Mutex<Vec<String>>,
    scripted: Mutex<HashMap<String, ExecOutput>>,
}

impl MemorySandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        self
    }

    /// Commands containing `needle` return `output` instead of the default.
    pub fn script(&self, needle: &str, output: ExecOutput) {
        self.scripted
            .lock()
            .unwrap()
            .insert(needle.to_string(), output);
    }

    pub fn execs(&self) -> Vec<String> {
        self.execs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sandbox for MemorySandbox {
    fn id(&self) -> &str {
        "memory-sandbox"
    }

    async fn exec_with_timeout(&self, command: &str, _timeout: Duration) -> Result<ExecOutput> {
        self.execs.lock().unwrap().push(command.to_string());
        let scripted = self.scripted.lock().unwrap();
        for (needle, output) in scripted.iter() {
            if command.contains(needle.as_str()) {
                return Ok(output.clone());
            }
        }
        Ok(ExecOutput::default())
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No such file: {}", path))
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_plain() {
        assert_eq!(shell_quote("abc"), "'abc'");
    }

    #[test]
    fn test_shell_quote_embedded_quote() {
        assert_eq!(shell_quote("a'b"), r"'a'\''b'");
    }

    #[tokio::test]
    async fn test_memory_sandbox_records_and_scripts() {
        let sandbox = MemorySandbox::new();
        sandbox.script(
            "git rev-parse",
            ExecOutput {
                exit_code: 0,
                stdout: "abc123\n".into(),
                stderr: String::new(),
            },
        );

        let out = sandbox.exec("git rev-parse HEAD").await.unwrap();
        assert_eq!(out.stdout.trim(), "abc123");
        let other = sandbox.exec("ls").await.unwrap();
        assert!(other.success());
        assert_eq!(sandbox.execs().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_sandbox_files() {
        let sandbox = MemorySandbox::new();
        sandbox.write_file("a/b.txt", "hello").await.unwrap();
        assert_eq!(sandbox.read_file("a/b.txt").await.unwrap(), "hello");
        sandbox.delete_file("a/b.txt").await.unwrap();
        assert!(sandbox.read_file("a/b.txt").await.is_err());
    }
}
