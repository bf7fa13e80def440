use super::{ToolCommand, ToolError, ToolInvocation, TransformTool};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Runs the dbt command line against one project directory.
#[derive(Clone, Debug)]
pub struct DbtCli {
    executable: PathBuf,
    project_dir: PathBuf,
    profiles_dir: Option<PathBuf>,
    env_file: Option<PathBuf>,
    timeout: Duration,
}

impl DbtCli {
    /// Uses `<project_dir>/.env` for extra environment when it exists.
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        let env_file = Some(project_dir.join(".env")).filter(|path| path.is_file());
        Self {
            executable: PathBuf::from("dbt"),
            project_dir,
            profiles_dir: None,
            env_file,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn with_profiles_dir(mut self, profiles_dir: impl Into<PathBuf>) -> Self {
        self.profiles_dir = Some(profiles_dir.into());
        self
    }

    pub fn with_env_file(mut self, env_file: Option<PathBuf>) -> Self {
        self.env_file = env_file;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    fn profiles_dir(&self) -> &Path {
        self.profiles_dir.as_deref().unwrap_or(&self.project_dir)
    }

    fn extra_env(&self) -> Result<Vec<(String, String)>, ToolError> {
        let Some(path) = self.env_file.as_ref() else {
            return Ok(Vec::new());
        };
        let entries = dotenvy::from_path_iter(path)
            .map_err(|err| ToolError::Env(format!("{}: {err}", path.display())))?;
        entries
            .map(|entry| entry.map_err(|err| ToolError::Env(format!("{}: {err}", path.display()))))
            .collect()
    }

    fn build_command(&self, command: &ToolCommand) -> Result<Command, ToolError> {
        let mut process = Command::new(&self.executable);
        process
            .args(command.args())
            .arg("--project-dir")
            .arg(&self.project_dir)
            .arg("--profiles-dir")
            .arg(self.profiles_dir())
            .envs(self.extra_env()?)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(process)
    }
}

#[async_trait]
impl TransformTool for DbtCli {
    async fn invoke(&self, command: &ToolCommand) -> Result<ToolInvocation, ToolError> {
        let label = command.label();
        let mut process = self.build_command(command)?;
        tracing::info!(command = %label, project_dir = %self.project_dir.display(), "invoking dbt");

        let output = match tokio::time::timeout(self.timeout, process.output()).await {
            Ok(result) => result.map_err(|err| {
                ToolError::Spawn(format!("{}: {err}", self.executable.display()))
            })?,
            Err(_) => {
                tracing::warn!(command = %label, secs = self.timeout.as_secs(), "dbt timed out");
                return Err(ToolError::Timeout {
                    command: label,
                    secs: self.timeout.as_secs(),
                });
            }
        };

        let invocation = ToolInvocation {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if invocation.is_success() {
            tracing::debug!(command = %label, "dbt finished");
        } else {
            tracing::warn!(command = %label, exit_code = ?invocation.exit_code, "dbt failed");
        }
        Ok(invocation)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::tool::ModelSelection;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-dbt");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("script should be written");
        let mut permissions = std::fs::metadata(&path)
            .expect("script metadata")
            .permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).expect("script should be executable");
        path
    }

    #[tokio::test(flavor = "current_thread")]
    async fn invoke_expected_args_project_flags_and_env_file() {
        let project = tempfile::tempdir().expect("tempdir should be created");
        std::fs::write(project.path().join(".env"), "WAREHOUSE_NAME=sites\n")
            .expect(".env should be written");
        let script = write_script(project.path(), r#"echo "$@ $WAREHOUSE_NAME""#);

        let tool = DbtCli::new(project.path()).with_executable(&script);
        let invocation = tool
            .invoke(&ToolCommand::Run(ModelSelection::model("stg_sites")))
            .await
            .expect("invoke should succeed");

        assert!(invocation.is_success());
        let stdout = invocation.stdout.trim();
        assert!(stdout.starts_with("run --select stg_sites --project-dir "));
        assert!(stdout.contains("--profiles-dir"));
        assert!(stdout.ends_with(" sites"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn invoke_non_zero_exit_expected_failed_invocation() {
        let project = tempfile::tempdir().expect("tempdir should be created");
        let script = write_script(project.path(), "echo 'compilation error' >&2\nexit 2");

        let tool = DbtCli::new(project.path()).with_executable(&script);
        let command = ToolCommand::Test(ModelSelection::All);
        let invocation = tool.invoke(&command).await.expect("process should run");

        assert_eq!(invocation.exit_code, Some(2));
        let error = invocation
            .ensure_success(&command)
            .expect_err("exit 2 should fail");
        assert!(error.to_string().contains("compilation error"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn invoke_slow_process_expected_timeout() {
        let project = tempfile::tempdir().expect("tempdir should be created");
        let script = write_script(project.path(), "sleep 5");

        let tool = DbtCli::new(project.path())
            .with_executable(&script)
            .with_timeout(Duration::from_millis(100));
        let error = tool
            .invoke(&ToolCommand::GenerateDocs)
            .await
            .expect_err("slow process should time out");
        assert!(matches!(error, ToolError::Timeout { .. }));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn invoke_missing_executable_expected_spawn_error() {
        let project = tempfile::tempdir().expect("tempdir should be created");
        let tool = DbtCli::new(project.path()).with_executable(project.path().join("nope"));
        let error = tool
            .invoke(&ToolCommand::GenerateDocs)
            .await
            .expect_err("missing executable should fail");
        assert!(matches!(error, ToolError::Spawn(_)));
    }
}
