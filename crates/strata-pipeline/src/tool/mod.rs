//! Client side of the external transformation tool (dbt in production).

mod dbt;

pub use dbt::DbtCli;

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelSelection {
    All,
    Model(String),
}

impl ModelSelection {
    pub fn model(name: impl Into<String>) -> Self {
        Self::Model(name.into())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ToolCommand {
    Run(ModelSelection),
    Test(ModelSelection),
    GenerateDocs,
    RunOperation { macro_name: String, args: Value },
}

impl ToolCommand {
    /// Export a warehouse table to a local Parquet file through the
    /// project's export macro.
    pub fn export_table(
        macro_name: impl Into<String>,
        table_name: &str,
        output_path: &str,
    ) -> Self {
        Self::RunOperation {
            macro_name: macro_name.into(),
            args: json!({ "table_name": table_name, "output_path": output_path }),
        }
    }

    /// Command-line arguments, without the executable or project flags.
    pub fn args(&self) -> Vec<String> {
        fn with_selection(verb: &str, selection: &ModelSelection) -> Vec<String> {
            match selection {
                ModelSelection::All => vec![verb.to_string()],
                ModelSelection::Model(model) => {
                    vec![verb.to_string(), "--select".to_string(), model.clone()]
                }
            }
        }

        match self {
            Self::Run(selection) => with_selection("run", selection),
            Self::Test(selection) => with_selection("test", selection),
            Self::GenerateDocs => vec!["docs".to_string(), "generate".to_string()],
            Self::RunOperation { macro_name, args } => vec![
                "run-operation".to_string(),
                macro_name.clone(),
                "--args".to_string(),
                args.to_string(),
            ],
        }
    }

    pub fn label(&self) -> String {
        self.args().join(" ")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolInvocation {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolInvocation {
    pub fn succeeded(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn ensure_success(self, command: &ToolCommand) -> Result<Self, ToolError> {
        if self.is_success() {
            return Ok(self);
        }
        Err(ToolError::Failed {
            command: command.label(),
            exit_code: self.exit_code,
            detail: failure_detail(&self),
        })
    }
}

/// dbt reports most failures on stdout, so fall back to it.
fn failure_detail(invocation: &ToolInvocation) -> String {
    let stderr = invocation.stderr.trim();
    let detail = if stderr.is_empty() {
        invocation.stdout.trim()
    } else {
        stderr
    };
    let lines: Vec<&str> = detail.lines().collect();
    let tail = lines.len().saturating_sub(20);
    lines[tail..].join("\n")
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("failed to spawn transformation tool: {0}")]
    Spawn(String),

    #[error("'{command}' timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("'{command}' exited with {}: {detail}", .exit_code.map_or_else(|| "signal".to_string(), |code| code.to_string()))]
    Failed {
        command: String,
        exit_code: Option<i32>,
        detail: String,
    },

    #[error("transformation tool environment error: {0}")]
    Env(String),
}

pub type SharedTransformTool = Arc<dyn TransformTool>;

#[async_trait]
pub trait TransformTool: Send + Sync {
    /// Runs `command` to completion. A non-zero exit is reported through the
    /// returned invocation; call [`ToolInvocation::ensure_success`] to turn
    /// it into an error.
    async fn invoke(&self, command: &ToolCommand) -> Result<ToolInvocation, ToolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_args_expected_dbt_cli_shapes() {
        assert_eq!(
            ToolCommand::Run(ModelSelection::model("stg_sites")).args(),
            vec!["run", "--select", "stg_sites"]
        );
        assert_eq!(ToolCommand::Test(ModelSelection::All).args(), vec!["test"]);
        assert_eq!(ToolCommand::GenerateDocs.label(), "docs generate");

        let export = ToolCommand::export_table(
            "export_table_to_parquet",
            "site_business_insights",
            "/tmp/x/site_business_insights.parquet",
        );
        let args = export.args();
        assert_eq!(&args[..3], &["run-operation", "export_table_to_parquet", "--args"]);
        let decoded: Value = serde_json::from_str(&args[3]).expect("args should be json");
        assert_eq!(decoded["table_name"], "site_business_insights");
        assert_eq!(decoded["output_path"], "/tmp/x/site_business_insights.parquet");
    }

    #[test]
    fn ensure_success_non_zero_exit_expected_failed_with_stdout_detail() {
        let command = ToolCommand::Test(ModelSelection::model("sites_enriched"));
        let invocation = ToolInvocation {
            exit_code: Some(1),
            stdout: "Failure in test not_null_sites_enriched_id".to_string(),
            stderr: String::new(),
        };

        let error = invocation
            .ensure_success(&command)
            .expect_err("non-zero exit should fail");
        assert_eq!(
            error.to_string(),
            "'test --select sites_enriched' exited with 1: Failure in test not_null_sites_enriched_id"
        );
    }
}
