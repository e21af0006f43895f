//! External tool invocation boundary
//!
//! A map job's real work is a long-running external command operating on a
//! local materialized copy of its input and writing a local output file. The
//! tool itself is a black box; this module only owns starting it inside the
//! job's scoped working directory and turning a bad exit into a retryable
//! error.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{EngineError, Result};

const STDERR_TAIL_BYTES: usize = 1024;

/// A command template with `{input}`, `{output}` and `{cores}` placeholders,
/// rendered per attempt. Serialized into job params so a resumed run rebuilds
/// the exact invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn render_args(&self, input: &Path, output: &Path, cores: u32) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
                    .replace("{cores}", &cores.to_string())
            })
            .collect()
    }

    /// Run the tool to completion inside `work_dir`.
    ///
    /// A non-zero exit is an `ExternalTool` error carrying the exit status
    /// and a stderr tail; the scheduler retries it within the job's budget.
    pub async fn run(
        &self,
        work_dir: &Path,
        input: &Path,
        output: &Path,
        cores: u32,
    ) -> Result<()> {
        let args = self.render_args(input, output, cores);
        debug!(program = %self.program, ?args, "invoking external tool");

        let result = Command::new(&self.program)
            .args(&args)
            .current_dir(work_dir)
            .output()
            .await?;

        if !result.status.success() {
            let status = match result.status.code() {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            };
            return Err(EngineError::ExternalTool {
                status,
                stderr: stderr_tail(&result.stderr),
            });
        }

        info!(program = %self.program, "external tool finished");
        Ok(())
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}
