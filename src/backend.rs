//! Generative backend contract and the default CLI-spawning backend.
//!
//! The engine never talks to a model directly; it goes through
//! `GenerationBackend`, which has two entry points: a raw structured
//! completion (used when object-formatted output is requested) and a
//! plain text completion (used for code generation). Both block until a
//! result or an error.

use serde_json::Value;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::errors::BackendError;

/// Parameters for one backend call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the backend for object-formatted (JSON) output.
    pub json_object: bool,
}

/// A blocking generative backend.
pub trait GenerationBackend {
    /// Structured completion. The completion text is expected at
    /// `choices[0].message.content`; callers fall back to the string
    /// form of the whole response when that path is absent.
    fn complete_raw(&self, request: &CompletionRequest) -> Result<Value, BackendError>;

    /// Plain text completion, for non-JSON (code) output.
    fn complete_text(&self, request: &CompletionRequest) -> Result<String, BackendError>;
}

/// Pull the completion content out of a raw structured response.
pub fn response_content(raw: &Value) -> String {
    raw.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| raw.to_string())
}

/// Backend that shells out to a generation CLI (`claude` by default,
/// overridable via `TESTLOOM_BACKEND_CMD`), passing the system prompt and
/// the user prompt as a stateless `--print` call.
pub struct CommandBackend {
    command: String,
    working_dir: Option<PathBuf>,
}

impl CommandBackend {
    pub fn new() -> CommandBackend {
        let command =
            std::env::var("TESTLOOM_BACKEND_CMD").unwrap_or_else(|_| "claude".to_string());
        CommandBackend {
            command,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> CommandBackend {
        self.working_dir = Some(dir);
        self
    }

    fn run(&self, request: &CompletionRequest) -> Result<String, BackendError> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("--print");
        cmd.arg("--system-prompt").arg(&request.system_prompt);
        cmd.arg("-p").arg(&request.user_prompt);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = cmd.output().map_err(|e| {
            BackendError::Fatal(format!(
                "failed to execute backend command '{}': {e}. Is it in your PATH?",
                self.command
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::Fatal(format!(
                "backend command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Default for CommandBackend {
    fn default() -> Self {
        CommandBackend::new()
    }
}

impl GenerationBackend for CommandBackend {
    fn complete_raw(&self, request: &CompletionRequest) -> Result<Value, BackendError> {
        let stdout = self.run(request)?;
        // Shape the CLI output like a structured chat response so the
        // engine's content path applies uniformly.
        Ok(serde_json::json!({
            "choices": [{"message": {"content": stdout}}]
        }))
    }

    fn complete_text(&self, request: &CompletionRequest) -> Result<String, BackendError> {
        self.run(request)
    }
}
