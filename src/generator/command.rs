//! Generator backend that shells out to an external CLI.

use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncWriteExt;

use crate::context::truncate_chars;
use crate::error::{Error, GenerationError, Result};
use crate::process;

use super::{GenerationReply, GenerationRequest, TextGenerator};

static REFUSAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(i can(?:no|')t|i'm (?:not able|unable)|i am (?:not able|unable)|i won't|i will not|sorry, but)")
        .expect("REFUSAL_RE regex should compile")
});

/// Runs `program args..`, writes the prompt to stdin and reads the reply
/// from stdout.
///
/// The slot's sample index and temperature are exported as
/// `REMEDIATION_SAMPLE` and `REMEDIATION_TEMPERATURE`.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
}

impl CommandGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Config("generation.command is empty".to_string()))?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }
}

fn backend(msg: String) -> Error {
    Error::Generation(GenerationError::Backend(msg))
}

/// Refusals are plain prose; anything carrying a JSON object is parsed.
fn is_refusal(output: &str) -> bool {
    !output.contains('{') && REFUSAL_RE.is_match(output)
}

#[async_trait]
impl TextGenerator for CommandGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationReply> {
        tracing::debug!(
            program = %self.program,
            sample = request.sample,
            temperature = request.temperature,
            "spawning generator"
        );

        let mut cmd = process::command(&self.program);
        cmd.args(&self.args)
            .env("REMEDIATION_SAMPLE", request.sample.to_string())
            .env("REMEDIATION_TEMPERATURE", format!("{:.2}", request.temperature))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = process::spawn(&mut cmd)
            .map_err(|e| backend(format!("failed to spawn {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.take_stdin() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(|e| backend(format!("failed to write prompt: {}", e)))?;
            // Dropping stdin closes it so the program sees EOF
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| backend(format!("failed to wait for {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(backend(format!(
                "{} exited with {:?}: {}",
                self.program,
                output.status.code(),
                truncate_chars(stderr.trim(), 500)
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        if is_refusal(&text) {
            return Ok(GenerationReply::Refusal(truncate_chars(text.trim(), 500).to_string()));
        }
        Ok(GenerationReply::Text(text))
    }

    fn name(&self) -> &str {
        &self.program
    }
}
