use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::encoding::isolate_process_group;
use crate::error::{diagnostic_tail, SynthesisError, DIAGNOSTIC_TAIL_CHARS};
use crate::schema::{AudioKind, Scenario};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechRequest {
    pub text: String,
    pub voice: String,
}

/// Encoded speech with its container declared by the service.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub kind: AudioKind,
}

/// Text-to-speech collaborator. Synthesis is expected to be a pure function
/// of the request, so callers may retry it.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, request: &SpeechRequest)
        -> Result<SynthesizedAudio, SynthesisError>;
}

/// Resolves which voice speaks a line.
#[derive(Debug, Clone)]
pub struct VoiceCast {
    characters: BTreeMap<String, String>,
    default_voice: String,
}

impl VoiceCast {
    pub fn new(characters: BTreeMap<String, String>, default_voice: impl Into<String>) -> Self {
        Self {
            characters,
            default_voice: default_voice.into(),
        }
    }

    pub fn from_scenario(scenario: &Scenario, default_voice: impl Into<String>) -> Self {
        Self::new(
            scenario.characters.clone().unwrap_or_default(),
            default_voice,
        )
    }

    pub fn voice_for(&self, role: Option<&str>) -> &str {
        role.and_then(|role| self.characters.get(role))
            .map_or(self.default_voice.as_str(), String::as_str)
    }

    pub fn request(&self, role: Option<&str>, text: &str) -> SpeechRequest {
        SpeechRequest {
            text: text.to_owned(),
            voice: self.voice_for(role).to_owned(),
        }
    }
}

/// Runs an external speech program per line: the text goes to stdin, encoded
/// audio comes back on stdout. `{voice}` in an argument is replaced with the
/// voice description, which is also exported as `LESSONREEL_VOICE`.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    program: String,
    args: Vec<String>,
    kind: AudioKind,
    timeout: Duration,
}

impl CommandSynthesizer {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        kind: AudioKind,
        timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            kind,
            timeout,
        }
    }

    async fn run(&self, request: &SpeechRequest) -> Result<SynthesizedAudio, SynthesisError> {
        let args = self
            .args
            .iter()
            .map(|arg| arg.replace("{voice}", &request.voice))
            .collect::<Vec<_>>();

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .env("LESSONREEL_VOICE", &request.voice)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        isolate_process_group(&mut command);
        let mut child = command.spawn().map_err(|source| SynthesisError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        // Stdin is fed while stdout drains.
        let stdin = child.stdin.take();
        let send_text = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(request.text.as_bytes()).await {
                // Programs that take the text from arguments may close stdin early.
                Err(error) if error.kind() == ErrorKind::BrokenPipe => Ok(()),
                result => result,
            }
        };
        let (sent, output) = tokio::join!(send_text, child.wait_with_output());

        let output = output.map_err(|error| SynthesisError::Service {
            voice: request.voice.clone(),
            message: format!("failed waiting for '{}': {error}", self.program),
        })?;
        sent.map_err(|error| SynthesisError::Service {
            voice: request.voice.clone(),
            message: format!("failed to send text to '{}': {error}", self.program),
        })?;

        if !output.status.success() {
            return Err(SynthesisError::Service {
                voice: request.voice.clone(),
                message: format!(
                    "'{}' exited with {}: {}",
                    self.program,
                    output.status,
                    diagnostic_tail(
                        &String::from_utf8_lossy(&output.stderr),
                        DIAGNOSTIC_TAIL_CHARS
                    )
                ),
            });
        }
        if output.stdout.is_empty() {
            return Err(SynthesisError::EmptyAudio);
        }

        debug!(
            program = %self.program,
            bytes = output.stdout.len(),
            "synthesized line"
        );
        Ok(SynthesizedAudio {
            bytes: output.stdout,
            kind: self.kind,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for CommandSynthesizer {
    async fn synthesize(
        &self,
        request: &SpeechRequest,
    ) -> Result<SynthesizedAudio, SynthesisError> {
        tokio::time::timeout(self.timeout, self.run(request))
            .await
            .map_err(|_| SynthesisError::Timeout(self.timeout))?
    }
}
