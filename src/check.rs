//! Then-phase checks
//!
//! A check runs a probe and judges its result against an [`Expectation`].
//! A probe that times out counts as a failed run, never as a crash.

use crate::context::ScenarioContext;
use crate::probe::{ProbeError, ProbeResult, RunOptions};
use async_trait::async_trait;
use tracing::info;

/// What a probe run is expected to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// Exit code 0 within the deadline
    Success,
    /// Non-zero exit code, or no exit within the deadline
    Failure,
}

/// Error type for checks
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error(
        "expected success, got {}\n  stdout: {}\n  stderr: {}",
        describe_exit(.exit_code, .timed_out),
        lossy(.stdout),
        lossy(.stderr)
    )]
    UnexpectedFailure {
        exit_code: i32,
        timed_out: bool,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },

    #[error(
        "expected failure, got exit code 0\n  stdout: {}\n  stderr: {}",
        lossy(.stdout),
        lossy(.stderr)
    )]
    UnexpectedSuccess { stdout: Vec<u8>, stderr: Vec<u8> },

    #[error(transparent)]
    Probe(#[from] ProbeError),
}

fn describe_exit(exit_code: &i32, timed_out: &bool) -> String {
    if *timed_out {
        "timeout (probe did not terminate)".to_string()
    } else {
        format!("exit code {exit_code}")
    }
}

fn lossy(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.is_empty() {
        "<empty>".to_string()
    } else {
        text.to_string()
    }
}

/// Pass iff the probe exited 0 within its deadline
pub fn expect_success(result: &ProbeResult) -> Result<(), CheckError> {
    if result.succeeded() {
        Ok(())
    } else {
        Err(CheckError::UnexpectedFailure {
            exit_code: result.exit_code,
            timed_out: result.timed_out,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
        })
    }
}

/// Pass iff the probe exited non-zero or timed out
pub fn expect_failure(result: &ProbeResult) -> Result<(), CheckError> {
    if result.succeeded() {
        Err(CheckError::UnexpectedSuccess {
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
        })
    } else {
        Ok(())
    }
}

impl Expectation {
    pub fn judge(self, result: &ProbeResult) -> Result<(), CheckError> {
        match self {
            Self::Success => expect_success(result),
            Self::Failure => expect_failure(result),
        }
    }
}

/// A Then-phase step
#[async_trait]
pub trait Check: Send + Sync {
    /// Short label used in reports
    fn describe(&self) -> String;

    async fn verify(&self, ctx: &ScenarioContext) -> Result<(), CheckError>;
}

/// One probe invocation plus the outcome it must have
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCheck {
    name_prefix: String,
    command: Vec<String>,
    image: Option<String>,
    options: Option<RunOptions>,
    expectation: Expectation,
}

/// Expect `command` to exit 0 in a probe named after `name_prefix`
pub fn run_succeeds(name_prefix: impl Into<String>, command: Vec<String>) -> RunCheck {
    RunCheck::new(name_prefix, command, Expectation::Success)
}

/// Expect `command` to exit non-zero (or time out)
pub fn run_fails(name_prefix: impl Into<String>, command: Vec<String>) -> RunCheck {
    RunCheck::new(name_prefix, command, Expectation::Failure)
}

impl RunCheck {
    #[must_use]
    pub fn new(
        name_prefix: impl Into<String>,
        command: Vec<String>,
        expectation: Expectation,
    ) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            command,
            image: None,
            options: None,
            expectation,
        }
    }

    /// Mount extra credentials into the probe
    #[must_use]
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Use a different image than the suite's probe image
    #[must_use]
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    #[must_use]
    pub fn expectation(&self) -> Expectation {
        self.expectation
    }
}

#[async_trait]
impl Check for RunCheck {
    fn describe(&self) -> String {
        let verb = match self.expectation {
            Expectation::Success => "succeeds",
            Expectation::Failure => "fails",
        };
        let command = self.command.last().map_or("", String::as_str);
        format!("{} {verb}: {command}", self.name_prefix)
    }

    async fn verify(&self, ctx: &ScenarioContext) -> Result<(), CheckError> {
        let image = self
            .image
            .as_deref()
            .unwrap_or(&ctx.config().probe_image);

        let result = ctx
            .probe()
            .run_command(image, &self.name_prefix, &self.command, self.options.as_ref())
            .await?;

        self.expectation.judge(&result)?;

        info!(
            scenario = %ctx.scenario(),
            probe = %self.name_prefix,
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            "Check passed"
        );

        Ok(())
    }
}
