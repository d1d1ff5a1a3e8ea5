//! An objective that runs an external command per trial.

use std::io::Write as _;
use std::process::{Command, ExitStatus, Stdio};

use crate::config::{ParameterTree, RESERVED_KEYS};
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::objective::Objective;
use crate::trial::Trial;

/// Environment variable carrying the trial's parameters as JSON.
pub const PARAMS_ENV: &str = "HPD_PARAMS";

/// The marker line a command prints to report a pruned trial.
pub const PRUNED_MARKER: &str = "PRUNED";

/// Runs `argv` once per trial.
///
/// Before the command starts, every sampled and expression parameter of the
/// tree is resolved and the context is locked. The parameters are written
/// as a JSON object to the command's stdin and to [`PARAMS_ENV`]. The last
/// non-empty line of its stdout holds the objective values, separated by
/// whitespace; the line [`PRUNED_MARKER`] prunes the trial.
#[derive(Clone, Debug)]
pub struct CommandObjective {
    argv: Vec<String>,
    env: Vec<(String, String)>,
    paths: Vec<String>,
}

impl CommandObjective {
    /// An objective running `argv` with the parameters of `tree`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an empty command.
    pub fn new(argv: Vec<String>, tree: &ParameterTree) -> Result<Self> {
        if argv.is_empty() {
            return Err(Error::InvalidConfig(
                "no objective command; set `command` or pass one after `--`".into(),
            ));
        }
        Ok(Self {
            argv,
            env: Vec::new(),
            paths: tree.resolution_order(RESERVED_KEYS),
        })
    }

    /// Adds environment variables for the command.
    #[must_use]
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    /// The paths resolved before each run, in resolution order.
    #[must_use]
    pub fn paths(&self) -> &[String] {
        &self.paths
    }
}

impl Objective for CommandObjective {
    type Value = Vec<f64>;
    type Error = Error;

    fn evaluate(&self, ctx: &mut RunContext<'_>) -> Result<Vec<f64>> {
        ctx.lock(&self.paths)?;
        let params = serde_json::to_string(ctx.resolved())
            .map_err(|e| Error::ObjectiveFailed(format!("cannot encode parameters: {e}")))?;
        let trial = ctx.trial().map_or(0, Trial::number);

        let (program, args) = self
            .argv
            .split_first()
            .ok_or(Error::Internal("command objective without a program"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(PARAMS_ENV, &params)
            .env("HPD_STUDY", ctx.study_name())
            .env("HPD_TRIAL", trial.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::InvalidConfig(format!("cannot run '{program}': {e}")))?;
        let stdin = child.stdin.take();
        // Stdin is fed from its own thread while stdout is drained, so a
        // command that prints before reading cannot fill both pipes.
        let output = std::thread::scope(|scope| {
            if let Some(mut stdin) = stdin {
                let params = params.as_bytes();
                scope.spawn(move || {
                    // A command that ignores its stdin may exit before reading it.
                    if let Err(e) = stdin.write_all(params) {
                        trace_debug!(trial, error = %e, "command did not read its parameters");
                        #[cfg(not(feature = "tracing"))]
                        drop(e);
                    }
                });
            }
            child.wait_with_output()
        })?;
        parse_output(&String::from_utf8_lossy(&output.stdout), output.status)
    }
}

fn parse_output(stdout: &str, status: ExitStatus) -> Result<Vec<f64>> {
    let last = stdout.lines().map(str::trim).rev().find(|l| !l.is_empty());
    if last == Some(PRUNED_MARKER) {
        return Err(Error::TrialPruned);
    }
    if !status.success() {
        return Err(Error::ObjectiveFailed(format!("command exited with {status}")));
    }
    let line = last.ok_or_else(|| Error::ObjectiveFailed("command printed no result".into()))?;
    line.split_whitespace()
        .map(|v| {
            v.parse::<f64>()
                .map_err(|_| Error::ObjectiveFailed(format!("'{line}' is not a list of numbers")))
        })
        .collect()
}
