//! Resumable step execution.
//!
//! [`StepRunner`] applies the session rules to every step:
//!
//! - A step already recorded in the session is skipped (unless it is an
//!   always-run step)
//! - Otherwise its body runs and, only if it returns `Ok`, the step is recorded
//! - After every step, executed or skipped, the runner stops for operator
//!   confirmation if the step is the configured pause point
//!
//! A failing body aborts the pipeline; later steps do not run and the failed
//! step stays unrecorded so that a re-run retries it.

use std::io::{self, IsTerminal, Write};

use tracing::{info, warn};

use crate::error::{BuildError, Result};
use crate::session::SessionStore;
use crate::steps::Step;

/// Asks the operator whether to continue at a pause point.
pub trait Confirm {
    fn confirm(&mut self, message: &str) -> Result<bool>;
}

/// Prompts on the terminal. A non-interactive stdin counts as "no".
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&mut self, message: &str) -> Result<bool> {
        if !io::stdin().is_terminal() {
            warn!("cannot prompt for confirmation: stdin is not a terminal");
            return Ok(false);
        }

        write!(io::stderr(), "{} [y/N] ", message)?;
        io::stderr().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        Ok(is_yes(&input))
    }
}

/// Accepts a fixed answer; useful for unattended runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedConfirm(pub bool);

impl Confirm for FixedConfirm {
    fn confirm(&mut self, _message: &str) -> Result<bool> {
        Ok(self.0)
    }
}

fn is_yes(input: &str) -> bool {
    matches!(input.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// What happened to a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Executed,
    Skipped,
}

/// Drives steps against a session.
pub struct StepRunner<C: Confirm> {
    session: SessionStore,
    pause_after: Option<Step>,
    confirm: C,
}

impl<C: Confirm> StepRunner<C> {
    pub fn new(session: SessionStore, pause_after: Option<Step>, confirm: C) -> Self {
        Self {
            session,
            pause_after,
            confirm,
        }
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionStore {
        &mut self.session
    }

    pub fn into_session(self) -> SessionStore {
        self.session
    }

    /// Run one step under the session rules.
    ///
    /// `body` gets the session so steps can cache or read the loop device.
    pub fn run_step<F>(&mut self, step: Step, body: F) -> Result<StepOutcome>
    where
        F: FnOnce(&mut SessionStore) -> Result<()>,
    {
        let name = step.name();
        if !step.always_run() && self.session.is_completed(name)? {
            info!("skipped {} as it already ran", name);
            self.check_pause(step)?;
            return Ok(StepOutcome::Skipped);
        }

        if step.always_run() {
            info!("running {} (idempotent step always run)", name);
        } else {
            info!("running {}", name);
        }

        body(&mut self.session)?;

        if !step.always_run() {
            self.session.mark_completed(name)?;
        }

        self.check_pause(step)?;
        Ok(StepOutcome::Executed)
    }

    /// Run `steps` in order, dispatching each to `handler`.
    ///
    /// Stops at the first error, which is returned unchanged.
    pub fn run_pipeline<F>(&mut self, steps: &[Step], mut handler: F) -> Result<Vec<StepOutcome>>
    where
        F: FnMut(Step, &mut SessionStore) -> Result<()>,
    {
        let mut outcomes = Vec::with_capacity(steps.len());
        for &step in steps {
            outcomes.push(self.run_step(step, |session| handler(step, session))?);
        }
        Ok(outcomes)
    }

    fn check_pause(&mut self, step: Step) -> Result<()> {
        if self.pause_after != Some(step) {
            return Ok(());
        }

        warn!(
            "pausing after {} as it is configured via the build var pause_after",
            step
        );
        if self.confirm.confirm("Continue?")? {
            Ok(())
        } else {
            Err(BuildError::OperatorAbort {
                step: step.name().to_string(),
            })
        }
    }
}
