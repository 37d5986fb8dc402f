//! Ordered send/expect scripts run against one console session.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::session::{ConsoleSession, ExpectMatch, compile};

/// One step of a [`Batch`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Write bytes to the console
    Send(Vec<u8>),
    /// Wait for a pattern. `timeout` further limits the wait for this step;
    /// the batch deadline always applies.
    Expect {
        pattern: String,
        timeout: Option<Duration>,
    },
}

/// A script of steps sharing one overall deadline.
///
/// The deadline starts when [`Batch::run`] is called and each expect spends
/// from what is left of it. The first failing step ends the run.
#[derive(Clone, Debug)]
pub struct Batch {
    steps: Vec<Step>,
    timeout: Duration,
}

impl Batch {
    pub fn new(timeout: Duration) -> Self {
        Self {
            steps: Vec::new(),
            timeout,
        }
    }

    /// Provoke a prompt with a newline and wait for `banner`
    pub fn login_probe(banner: impl Into<String>, timeout: Duration) -> Self {
        Self::new(timeout).send("\n").expect(banner)
    }

    pub fn send(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.steps.push(Step::Send(data.into()));
        self
    }

    pub fn expect(mut self, pattern: impl Into<String>) -> Self {
        self.steps.push(Step::Expect {
            pattern: pattern.into(),
            timeout: None,
        });
        self
    }

    pub fn expect_within(mut self, pattern: impl Into<String>, timeout: Duration) -> Self {
        self.steps.push(Step::Expect {
            pattern: pattern.into(),
            timeout: Some(timeout),
        });
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run every step in order. Returns one match per expect step, or the
    /// error of the first step that failed.
    pub async fn run(self, session: &ConsoleSession) -> Result<Vec<ExpectMatch>> {
        let deadline = Instant::now() + self.timeout;
        let mut matches = Vec::new();

        for (index, step) in self.steps.into_iter().enumerate() {
            let outcome = match step {
                Step::Send(data) => session.send(&data).await.map(|()| None),
                Step::Expect { pattern, timeout } => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let budget = timeout.map_or(remaining, |t| t.min(remaining));
                    match compile(&pattern) {
                        Ok(compiled) => session
                            .expect_until(&compiled, Instant::now() + budget, budget)
                            .await
                            .map(Some),
                        Err(e) => Err(e),
                    }
                }
            };

            match outcome {
                Ok(Some(found)) => matches.push(found),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "Batch step {} on {} failed: {}",
                        index,
                        session.instance(),
                        e
                    );
                    return Err(e);
                }
            }
            debug!("Batch step {} on {} done", index, session.instance());
        }

        Ok(matches)
    }
}
