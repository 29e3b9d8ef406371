use crate::error::{RagevalError, Result};
use std::fmt;

/// Lifecycle of one example inside a run.
///
/// `Failed` is reached from `Generated` (generation failed) or `Scored`
/// (factuality unscored) and still moves on to `Persisted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExampleState {
    Pending,
    Retrieved,
    Generated,
    Scored,
    Failed(String),
    Persisted,
}

impl ExampleState {
    fn allows(&self, next: &ExampleState) -> bool {
        use ExampleState::*;
        matches!(
            (self, next),
            (Pending, Retrieved)
                | (Retrieved, Generated)
                | (Generated, Scored)
                | (Generated, Failed(_))
                | (Scored, Failed(_))
                | (Scored, Persisted)
                | (Failed(_), Persisted)
        )
    }
}

impl fmt::Display for ExampleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExampleState::Pending => f.write_str("PENDING"),
            ExampleState::Retrieved => f.write_str("RETRIEVED"),
            ExampleState::Generated => f.write_str("GENERATED"),
            ExampleState::Scored => f.write_str("SCORED"),
            ExampleState::Failed(reason) => write!(f, "FAILED({})", reason),
            ExampleState::Persisted => f.write_str("PERSISTED"),
        }
    }
}

/// Tracks and logs the state of a single example.
#[derive(Debug)]
pub struct ExampleProgress {
    index: usize,
    state: ExampleState,
}

impl ExampleProgress {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: ExampleState::Pending,
        }
    }

    pub fn state(&self) -> &ExampleState {
        &self.state
    }

    /// Move to `next`; an illegal transition is a `Worker` error.
    pub fn advance(&mut self, next: ExampleState) -> Result<()> {
        if !self.state.allows(&next) {
            return Err(RagevalError::Worker(format!(
                "Example {}: illegal transition {} -> {}",
                self.index, self.state, next
            )));
        }
        log::debug!("Example {}: {} -> {}", self.index, self.state, next);
        self.state = next;
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.advance(ExampleState::Failed(reason.into()))
    }
}
