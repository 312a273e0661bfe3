//! Batch execution: strategy selection and per-item outcomes.

use crate::error::Error;
use crate::state::result::Completion;

/// How a batch of commands is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStrategy {
    /// Send every command, then read every response in order
    Pipelined,
    /// Send one command and read its response before the next
    Sequential,
}

/// Pick the batch strategy.
///
/// Both conditions block pipelining on their own: the configuration may
/// disable it, and a negotiated LOCAL INFILE capability means any response may
/// turn into a file request that needs a synchronous exchange.
pub fn select_strategy(disable_pipeline: bool, local_infile_negotiated: bool) -> BatchStrategy {
    if disable_pipeline || local_infile_negotiated {
        BatchStrategy::Sequential
    } else {
        BatchStrategy::Pipelined
    }
}

/// Outcome of one item of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Update count reported by the server
    Updated(u64),
    /// Succeeded, but no update count is available
    SuccessNoInfo,
    Failed,
}

impl BatchOutcome {
    /// Value reported by `Statement.SUCCESS_NO_INFO` / `EXECUTE_FAILED` style APIs.
    pub const SUCCESS_NO_INFO: i64 = -2;
    pub const EXECUTE_FAILED: i64 = -3;

    /// Outcome of an item that produced `completions`.
    pub fn from_completions(completions: &[Completion]) -> Self {
        match completions {
            [Completion::Ok(ok)] => BatchOutcome::Updated(ok.affected_rows),
            _ => BatchOutcome::SuccessNoInfo,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, BatchOutcome::Failed)
    }

    /// Update count, or one of the negative markers.
    pub fn update_count(&self) -> i64 {
        match self {
            BatchOutcome::Updated(count) => i64::try_from(*count).unwrap_or(i64::MAX),
            BatchOutcome::SuccessNoInfo => Self::SUCCESS_NO_INFO,
            BatchOutcome::Failed => Self::EXECUTE_FAILED,
        }
    }
}

/// A batch or pipeline that failed part way.
///
/// Carries the outcome of every item that was answered, the completions read
/// so far and the error that triggered the failure.
#[derive(Debug)]
pub struct BatchError {
    outcomes: Vec<BatchOutcome>,
    completions: Vec<Completion>,
    cause: Box<Error>,
}

impl BatchError {
    pub fn new(outcomes: Vec<BatchOutcome>, completions: Vec<Completion>, cause: Error) -> Self {
        Self {
            outcomes,
            completions,
            cause: Box::new(cause),
        }
    }

    /// Per-item outcomes, in request order. Items after a connection failure
    /// are missing.
    pub fn outcomes(&self) -> &[BatchOutcome] {
        &self.outcomes
    }

    /// Number of successful items before the first failure.
    pub fn succeeded_before_failure(&self) -> usize {
        self.outcomes
            .iter()
            .take_while(|outcome| outcome.is_success())
            .count()
    }

    pub fn completions(&self) -> &[Completion] {
        &self.completions
    }

    pub fn cause(&self) -> &Error {
        &self.cause
    }

    pub fn into_cause(self) -> Error {
        *self.cause
    }
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (after {} of {} items)",
            self.cause,
            self.succeeded_before_failure(),
            self.outcomes.len()
        )
    }
}

/// Collects outcomes while a batch runs.
#[derive(Debug, Default)]
pub(crate) struct BatchCollector {
    outcomes: Vec<BatchOutcome>,
    completions: Vec<Completion>,
    cause: Option<Error>,
}

impl BatchCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn success(&mut self, completions: Vec<Completion>) {
        self.outcomes.push(BatchOutcome::from_completions(&completions));
        self.completions.extend(completions);
    }

    /// Record a failed item. The first failure becomes the cause.
    pub(crate) fn failure(&mut self, error: Error) {
        self.outcomes.push(BatchOutcome::Failed);
        if self.cause.is_none() {
            self.cause = Some(error);
        }
    }

    /// Record a failure that is not tied to one item (e.g. the connection broke
    /// while sending).
    pub(crate) fn abort(&mut self, error: Error) {
        if self.cause.is_none() {
            self.cause = Some(error);
        }
    }

    /// Per-item outcomes and all completions, or the aggregate error.
    pub(crate) fn finish(self) -> crate::error::Result<(Vec<BatchOutcome>, Vec<Completion>)> {
        match self.cause {
            None => Ok((self.outcomes, self.completions)),
            Some(cause) => Err(Error::Batch(Box::new(BatchError::new(
                self.outcomes,
                self.completions,
                cause,
            )))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerError;
    use crate::protocol::response::OkPacket;

    fn ok(affected_rows: u64) -> Completion {
        Completion::Ok(OkPacket {
            affected_rows,
            ..OkPacket::default()
        })
    }

    fn duplicate() -> Error {
        Error::Server(ServerError {
            code: 1062,
            sql_state: "23000".into(),
            message: "Duplicate entry".into(),
        })
    }

    #[test]
    fn strategy_checks_are_independent() {
        assert_eq!(select_strategy(false, false), BatchStrategy::Pipelined);
        assert_eq!(select_strategy(true, false), BatchStrategy::Sequential);
        assert_eq!(select_strategy(false, true), BatchStrategy::Sequential);
        assert_eq!(select_strategy(true, true), BatchStrategy::Sequential);
    }

    #[test]
    fn outcome_from_completions() {
        assert_eq!(BatchOutcome::from_completions(&[ok(2)]), BatchOutcome::Updated(2));
        assert_eq!(
            BatchOutcome::from_completions(&[ok(1), ok(1)]),
            BatchOutcome::SuccessNoInfo
        );
        assert_eq!(BatchOutcome::SuccessNoInfo.update_count(), -2);
        assert_eq!(BatchOutcome::Failed.update_count(), -3);
    }

    #[test]
    fn collector_keeps_first_cause() {
        let mut collector = BatchCollector::new();
        collector.success(vec![ok(1)]);
        collector.success(vec![ok(1)]);
        collector.failure(duplicate());
        collector.success(vec![ok(1)]);
        collector.failure(Error::Protocol("late".into()));

        let Err(Error::Batch(batch)) = collector.finish() else {
            panic!("expected a batch error");
        };
        assert_eq!(batch.succeeded_before_failure(), 2);
        assert_eq!(batch.outcomes().len(), 5);
        assert_eq!(batch.completions().len(), 3);
        assert_eq!(batch.cause().error_code(), Some(1062));
        assert_eq!(batch.cause().sqlstate(), "23000");
    }

    #[test]
    fn collector_without_failure() {
        let mut collector = BatchCollector::new();
        collector.success(vec![ok(1)]);
        let (outcomes, completions) = collector.finish().unwrap();
        assert_eq!(outcomes, [BatchOutcome::Updated(1)]);
        assert_eq!(completions.len(), 1);
    }
}
