use thiserror::Error;

/// Terminal failure kinds of an agent run. Every error the loop observes is
/// classified into one of these before it reaches the final result; nothing
/// is silently dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    /// DNS, timeout, or I/O failure that survived the client's retry budget.
    #[error("transient network failure: {0}")]
    NetworkTransient(String),

    /// 4xx semantic failure, bad credentials, unknown model.
    #[error("model request rejected: {0}")]
    NetworkPermanent(String),

    /// The planner's decomposition could not be parsed. Planning failures
    /// are non-fatal at the loop level; this surfaces only from direct
    /// planner use.
    #[error("planner returned unparseable output: {0}")]
    PlannerParse(String),

    /// Screen capture refused on a protected screen under the Stop policy.
    #[error("capture blocked on a sensitive screen")]
    SensitiveScreen,

    #[error("no finish after {0} steps")]
    MaxStepsExceeded(u32),

    #[error("{0} consecutive unparseable model replies")]
    ParseBudgetExceeded(u32),

    /// The verifier said do-not-continue.
    #[error("planner aborted the run: {0}")]
    PlannerAbort(String),

    #[error("cancelled")]
    Cancelled,
}
