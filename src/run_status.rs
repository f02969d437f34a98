//! Cooperative stop signal with cascading scopes.
//!
//! A [`RunStatus`] wraps a cancellation token. Forking yields a child scope
//! that halts when the parent halts, while halting the child leaves the
//! parent running. The partition worker forks its own status from the event
//! source's so that revoking one partition never disturbs its siblings.

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct RunStatus {
    token: CancellationToken,
}

impl RunStatus {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Derive a child scope. The child observes the parent's halt; the parent
    /// does not observe the child's.
    pub fn fork(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    /// Signal this scope (and every scope forked from it) to stop.
    pub fn halt(&self) {
        self.token.cancel();
    }

    pub fn running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Resolves once this scope is halted.
    pub async fn done(&self) {
        self.token.cancelled().await;
    }

    /// The underlying cancellation scope, for callers that need to race it in
    /// their own `select!` arms.
    pub fn ctx(&self) -> &CancellationToken {
        &self.token
    }
}
