//! Call context: cancellation, deadline and request-scoped metadata.
//!
//! A [`Context`] is cheap to clone and is handed down through every layer of
//! a call. Deriving a child (`with_cancel`, `with_timeout`) never affects the
//! parent, while cancelling a parent cancels all of its children.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::protocol::{Metadata, RpcError};

#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<(Instant, Duration)>,
    metadata: Metadata,
}

impl Context {
    /// A root context that is never done unless cancelled explicitly.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            metadata: Metadata::new(),
        }
    }

    /// Derives a child that can be cancelled independently of this context.
    pub fn with_cancel(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            metadata: self.metadata.clone(),
        }
    }

    /// Derives a child whose deadline is the earlier of the parent's and
    /// `now + timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some((existing, budget)) if existing <= candidate => (existing, budget),
            _ => (candidate, timeout),
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
            metadata: self.metadata.clone(),
        }
    }

    /// Returns this context with `metadata` merged over its own.
    pub fn with_metadata(mut self, metadata: &Metadata) -> Self {
        self.metadata.merge(metadata);
        self
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|(at, _)| at)
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|(at, _)| at.saturating_duration_since(Instant::now()))
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The reason this context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<RpcError> {
        if self.token.is_cancelled() {
            return Some(RpcError::Canceled("context canceled".to_string()));
        }
        match self.deadline {
            Some((at, budget)) if Instant::now() >= at => Some(deadline_exceeded(budget)),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> RpcError {
        match self.deadline {
            Some((at, budget)) => {
                tokio::select! {
                    _ = self.token.cancelled() => RpcError::Canceled("context canceled".to_string()),
                    _ = tokio::time::sleep_until(at) => deadline_exceeded(budget),
                }
            }
            None => {
                self.token.cancelled().await;
                RpcError::Canceled("context canceled".to_string())
            }
        }
    }
}

/// Expiry is reported as cancellation, with the timeout in the message.
fn deadline_exceeded(budget: Duration) -> RpcError {
    RpcError::Canceled(format!("deadline exceeded after {}ms", budget.as_millis()))
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
