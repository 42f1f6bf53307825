use std::time::Duration;

use microrpc_common::protocol::Metadata;

use crate::backoff::Backoff;

/// Per-call overrides of the client's defaults.
///
/// Unset fields fall back to the [`ClientConfig`](crate::ClientConfig) the
/// client was built with. Headers are merged, with these taking precedence.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use microrpc_client::CallOptions;
///
/// let opts = CallOptions::default()
///     .with_header("x-request-id", "abc")
///     .with_request_timeout(Duration::from_secs(2))
///     .with_retry_budget(Duration::ZERO);
/// assert_eq!(opts.headers.get("x-request-id"), Some("abc"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub headers: Metadata,
    pub request_timeout: Option<Duration>,
    /// Total backoff delay after which failures stop being retried. Zero
    /// means a single attempt.
    pub retry_budget: Option<Duration>,
    pub backoff: Option<Backoff>,
    pub max_recv_msg_size: Option<usize>,
    pub max_send_msg_size: Option<usize>,
    /// Payload codec subtype, e.g. `json` or `postcard`.
    pub content_subtype: Option<String>,
}

impl CallOptions {
    pub fn with_header(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn with_headers(mut self, headers: &Metadata) -> Self {
        self.headers.merge(headers);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_retry_budget(mut self, budget: Duration) -> Self {
        self.retry_budget = Some(budget);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_max_recv_msg_size(mut self, size: usize) -> Self {
        self.max_recv_msg_size = Some(size);
        self
    }

    pub fn with_max_send_msg_size(mut self, size: usize) -> Self {
        self.max_send_msg_size = Some(size);
        self
    }

    pub fn with_content_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.content_subtype = Some(subtype.into());
        self
    }

    /// Layers `overrides` on top of `self`.
    pub fn merge(&self, overrides: CallOptions) -> CallOptions {
        let mut headers = self.headers.clone();
        headers.merge(&overrides.headers);
        CallOptions {
            headers,
            request_timeout: overrides.request_timeout.or(self.request_timeout),
            retry_budget: overrides.retry_budget.or(self.retry_budget),
            backoff: overrides.backoff.or_else(|| self.backoff.clone()),
            max_recv_msg_size: overrides.max_recv_msg_size.or(self.max_recv_msg_size),
            max_send_msg_size: overrides.max_send_msg_size.or(self.max_send_msg_size),
            content_subtype: overrides
                .content_subtype
                .or_else(|| self.content_subtype.clone()),
        }
    }
}
