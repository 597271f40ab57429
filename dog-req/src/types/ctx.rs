use tokio_util::sync::CancellationToken;

/// Per-call context: the cancellation signal every storage operation honors,
/// plus an optional trace id for log correlation.
#[derive(Debug, Clone, Default)]
pub struct QueueCtx {
    cancel: CancellationToken,

    /// Optional trace ID for distributed tracing
    pub trace_id: Option<String>,
}

impl QueueCtx {
    /// Create a context with a fresh, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the context to an existing cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Add a trace ID for distributed tracing
    pub fn with_trace_id(mut self, trace_id: String) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    /// Context cancelled together with this one (but not the other way round)
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            trace_id: self.trace_id.clone(),
        }
    }

    /// Context that ignores this one's cancellation; used for lock release
    /// after a loop has been told to stop.
    pub fn detached(&self) -> Self {
        Self {
            cancel: CancellationToken::new(),
            trace_id: self.trace_id.clone(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the context is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}
