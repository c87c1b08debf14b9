use std::time::Duration;

/// Errors that can escape [`crate::Runner::start`] or
/// [`crate::RunnerHandle::shutdown`]. Everything else (transient transport
/// errors, KV timeouts, callback failures) is handled internally per the
/// error handling design and never surfaces here.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
	#[error("tunnel failed to become ready on first attempt: {0}")]
	TunnelHandshakeFailed(#[source] anyhow::Error),

	#[error("invalid endpoint url: {0}")]
	InvalidEndpoint(#[source] anyhow::Error),

	#[error("core task ended unexpectedly")]
	CoreTaskGone,
}

/// Errors returned to actor code awaiting a KV call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KvError {
	#[error("kv request timed out after {0:?}")]
	Timeout(Duration),

	#[error("server rejected kv request: {0}")]
	Server(String),

	#[error("connection closed during shutdown")]
	ShuttingDown,

	#[error("unexpected response type for this kv operation")]
	UnexpectedResponse,
}
