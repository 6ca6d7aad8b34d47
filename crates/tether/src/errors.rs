use std::io;
use std::sync::Arc;

/// Why a channel died, or why a send was refused.
///
/// Cloneable because a single cause fans out to every pending command and
/// every channel listener when a channel closes.
#[derive(Debug, Clone)]
pub enum ChannelError {
    /// Transport failure. Fatal to the channel.
    Io(Arc<io::Error>),
    /// Protocol violation: malformed frame, unknown service, unexpected
    /// token. Fatal to the channel, treated like a transport failure.
    Protocol(String),
    /// Redirection failed: peer unresolvable or hop unreachable.
    Redirect(String),
    /// The remote endpoint closed the channel with an error cause.
    PeerClosed(String),
    /// The channel is closed. This is the cause pending commands receive
    /// when the channel is closed gracefully while they are in flight.
    Closed,
    /// A send waited longer than the congestion stall bound.
    SendStalled,
}

impl ChannelError {
    pub(crate) fn io(e: io::Error) -> Self {
        ChannelError::Io(Arc::new(e))
    }
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Io(e) => write!(f, "transport failure: {e}"),
            ChannelError::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            ChannelError::Redirect(msg) => write!(f, "redirect failed: {msg}"),
            ChannelError::PeerClosed(cause) => write!(f, "closed by peer: {cause}"),
            ChannelError::Closed => write!(f, "channel closed"),
            ChannelError::SendStalled => write!(f, "send stalled under congestion"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Error from a blocking task's `get`.
#[derive(Debug)]
pub enum TaskError {
    /// The timeout elapsed before the task completed. Local-only: the work
    /// scheduled on the dispatch thread keeps running.
    TimedOut,
    /// The task failed; the original cause is preserved.
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::TimedOut => write!(f, "task timed out"),
            TaskError::Failed(e) => write!(f, "task failed: {e}"),
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TaskError::Failed(e) => Some(e.as_ref()),
            TaskError::TimedOut => None,
        }
    }
}
