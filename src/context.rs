//! Per-request context: caller identity and cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Caller identity, as decoded from the transport's request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerId {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

/// A best-effort cancellation flag for a single in-flight request.
///
/// The transport flips this when the kernel aborts the request; a handler
/// observing it at a suspension point should return [`Errno::Interrupted`](crate::error::Errno::Interrupted)
/// rather than complete the operation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Everything a handler needs about the request it is serving, beyond the
/// opcode-specific arguments.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub caller: CallerId,
    pub cancel: CancelToken,
}

impl RequestContext {
    pub fn new(caller: CallerId) -> Self {
        Self {
            caller,
            cancel: CancelToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_shared_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
