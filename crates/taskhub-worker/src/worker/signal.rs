//! The supervising shutdown signal.
//!
//! A worker stops when either the caller's token fires or the worker itself is
//! shut down. Both are checked directly rather than linked through a helper
//! task, so an observer never sees one fired and the combined signal not.

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    caller: CancellationToken,
    owner: CancellationToken,
}

impl ShutdownSignal {
    pub const fn new(caller: CancellationToken, owner: CancellationToken) -> Self {
        Self { caller, owner }
    }

    /// Returns `true` if either token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.caller.is_cancelled() || self.owner.is_cancelled()
    }

    /// Resolves once either token fires.
    pub async fn cancelled(&self) {
        tokio::select! {
            () = self.caller.cancelled() => {}
            () = self.owner.cancelled() => {}
        }
    }
}

impl From<CancellationToken> for ShutdownSignal {
    fn from(caller: CancellationToken) -> Self {
        Self::new(caller, CancellationToken::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_on_either_token() {
        let caller = CancellationToken::new();
        let owner = CancellationToken::new();
        let signal = ShutdownSignal::new(caller.clone(), owner.clone());
        assert!(!signal.is_cancelled());

        owner.cancel();
        assert!(signal.is_cancelled());
        signal.cancelled().await;

        let caller_only = ShutdownSignal::from(caller.clone());
        assert!(!caller_only.is_cancelled());
        caller.cancel();
        assert!(caller_only.is_cancelled());
        caller_only.cancelled().await;
    }
}
