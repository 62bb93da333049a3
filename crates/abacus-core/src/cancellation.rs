use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Single-slot registry enforcing one in-flight turn per orchestrator: a
/// new turn fires the previous turn's token before its own starts.
pub struct TurnCancellation {
    current: Mutex<Option<CancellationToken>>,
}

impl TurnCancellation {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    pub async fn begin_turn(&self) -> CancellationToken {
        let mut slot = self.current.lock().await;
        if let Some(previous) = slot.take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        token
    }

    pub async fn cancel_current(&self) {
        if let Some(token) = self.current.lock().await.take() {
            token.cancel();
        }
    }
}

impl Default for TurnCancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// Aborts its watcher task when dropped, so expired turns leave no timers
/// or forwarders behind.
pub struct AbortGuard {
    handle: JoinHandle<()>,
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Child token that fires when the parent fires or the timeout elapses,
/// whichever comes first.
pub fn with_timeout(
    parent: &CancellationToken,
    timeout: Duration,
) -> (CancellationToken, AbortGuard) {
    let child = parent.child_token();
    let timer = child.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        timer.cancel();
    });
    (child, AbortGuard { handle })
}

/// Forwards cancellation from an extra parent into `token`. Used to merge
/// the caller's signal with the turn-scoped token.
pub fn link_parent(token: &CancellationToken, parent: &CancellationToken) -> AbortGuard {
    let target = token.clone();
    let parent = parent.clone();
    let handle = tokio::spawn(async move {
        parent.cancelled().await;
        target.cancel();
    });
    AbortGuard { handle }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_new_turn_supersedes_the_previous_one() {
        let turns = TurnCancellation::new();
        let first = turns.begin_turn().await;
        assert!(!first.is_cancelled());
        let second = turns.begin_turn().await;
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[tokio::test]
    async fn timeout_fires_the_combined_token() {
        let parent = CancellationToken::new();
        let (token, _guard) = with_timeout(&parent, Duration::from_millis(30));
        assert!(!token.is_cancelled());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(token.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancel_fires_the_combined_token() {
        let parent = CancellationToken::new();
        let (token, _guard) = with_timeout(&parent, Duration::from_secs(3600));
        parent.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn dropping_the_guard_disarms_the_timer() {
        let parent = CancellationToken::new();
        let (token, guard) = with_timeout(&parent, Duration::from_millis(20));
        drop(guard);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn linked_parent_forwards_cancellation() {
        let caller = CancellationToken::new();
        let token = CancellationToken::new();
        let _guard = link_parent(&token, &caller);
        caller.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(token.is_cancelled());
    }
}
