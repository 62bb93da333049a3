use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use abacus_types::{SandboxOptions, SandboxResult};

/// How often a waiting caller re-checks the execution lock.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The seam to the embedded interpreter. An `Err` means the interpreter
/// infrastructure itself broke; code-level problems come back as a
/// `SandboxResult::Failure`.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(
        &self,
        code: &str,
        allowed_dir: &Path,
        options: &SandboxOptions,
    ) -> anyhow::Result<SandboxResult>;
}

/// Single-flight lock over the interpreter. The interpreter is a stateful,
/// non-reentrant resource; share one lock per interpreter instance, across
/// sessions if the interpreter is process-wide.
pub struct ExecutionLock {
    busy: AtomicBool,
}

impl ExecutionLock {
    pub fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
        }
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<ExecutionPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ExecutionPermit {
                lock: Arc::clone(self),
            })
    }
}

impl Default for ExecutionLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for the duration of one execution; dropping it releases the lock
/// on every exit path, including panics and early returns.
pub struct ExecutionPermit {
    lock: Arc<ExecutionLock>,
}

impl Drop for ExecutionPermit {
    fn drop(&mut self) {
        self.lock.busy.store(false, Ordering::Release);
    }
}

/// Serializes interpreter invocations and times each one for the turn's
/// cumulative wall-clock budget.
pub struct SandboxGuard {
    sandbox: Arc<dyn Sandbox>,
    lock: Arc<ExecutionLock>,
}

impl SandboxGuard {
    pub fn new(sandbox: Arc<dyn Sandbox>, lock: Arc<ExecutionLock>) -> Self {
        Self { sandbox, lock }
    }

    /// Waits for exclusive access by polling, checking the abort signal on
    /// every iteration so cancellation while queued is immediate. One more
    /// abort check after acquisition closes the poll/acquire race.
    pub async fn run_guarded(
        &self,
        code: &str,
        allowed_dir: &Path,
        options: &SandboxOptions,
        cancel: &CancellationToken,
    ) -> anyhow::Result<(SandboxResult, Duration)> {
        let permit = loop {
            if cancel.is_cancelled() {
                bail!("execution aborted while waiting for the interpreter");
            }
            if let Some(permit) = self.lock.try_acquire() {
                break permit;
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        };

        if cancel.is_cancelled() {
            bail!("execution aborted before it started");
        }

        let started = Instant::now();
        let result = self.sandbox.execute(code, allowed_dir, options).await;
        let elapsed = started.elapsed();
        drop(permit);

        result.map(|r| (r, elapsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct SleepySandbox {
        delay: Duration,
        running: AtomicUsize,
        max_seen: AtomicUsize,
    }

    #[async_trait]
    impl Sandbox for SleepySandbox {
        async fn execute(
            &self,
            _code: &str,
            _allowed_dir: &Path,
            _options: &SandboxOptions,
        ) -> anyhow::Result<SandboxResult> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(SandboxResult::Success {
                value: None,
                ended_with_expression: false,
                continue_thinking_called: false,
                prints: vec!["done".to_string()],
            })
        }
    }

    struct BrokenSandbox;

    #[async_trait]
    impl Sandbox for BrokenSandbox {
        async fn execute(
            &self,
            _code: &str,
            _allowed_dir: &Path,
            _options: &SandboxOptions,
        ) -> anyhow::Result<SandboxResult> {
            bail!("interpreter crashed");
        }
    }

    #[tokio::test]
    async fn concurrent_calls_never_overlap() {
        let sandbox = Arc::new(SleepySandbox {
            delay: Duration::from_millis(80),
            running: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });
        let lock = Arc::new(ExecutionLock::new());
        let guard = Arc::new(SandboxGuard::new(sandbox.clone(), lock));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let guard = Arc::clone(&guard);
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                guard
                    .run_guarded("code", Path::new("/tmp"), &SandboxOptions::default(), &cancel)
                    .await
            }));
        }
        for handle in handles {
            let (result, elapsed) = handle.await.expect("join").expect("run");
            assert!(result.is_success());
            assert!(elapsed >= Duration::from_millis(70));
        }
        assert_eq!(sandbox.max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_while_waiting_is_immediate() {
        let lock = Arc::new(ExecutionLock::new());
        let held = lock.try_acquire().expect("acquire");

        let sandbox = Arc::new(SleepySandbox {
            delay: Duration::from_millis(10),
            running: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });
        let guard = SandboxGuard::new(sandbox, Arc::clone(&lock));

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = guard
            .run_guarded("code", Path::new("/tmp"), &SandboxOptions::default(), &cancel)
            .await
            .err()
            .expect("expected error");
        assert!(err.to_string().contains("waiting"));
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(held);
    }

    #[tokio::test]
    async fn lock_is_released_after_a_failed_execution() {
        let lock = Arc::new(ExecutionLock::new());
        let guard = SandboxGuard::new(Arc::new(BrokenSandbox), Arc::clone(&lock));

        let cancel = CancellationToken::new();
        let err = guard
            .run_guarded("code", Path::new("/tmp"), &SandboxOptions::default(), &cancel)
            .await
            .err()
            .expect("expected error");
        assert!(err.to_string().contains("crashed"));
        assert!(lock.try_acquire().is_some());
    }
}
