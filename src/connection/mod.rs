// Connection manager
// One pooled session per remote target, rebuilt transparently when it dies

mod loopback;
mod retry;
mod ssh;
mod target;
mod transport;

pub use loopback::LoopbackConnector;
pub use retry::RetryPolicy;
pub use ssh::SshConnector;
pub use target::{RemoteTarget, TargetKey};
pub use transport::{
    local_partial_path, partial_name, remote_join, remote_parent, shell_quote, CommandOutput,
    Connector, RangeRead, RemoteDirEntry, RemoteFileStat, RemoteSession, TransportError,
};

use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{OrchestratorError, OrchestratorResult};

/// How much longer a ping may take on a session that is carrying other work
const BUSY_PING_FACTOR: u32 = 4;

/// Pool of authenticated sessions keyed by target identity
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    retry: RetryPolicy,
    sessions: DashMap<TargetKey, Arc<dyn RemoteSession>>,
    /// Serializes connection attempts per target so two sessions never coexist
    connect_locks: DashMap<TargetKey, Arc<tokio::sync::Mutex<()>>>,
    liveness: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, connect_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            connector,
            connect_timeout,
            retry,
            sessions: DashMap::new(),
            connect_locks: DashMap::new(),
            liveness: Mutex::new(None),
        }
    }

    /// Return the live session for `target`, connecting if there is none.
    ///
    /// Unreachable and timeout failures are retried with backoff; auth and
    /// configuration failures are returned on the first attempt.
    pub async fn acquire(&self, target: &RemoteTarget) -> OrchestratorResult<Arc<dyn RemoteSession>> {
        let key = target.key();
        if let Some(session) = self.live_session(&key) {
            return Ok(session);
        }

        let lock = self
            .connect_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another task may have connected while we waited
        if let Some(session) = self.live_session(&key) {
            return Ok(session);
        }

        target.validate()?;
        let session = self.connect_with_retry(target).await?;
        self.sessions.insert(key, session.clone());
        Ok(session)
    }

    /// Drop the pooled session for `target`; the next acquire reconnects
    pub fn invalidate(&self, target: &RemoteTarget) {
        if let Some((_, session)) = self.sessions.remove(&target.key()) {
            session.mark_dead();
            info!(target = %target, "Session invalidated");
        }
    }

    /// Record a failed operation. Session-fatal errors evict the session,
    /// unless it was already replaced by a newer one.
    pub fn report_failure(&self, session: &Arc<dyn RemoteSession>, err: &TransportError) {
        if !err.kills_session() {
            return;
        }
        session.mark_dead();
        let key = session.target().key();
        if self
            .sessions
            .remove_if(&key, |_, pooled| same_session(pooled, session))
            .is_some()
        {
            warn!(target = %session.target(), error = %err, "Session marked dead");
        }
    }

    /// Number of sessions currently pooled
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Ping every pooled session once and evict the ones that fail.
    ///
    /// A session with operations in flight shares its transport with them,
    /// so its ping gets a longer deadline and a slow answer is not fatal.
    /// Transport errors still evict it.
    pub async fn check_liveness(&self) {
        let pooled: Vec<Arc<dyn RemoteSession>> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();

        for session in pooled {
            let busy = session.in_flight() > 0;
            let deadline = if busy {
                self.connect_timeout * BUSY_PING_FACTOR
            } else {
                self.connect_timeout
            };
            match tokio::time::timeout(deadline, session.ping()).await {
                Ok(Ok(())) => debug!(target = %session.target(), busy, "Liveness check ok"),
                Ok(Err(err)) => self.report_failure(&session, &failed_ping(err)),
                Err(_) if busy || session.in_flight() > 0 => {
                    debug!(
                        target = %session.target(),
                        in_flight = session.in_flight(),
                        "Liveness check slow on a busy session, keeping it"
                    );
                }
                Err(_) => self.report_failure(&session, &TransportError::Timeout(deadline)),
            }
        }
    }

    /// Start the periodic liveness check. Replaces any previous task.
    pub fn spawn_liveness(self: &Arc<Self>, interval: Duration) {
        let manager = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.check_liveness().await;
            }
        });

        let mut slot = self.liveness.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    /// Tear down every session and stop the liveness task
    pub fn shutdown(&self) {
        if let Some(task) = self.liveness.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        let count = self.sessions.len();
        self.sessions.retain(|_, session| {
            session.mark_dead();
            false
        });
        if count > 0 {
            info!(sessions = count, "Connection pool shut down");
        }
    }

    fn live_session(&self, key: &TargetKey) -> Option<Arc<dyn RemoteSession>> {
        let session = self.sessions.get(key).map(|entry| entry.value().clone())?;
        if session.is_alive() {
            return Some(session);
        }
        self.sessions
            .remove_if(key, |_, pooled| same_session(pooled, &session));
        None
    }

    async fn connect_with_retry(&self, target: &RemoteTarget) -> OrchestratorResult<Arc<dyn RemoteSession>> {
        let mut retries = 0u32;
        loop {
            let started = Instant::now();
            let attempt = tokio::time::timeout(
                self.connect_timeout,
                self.connector.connect(target, self.connect_timeout),
            )
            .await;

            let err = match attempt {
                Ok(Ok(session)) => {
                    info!(
                        target = %target,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        retries,
                        "Session established"
                    );
                    return Ok(session);
                }
                Ok(Err(err)) => err.for_target(target),
                Err(_) => OrchestratorError::Timeout {
                    target: target.label(),
                    after: self.connect_timeout,
                },
            };

            if !err.is_retryable() || !self.retry.allows(retries) {
                warn!(target = %target, error = %err, retries, "Connection failed");
                return Err(err);
            }

            retries += 1;
            let delay = self.retry.delay_for(retries);
            warn!(
                target = %target,
                error = %err,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                "Connection attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.liveness.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

fn same_session(a: &Arc<dyn RemoteSession>, b: &Arc<dyn RemoteSession>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// A failed no-op means the transport is gone, whatever the error said
fn failed_ping(err: TransportError) -> TransportError {
    if err.kills_session() {
        err
    } else {
        TransportError::Closed(format!("liveness check failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn loopback_target(dir: &TempDir) -> RemoteTarget {
        let key = dir.path().join("id_test");
        std::fs::write(&key, "key").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key, std::fs::Permissions::from_mode(0o600)).unwrap();
        }
        RemoteTarget::new("localhost", "trainer", key, dir.path().join("ws").display().to_string())
    }

    fn manager(connector: &LoopbackConnector, retries: u32) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(connector.clone()),
            Duration::from_secs(2),
            RetryPolicy::new(retries, Duration::from_millis(5)),
        )
    }

    #[tokio::test]
    async fn test_acquire_reuses_live_session() {
        let dir = TempDir::new().unwrap();
        let target = loopback_target(&dir);
        let connector = LoopbackConnector::new();
        let pool = manager(&connector, 0);

        let a = pool.acquire(&target).await.unwrap();
        let b = pool.acquire(&target).await.unwrap();
        assert!(same_session(&a, &b));
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(pool.session_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_connects_once() {
        let dir = TempDir::new().unwrap();
        let target = loopback_target(&dir);
        let connector = LoopbackConnector::new();
        let pool = Arc::new(manager(&connector, 0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let target = target.clone();
            tasks.push(tokio::spawn(async move { pool.acquire(&target).await.is_ok() }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_dead_session_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        let target = loopback_target(&dir);
        let connector = LoopbackConnector::new();
        let pool = manager(&connector, 0);

        let first = pool.acquire(&target).await.unwrap();
        pool.report_failure(&first, &TransportError::Closed("eof".to_string()));
        assert_eq!(pool.session_count(), 0);

        let second = pool.acquire(&target).await.unwrap();
        assert!(!same_session(&first, &second));
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_is_retried_then_reported() {
        let dir = TempDir::new().unwrap();
        let target = loopback_target(&dir);
        let connector = LoopbackConnector::new();
        connector.set_reachable(false);
        let pool = manager(&connector, 2);

        let err = pool.acquire(&target).await.err().unwrap();
        assert!(matches!(err, OrchestratorError::Unreachable { .. }));
        assert_eq!(connector.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_auth_failure_is_never_retried() {
        let dir = TempDir::new().unwrap();
        let target = loopback_target(&dir);
        let connector = LoopbackConnector::new();
        connector.set_reject_auth(true);
        let pool = manager(&connector, 5);

        let err = pool.acquire(&target).await.err().unwrap();
        assert!(matches!(err, OrchestratorError::Auth { .. }));
        assert_eq!(connector.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_liveness_check_evicts_dropped_session() {
        let dir = TempDir::new().unwrap();
        let target = loopback_target(&dir);
        let connector = LoopbackConnector::new();
        let pool = manager(&connector, 0);

        pool.acquire(&target).await.unwrap();
        connector.set_reachable(false);
        pool.check_liveness().await;
        assert_eq!(pool.session_count(), 0);

        connector.set_reachable(true);
        pool.acquire(&target).await.unwrap();
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_periodic_liveness_evicts_dropped_session() {
        let dir = TempDir::new().unwrap();
        let target = loopback_target(&dir);
        let connector = LoopbackConnector::new();
        let pool = Arc::new(manager(&connector, 0));
        pool.spawn_liveness(Duration::from_millis(20));

        pool.acquire(&target).await.unwrap();
        connector.set_reachable(false);

        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.session_count() > 0 {
            assert!(Instant::now() < deadline, "liveness task never evicted the session");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_slow_ping_keeps_busy_session() {
        let dir = TempDir::new().unwrap();
        let target = loopback_target(&dir);
        let connector = LoopbackConnector::new();
        connector.set_ping_delay(Duration::from_millis(250));
        let pool = ConnectionManager::new(
            Arc::new(connector.clone()),
            Duration::from_millis(50),
            RetryPolicy::new(0, Duration::from_millis(5)),
        );

        let session = pool.acquire(&target).await.unwrap();
        let training = {
            let session = session.clone();
            tokio::spawn(async move { session.exec("sleep 1").await })
        };
        while session.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Slower than connect_timeout but the session is carrying a long exec
        pool.check_liveness().await;
        assert_eq!(pool.session_count(), 1);
        assert!(session.is_alive());

        assert!(training.await.unwrap().unwrap().success());
        assert_eq!(session.in_flight(), 0);

        // Idle and still too slow: evicted
        pool.check_liveness().await;
        assert_eq!(pool.session_count(), 0);
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_slow_connect_is_a_timeout() {
        let dir = TempDir::new().unwrap();
        let target = loopback_target(&dir);
        let connector = LoopbackConnector::new();
        connector.set_connect_delay(Duration::from_millis(500));
        let pool = ConnectionManager::new(
            Arc::new(connector.clone()),
            Duration::from_millis(50),
            RetryPolicy::new(1, Duration::from_millis(5)),
        );

        let err = pool.acquire(&target).await.err().unwrap();
        match err {
            OrchestratorError::Timeout { after, .. } => assert_eq!(after, Duration::from_millis(50)),
            other => panic!("expected timeout, got {:?}", other),
        }
        // Timeouts are retryable
        assert_eq!(connector.connect_attempts(), 2);
        assert_eq!(pool.session_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_clears_pool() {
        let dir = TempDir::new().unwrap();
        let target = loopback_target(&dir);
        let connector = LoopbackConnector::new();
        let pool = Arc::new(manager(&connector, 0));
        pool.spawn_liveness(Duration::from_millis(50));

        let session = pool.acquire(&target).await.unwrap();
        pool.shutdown();
        assert_eq!(pool.session_count(), 0);
        assert!(!session.is_alive());
    }
}
