//! Async, time-bounded access to a [`SessionBackend`].

use std::sync::Arc;
use std::time::Duration;

use orchestrator_tmux::{BackendError, BackendSession, BackendWindow, SessionBackend};
use tracing::warn;

use crate::error::{OrchestratorError, Result};

/// Wraps a blocking backend so every call runs on the blocking pool and is
/// abandoned after `timeout`.
///
/// A timed-out call surfaces as [`OrchestratorError::DeliveryTimeout`]; the
/// underlying process may still finish in the background.
#[derive(Clone)]
pub struct TimedBackend {
    inner: Arc<dyn SessionBackend>,
    timeout: Duration,
}

impl TimedBackend {
    pub fn new(inner: Arc<dyn SessionBackend>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn call<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SessionBackend) -> orchestrator_tmux::Result<T> + Send + 'static,
    {
        let backend = Arc::clone(&self.inner);
        let task = tokio::task::spawn_blocking(move || f(backend.as_ref()));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result.map_err(OrchestratorError::from),
            Ok(Err(join)) => Err(OrchestratorError::Backend(BackendError::CommandFailed(
                format!("{} aborted: {}", operation, join),
            ))),
            Err(_) => {
                warn!(operation, timeout_ms = self.timeout.as_millis() as u64, "backend call timed out");
                Err(OrchestratorError::DeliveryTimeout {
                    operation: operation.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }

    pub async fn create_session(&self, name: &str) -> Result<BackendSession> {
        let name = name.to_string();
        self.call("create_session", move |b| b.create_session(&name)).await
    }

    pub async fn create_window(&self, session: &str, title: &str) -> Result<BackendWindow> {
        let (session, title) = (session.to_string(), title.to_string());
        self.call("create_window", move |b| b.create_window(&session, &title))
            .await
    }

    pub async fn rename_window(&self, session: &str, window: u32, title: &str) -> Result<()> {
        let (session, title) = (session.to_string(), title.to_string());
        self.call("rename_window", move |b| b.rename_window(&session, window, &title))
            .await
    }

    pub async fn send_input(&self, session: &str, window: u32, text: &str) -> Result<()> {
        let (session, text) = (session.to_string(), text.to_string());
        self.call("send_input", move |b| b.send_input(&session, window, &text))
            .await
    }

    pub async fn send_keys(&self, session: &str, window: u32, keys: &str) -> Result<()> {
        let (session, keys) = (session.to_string(), keys.to_string());
        self.call("send_keys", move |b| b.send_keys(&session, window, &keys))
            .await
    }

    pub async fn capture_pane(&self, session: &str, window: u32, lines: u32) -> Result<String> {
        let session = session.to_string();
        self.call("capture_pane", move |b| b.capture_pane(&session, window, lines))
            .await
    }

    pub async fn kill_session(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.call("kill_session", move |b| b.kill_session(&name)).await
    }

    pub async fn kill_window(&self, session: &str, window: u32) -> Result<()> {
        let session = session.to_string();
        self.call("kill_window", move |b| b.kill_window(&session, window))
            .await
    }

    pub async fn list_sessions(&self) -> Result<Vec<BackendSession>> {
        self.call("list_sessions", |b| b.list_sessions()).await
    }

    pub async fn session_exists(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.call("session_exists", move |b| Ok(b.session_exists(&name)))
            .await
    }

    pub async fn has_window(&self, session: &str, window: u32) -> Result<bool> {
        let session = session.to_string();
        self.call("has_window", move |b| b.has_window(&session, window))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_tmux::MemoryBackend;

    #[tokio::test]
    async fn test_calls_pass_through() {
        let memory = Arc::new(MemoryBackend::new());
        let backend = TimedBackend::new(memory.clone(), Duration::from_secs(1));

        backend.create_session("proj").await.unwrap();
        let window = backend.create_window("proj", "executor-a").await.unwrap();
        backend.send_input("proj", window.index, "hello").await.unwrap();

        assert!(backend.session_exists("proj").await.unwrap());
        assert_eq!(memory.sent_input("proj", window.index), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_errors_keep_their_type() {
        let backend = TimedBackend::new(Arc::new(MemoryBackend::new()), Duration::from_secs(1));
        backend.create_session("proj").await.unwrap();

        let result = backend.send_input("proj", 7, "hello").await;
        assert!(matches!(result, Err(OrchestratorError::TargetNotFound(t)) if t == "proj:7"));
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let memory = Arc::new(MemoryBackend::new());
        let backend = TimedBackend::new(memory.clone(), Duration::from_millis(20));
        memory.set_latency(Some(Duration::from_millis(200)));

        let result = backend.create_session("proj").await;
        assert!(matches!(result, Err(OrchestratorError::DeliveryTimeout { .. })));
        assert!(result.unwrap_err().is_retryable());
    }
}
