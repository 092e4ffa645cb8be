//! # Session/Job Registry
//!
//! Bidirectional routing index: which connection serves a session, and
//! which session owns a job. Routing is best-effort: a page refresh
//! legitimately orphans in-flight jobs, so "route if present, else
//! drop" is the contract, never "must deliver".

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};

use super::events::ClientEvent;

/// Injected registry service, created at server start and shared behind
/// an `Arc`. Job routing entries outlive their session's connection so
/// late events can still be attempted after a disconnect.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, mpsc::Sender<ClientEvent>>>,
    jobs: RwLock<HashMap<String, String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection to a session. A reconnect with the same
    /// session id replaces the previous connection.
    pub async fn register_session(&self, session_id: &str, tx: mpsc::Sender<ClientEvent>) {
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), tx);
    }

    /// Drop the connection entry only. Job bindings stay so a reconnect
    /// can pick the run back up.
    pub async fn unregister_session(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn bind_job(&self, job_id: &str, session_id: &str) {
        self.jobs
            .write()
            .await
            .insert(job_id.to_string(), session_id.to_string());
    }

    /// Remove the job routing entry once the job is terminal.
    pub async fn release_job(&self, job_id: &str) {
        self.jobs.write().await.remove(job_id);
    }

    pub async fn session_for_job(&self, job_id: &str) -> Option<String> {
        self.jobs.read().await.get(job_id).cloned()
    }

    pub async fn jobs_for_session(&self, session_id: &str) -> Vec<String> {
        self.jobs
            .read()
            .await
            .iter()
            .filter(|(_, sess)| sess.as_str() == session_id)
            .map(|(job, _)| job.clone())
            .collect()
    }

    /// Push an event to a session if it has a live connection. Returns
    /// whether the event was handed to a connection.
    pub async fn send_to_session(&self, session_id: &str, event: ClientEvent) -> bool {
        let tx = self.sessions.read().await.get(session_id).cloned();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Route a job-addressed event through the job binding.
    pub async fn route(&self, job_id: &str, event: ClientEvent) -> bool {
        match self.session_for_job(job_id).await {
            Some(session_id) => self.send_to_session(&session_id, event).await,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress_event(job_id: &str) -> ClientEvent {
        ClientEvent::Progress {
            job_id: job_id.to_string(),
            progress: 10,
            step: "analysis".to_string(),
        }
    }

    #[tokio::test]
    async fn routes_through_job_binding() {
        let registry = SessionRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register_session("sess-1", tx).await;
        registry.bind_job("intake-1", "sess-1").await;

        assert!(registry.route("intake-1", progress_event("intake-1")).await);
        assert!(matches!(rx.recv().await, Some(ClientEvent::Progress { .. })));
    }

    #[tokio::test]
    async fn dropped_connection_means_best_effort_drop() {
        let registry = SessionRegistry::new();
        let (tx, rx) = mpsc::channel(4);
        registry.register_session("sess-1", tx).await;
        registry.bind_job("intake-1", "sess-1").await;

        registry.unregister_session("sess-1").await;
        drop(rx);

        // The job binding survives the disconnect, but delivery is a no-op.
        assert_eq!(
            registry.session_for_job("intake-1").await.as_deref(),
            Some("sess-1")
        );
        assert!(!registry.route("intake-1", progress_event("intake-1")).await);
    }

    #[tokio::test]
    async fn release_job_removes_routing() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        registry.register_session("sess-1", tx).await;
        registry.bind_job("intake-1", "sess-1").await;
        registry.bind_job("researcher-1", "sess-1").await;

        registry.release_job("intake-1").await;
        assert!(registry.session_for_job("intake-1").await.is_none());

        let jobs = registry.jobs_for_session("sess-1").await;
        assert_eq!(jobs, vec!["researcher-1".to_string()]);
    }

    #[tokio::test]
    async fn reconnect_replaces_connection() {
        let registry = SessionRegistry::new();
        let (old_tx, old_rx) = mpsc::channel(4);
        registry.register_session("sess-1", old_tx).await;
        drop(old_rx);

        let (new_tx, mut new_rx) = mpsc::channel(4);
        registry.register_session("sess-1", new_tx).await;

        assert!(
            registry
                .send_to_session("sess-1", progress_event("intake-1"))
                .await
        );
        assert!(new_rx.recv().await.is_some());
    }
}
