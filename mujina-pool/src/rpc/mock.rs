//! Scriptable daemon for tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{DaemonClient, DaemonStatus, RpcError, SubmitOutcome};

#[derive(Debug)]
struct State {
    template: Value,
    /// Errors returned by the next template fetches, in order.
    template_failures: VecDeque<String>,
    template_calls: usize,
    submit_outcome: SubmitOutcome,
    submitted: Vec<String>,
    status: DaemonStatus,
}

/// In-memory daemon whose answers tests set directly.
pub struct MockDaemon {
    state: Mutex<State>,
    /// Templates pushed through `long_poll`, when enabled.
    pushes: Option<tokio::sync::Mutex<mpsc::Receiver<Value>>>,
}

impl MockDaemon {
    pub fn new(template: Value) -> Self {
        Self {
            state: Mutex::new(State {
                template,
                template_failures: VecDeque::new(),
                template_calls: 0,
                submit_outcome: SubmitOutcome::Accepted,
                submitted: Vec::new(),
                status: DaemonStatus {
                    connections: 8,
                    synced: true,
                    blocks: 0,
                    difficulty: 1.0,
                },
            }),
            pushes: None,
        }
    }

    /// Enable long polling; templates sent on the returned channel are
    /// delivered by `long_poll`.
    pub fn with_long_poll(mut self) -> (Self, mpsc::Sender<Value>) {
        let (tx, rx) = mpsc::channel(8);
        self.pushes = Some(tokio::sync::Mutex::new(rx));
        (self, tx)
    }

    pub fn set_template(&self, template: Value) {
        self.state.lock().template = template;
    }

    pub fn fail_next_template(&self, message: &str) {
        self.state
            .lock()
            .template_failures
            .push_back(message.to_string());
    }

    pub fn template_calls(&self) -> usize {
        self.state.lock().template_calls
    }

    pub fn set_submit_outcome(&self, outcome: SubmitOutcome) {
        self.state.lock().submit_outcome = outcome;
    }

    pub fn submitted(&self) -> Vec<String> {
        self.state.lock().submitted.clone()
    }

    pub fn set_status(&self, status: DaemonStatus) {
        self.state.lock().status = status;
    }
}

#[async_trait]
impl DaemonClient for MockDaemon {
    async fn get_block_template(&self) -> Result<Value, RpcError> {
        let mut state = self.state.lock();
        state.template_calls += 1;
        if let Some(message) = state.template_failures.pop_front() {
            return Err(RpcError::Daemon { code: -1, message });
        }
        Ok(state.template.clone())
    }

    async fn submit_block(&self, payload: &str) -> Result<SubmitOutcome, RpcError> {
        let mut state = self.state.lock();
        state.submitted.push(payload.to_string());
        Ok(state.submit_outcome.clone())
    }

    async fn status(&self) -> Result<DaemonStatus, RpcError> {
        Ok(self.state.lock().status.clone())
    }

    fn supports_long_poll(&self) -> bool {
        self.pushes.is_some()
    }

    async fn long_poll(&self, _longpoll_id: &str) -> Result<Option<Value>, RpcError> {
        match &self.pushes {
            Some(pushes) => Ok(pushes.lock().await.recv().await),
            None => Ok(None),
        }
    }
}
