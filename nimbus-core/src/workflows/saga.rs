//! Compensation bookkeeping for multi-step workflows
//!
//! A [`Saga`] collects one undo future per completed step. When a later
//! step fails the undo futures run newest first. An undo that fails is
//! logged and skipped; the error handed back is always the step's own.

use futures::future::BoxFuture;
use std::future::Future;
use tracing::{debug, error, warn};

use crate::error::NimbusResult;

pub struct Saga<'a> {
    workflow: &'static str,
    compensations: Vec<(String, BoxFuture<'a, NimbusResult<()>>)>,
}

impl<'a> Saga<'a> {
    pub fn new(workflow: &'static str) -> Self {
        Self {
            workflow,
            compensations: Vec::new(),
        }
    }

    /// Register how to undo a step that just succeeded
    pub fn compensate_with<F>(&mut self, step: impl Into<String>, undo: F)
    where
        F: Future<Output = NimbusResult<()>> + Send + 'a,
    {
        self.compensations.push((step.into(), Box::pin(undo)));
    }

    /// Run a step; on failure undo everything registered so far
    pub async fn run<T, F>(&mut self, step: &str, action: F) -> NimbusResult<T>
    where
        F: Future<Output = NimbusResult<T>>,
    {
        match action.await {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(workflow = self.workflow, step, "Step failed: {}", e);
                self.rollback().await;
                Err(e)
            }
        }
    }

    /// Run every registered compensation, newest first
    pub async fn rollback(&mut self) {
        while let Some((step, undo)) = self.compensations.pop() {
            match undo.await {
                Ok(()) => debug!(workflow = self.workflow, step = %step, "Compensated"),
                Err(e) => error!(
                    workflow = self.workflow,
                    step = %step,
                    "Compensation failed, manual cleanup needed: {}",
                    e
                ),
            }
        }
    }

    /// Finish successfully, dropping the compensations unrun
    pub fn complete(self) {
        debug!(
            workflow = self.workflow,
            steps = self.compensations.len(),
            "Saga complete"
        );
    }

    pub fn pending(&self) -> usize {
        self.compensations.len()
    }
}
