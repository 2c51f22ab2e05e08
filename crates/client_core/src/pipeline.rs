use std::{collections::HashSet, sync::Arc};

use shared::protocol::EventEnvelope;
use storage::LocalStore;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{MiddlewareError, PipelineConfigError};

/// Declared position of a middleware. A pipeline's stages must be
/// non-decreasing in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Unpacks batches so later stages only see single events.
    Expand,
    /// Protocol-level events consumed before subscribers see them.
    Intercept,
    Filter,
    Transform,
}

#[derive(Debug)]
pub enum StageOutcome {
    Forward,
    Replace(Vec<EventEnvelope>),
    Drop,
}

pub trait EventMiddleware: Send + Sync {
    fn name(&self) -> &'static str;
    fn stage(&self) -> Stage;
    fn handle(&self, envelope: &EventEnvelope) -> Result<StageOutcome, MiddlewareError>;
}

#[derive(Default)]
pub struct EventPipelineBuilder {
    middleware: Vec<Arc<dyn EventMiddleware>>,
}

impl EventPipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, middleware: impl EventMiddleware + 'static) -> Self {
        self.with_arc(Arc::new(middleware))
    }

    pub fn with_arc(mut self, middleware: Arc<dyn EventMiddleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn build(
        self,
        store: Arc<dyn LocalStore>,
        capacity: usize,
    ) -> Result<EventPipeline, PipelineConfigError> {
        let mut names = HashSet::new();
        let mut previous: Option<Stage> = None;
        for middleware in &self.middleware {
            if !names.insert(middleware.name()) {
                return Err(PipelineConfigError::DuplicateName(middleware.name()));
            }
            let stage = middleware.stage();
            if let Some(previous) = previous.filter(|previous| stage < *previous) {
                return Err(PipelineConfigError::StageOutOfOrder {
                    name: middleware.name(),
                    stage,
                    previous,
                });
            }
            previous = Some(stage);
        }

        let (events, _) = broadcast::channel(capacity.max(1));
        Ok(EventPipeline {
            middleware: self.middleware,
            store,
            events,
        })
    }
}

/// What happened to one inbound envelope.
#[derive(Debug, Default, Clone)]
pub struct ProcessReport {
    /// Middleware names in invocation order.
    pub visited: Vec<&'static str>,
    pub published: Vec<EventEnvelope>,
    pub failures: Vec<MiddlewareError>,
}

/// Fixed chain of middleware followed by persistence and fan-out.
///
/// Callers must feed envelopes from one session sequentially; `process` does
/// not reorder and publishes in the order stages emit.
pub struct EventPipeline {
    middleware: Vec<Arc<dyn EventMiddleware>>,
    store: Arc<dyn LocalStore>,
    events: broadcast::Sender<EventEnvelope>,
}

impl EventPipeline {
    pub fn builder() -> EventPipelineBuilder {
        EventPipelineBuilder::new()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    pub fn stages(&self) -> Vec<(&'static str, Stage)> {
        self.middleware
            .iter()
            .map(|middleware| (middleware.name(), middleware.stage()))
            .collect()
    }

    pub async fn process(&self, envelope: EventEnvelope) -> ProcessReport {
        let mut report = ProcessReport::default();
        let mut batch = vec![envelope];

        for middleware in &self.middleware {
            report.visited.push(middleware.name());
            let mut next = Vec::with_capacity(batch.len());
            for envelope in batch {
                match middleware.handle(&envelope) {
                    Ok(StageOutcome::Forward) => next.push(envelope),
                    Ok(StageOutcome::Replace(derived)) => next.extend(derived),
                    Ok(StageOutcome::Drop) => {
                        debug!(
                            middleware = middleware.name(),
                            envelope = %envelope.id(),
                            kind = envelope.kind(),
                            "envelope dropped"
                        );
                    }
                    Err(err) => {
                        warn!(
                            envelope = %envelope.id(),
                            kind = envelope.kind(),
                            %err,
                            "middleware failed; passing envelope through unchanged"
                        );
                        report.failures.push(err);
                        next.push(envelope);
                    }
                }
            }
            batch = next;
        }

        for envelope in batch {
            if let Err(err) = self.store.apply_event(&envelope).await {
                warn!(envelope = %envelope.id(), "failed to persist envelope: {err:#}");
            }
            // Err only means nobody is subscribed.
            let _ = self.events.send(envelope.clone());
            report.published.push(envelope);
        }

        report
    }
}

#[cfg(test)]
#[path = "tests/pipeline_tests.rs"]
mod tests;
