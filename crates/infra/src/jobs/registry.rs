//! Handler registry: job type to handler factory.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::error::JobError;
use super::store::JobSession;
use super::types::{Job, JobType};

/// Work performed for one job type.
///
/// Handlers receive the job (with its payload) and the session bound to the
/// job's tenant. Writes made through the session commit together with the
/// job's status, or not at all.
#[async_trait]
pub trait JobHandler<S: JobSession>: Send + Sync {
    async fn execute(&self, job: &Job, session: &mut S) -> Result<Value, JobError>;
}

type HandlerFactory<S> = Arc<dyn Fn() -> Box<dyn JobHandler<S>> + Send + Sync>;

/// A fresh handler instance is built for every invocation.
pub struct HandlerRegistry<S> {
    factories: HashMap<JobType, HandlerFactory<S>>,
}

impl<S: JobSession + 'static> HandlerRegistry<S> {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a handler factory, replacing any previous one for `job_type`.
    pub fn register<F, H>(&mut self, job_type: JobType, factory: F) -> &mut Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: JobHandler<S> + 'static,
    {
        self.factories.insert(
            job_type,
            Arc::new(move || Box::new(factory()) as Box<dyn JobHandler<S>>),
        );
        self
    }

    pub fn resolve(&self, job_type: JobType) -> Option<Box<dyn JobHandler<S>>> {
        self.factories.get(&job_type).map(|factory| factory())
    }

    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<_> = self.factories.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}

impl<S: JobSession + 'static> Default for HandlerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> std::fmt::Debug for HandlerRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
