//! Worker operation registry
//!
//! Maps `(target_type, operation)` to an implementation. Lookups that miss
//! return a typed [`SchedulerError`] so the scheduler can drop the job
//! instead of retrying it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::error::{SchedulerError, SchedulerResult};
use crate::models::{ExecutionError, Job, WorkResult};

/// One named operation against a target, run on a page of type `P`
#[async_trait]
pub trait Operation<P>: Send + Sync {
    async fn execute(&self, job: &Job, page: &P) -> Result<WorkResult, ExecutionError>;
}

/// Registered operations keyed by target type, then operation name
pub struct WorkerRegistry<P> {
    targets: HashMap<String, HashMap<String, Arc<dyn Operation<P>>>>,
}

impl<P> Default for WorkerRegistry<P> {
    fn default() -> Self {
        Self {
            targets: HashMap::new(),
        }
    }
}

impl<P> std::fmt::Debug for WorkerRegistry<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("targets", &self.target_types())
            .finish()
    }
}

impl<P> WorkerRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation, replacing any previous one under the same key
    pub fn register(
        &mut self,
        target_type: impl Into<String>,
        operation: impl Into<String>,
        implementation: Arc<dyn Operation<P>>,
    ) -> &mut Self {
        let target_type = target_type.into();
        let operation = operation.into();
        tracing::debug!(target_type = %target_type, operation = %operation, "Operation registered");
        self.targets
            .entry(target_type)
            .or_default()
            .insert(operation, implementation);
        self
    }

    /// Builder form of [`register`](Self::register)
    pub fn with(
        mut self,
        target_type: impl Into<String>,
        operation: impl Into<String>,
        implementation: Arc<dyn Operation<P>>,
    ) -> Self {
        self.register(target_type, operation, implementation);
        self
    }

    pub fn resolve(&self, target_type: &str, operation: &str) -> SchedulerResult<Arc<dyn Operation<P>>> {
        let operations = self
            .targets
            .get(target_type)
            .ok_or_else(|| SchedulerError::unknown_target(target_type, self.target_types()))?;

        operations
            .get(operation)
            .cloned()
            .ok_or_else(|| SchedulerError::unknown_operation(target_type, operation))
    }

    pub fn has_target(&self, target_type: &str) -> bool {
        self.targets.contains_key(target_type)
    }

    /// Registered target types, sorted
    pub fn target_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.targets.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountProfile;

    struct Claim;

    #[async_trait]
    impl Operation<()> for Claim {
        async fn execute(&self, _job: &Job, _page: &()) -> Result<WorkResult, ExecutionError> {
            Ok(WorkResult::success("claimed", 60.0))
        }
    }

    fn registry() -> WorkerRegistry<()> {
        WorkerRegistry::<()>::new().with("siteA", "claim", Arc::new(Claim))
    }

    #[tokio::test]
    async fn test_resolve_and_execute() {
        let op = registry().resolve("siteA", "claim").unwrap();
        let job = Job::new("a", AccountProfile::new("alice"), "siteA", "claim");
        let result = op.execute(&job, &()).await.unwrap();
        assert!(result.success);
    }

    #[test]
    fn test_unknown_target() {
        let err = registry().resolve("siteZ", "claim").err().unwrap();
        assert!(matches!(err, SchedulerError::UnknownTarget { .. }));
        assert!(err.to_string().contains("siteA"));
    }

    #[test]
    fn test_unknown_operation() {
        let err = registry().resolve("siteA", "withdraw").err().unwrap();
        assert!(matches!(err, SchedulerError::UnknownOperation { .. }));
    }

    #[test]
    fn test_target_types_sorted() {
        let mut reg = registry();
        reg.register("alpha", "claim", Arc::new(Claim));
        assert_eq!(reg.target_types(), vec!["alpha", "siteA"]);
        assert!(reg.has_target("alpha"));
    }
}
