//! JobRegistry: job name -> type-erased handler.

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::job::Job;

/// Handlers keyed by job name.
///
/// Built once at startup by `EngineBuilder`, then shared read-only.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn DynHandler>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a handler for job '{0}' is already registered")]
    AlreadyRegistered(String),
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<J: Job, H: Handler<J>>(&mut self, handler: H) -> Result<(), RegistryError> {
        let name = J::NAME.to_string();
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.handlers
            .insert(name, Arc::new(TypedHandler::<J, H>::new(handler)));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered job names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobError;
    use crate::typed::{JobContext, handler_fn};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct LogEmailActivity {
        invoice_id: u64,
    }

    impl Job for LogEmailActivity {
        const NAME: &'static str = "log_email_activity";
    }

    #[derive(Serialize, Deserialize)]
    struct UpdateHistory {
        invoice_id: u64,
    }

    impl Job for UpdateHistory {
        const NAME: &'static str = "update_customer_communication_history";
    }

    fn ok_handler<J: Job>() -> impl Handler<J> {
        handler_fn(|_job: J, _ctx: JobContext| async { Ok::<_, JobError>(true) })
    }

    #[test]
    fn register_and_get() {
        let mut registry = JobRegistry::new();
        registry
            .register::<LogEmailActivity, _>(ok_handler())
            .unwrap();

        let h = registry.get(LogEmailActivity::NAME).unwrap();
        assert_eq!(h.name(), LogEmailActivity::NAME);
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = JobRegistry::new();
        registry
            .register::<LogEmailActivity, _>(ok_handler())
            .unwrap();
        let result = registry.register::<LogEmailActivity, _>(ok_handler());
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(name)) if name == "log_email_activity"));
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = JobRegistry::new();
        registry.register::<UpdateHistory, _>(ok_handler()).unwrap();
        registry
            .register::<LogEmailActivity, _>(ok_handler())
            .unwrap();
        assert_eq!(
            registry.names(),
            vec![
                "log_email_activity".to_string(),
                "update_customer_communication_history".to_string()
            ]
        );
    }
}
