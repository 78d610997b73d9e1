//! Topic → handler table.
//!
//! Routes are registered on a [`RouterBuilder`] and frozen into a [`Router`]
//! before the engine starts. The frozen table is read-only and shared by all
//! workers without locking.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::handler::{JobHandler, SharedHandler};
use crate::middleware::Pipeline;

#[derive(Default)]
pub struct RouterBuilder {
    routes: HashMap<String, SharedHandler>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `topic`. A later registration for the same topic
    /// replaces the earlier one.
    pub fn register(&mut self, topic: impl Into<String>, handler: impl JobHandler + 'static) {
        self.register_shared(topic, Arc::new(handler));
    }

    pub fn register_shared(&mut self, topic: impl Into<String>, handler: SharedHandler) {
        let topic = topic.into();
        if self.routes.insert(topic.clone(), handler).is_some() {
            warn!(topic = %topic, "handler replaced for topic");
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn freeze(self) -> Router {
        Router {
            routes: Arc::new(self.routes),
        }
    }
}

/// Immutable routing table.
#[derive(Clone, Default)]
pub struct Router {
    routes: Arc<HashMap<String, SharedHandler>>,
}

impl Router {
    pub fn resolve(&self, topic: &str) -> Option<&SharedHandler> {
        self.routes.get(topic)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.routes.contains_key(topic)
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// A new router whose handlers are wrapped by `pipeline`.
    pub fn with_pipeline(&self, pipeline: &Pipeline) -> Router {
        let routes = self
            .routes
            .iter()
            .map(|(topic, handler)| (topic.clone(), pipeline.apply(handler.clone())))
            .collect();

        Router {
            routes: Arc::new(routes),
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("topics", &self.topics())
            .finish()
    }
}
