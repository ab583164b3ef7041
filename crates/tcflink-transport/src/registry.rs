use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::TransportFactory;

/// Name-keyed set of transport factories.
///
/// Owned by whatever builds channels; there is no process-wide instance.
/// Names are matched case-insensitively.
#[derive(Default, Clone)]
pub struct TransportRegistry {
    factories: HashMap<String, Arc<dyn TransportFactory>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its own name, returning any factory it replaced.
    pub fn register(
        &mut self,
        factory: Arc<dyn TransportFactory>,
    ) -> Option<Arc<dyn TransportFactory>> {
        let key = factory.name().to_ascii_uppercase();
        debug!(transport = %key, "registering transport");
        self.factories.insert(key, factory)
    }

    /// Look up a factory by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TransportFactory>> {
        self.factories.get(&name.to_ascii_uppercase()).cloned()
    }

    /// Look up a factory by name, failing with [`TransportError::UnknownTransport`].
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn TransportFactory>> {
        self.get(name)
            .ok_or_else(|| TransportError::UnknownTransport(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("transports", &self.names())
            .finish()
    }
}
