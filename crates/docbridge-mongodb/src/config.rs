//! Bridge configuration.

use docbridge_bson::{DEFAULT_ID_FIELD, MAX_DOCUMENT_SIZE};
use tracing::warn;

/// How completed async tasks reach their continuations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// A single delivery thread runs continuations one at a time
    Dedicated,
    /// The caller drains completions with `Registry::run_pending`
    Polled,
}

/// Registry and codec configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Worker threads in the runtime (default: number of CPUs)
    pub workers: usize,
    /// Continuation delivery mode (default: dedicated thread)
    pub delivery: DeliveryMode,
    /// Identifier field used when an operation supplies no override
    pub id_field: String,
    /// Largest encoded document accepted (default: 16 MiB)
    pub max_document_size: usize,
    /// Application name reported to the server
    pub app_name: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            delivery: DeliveryMode::Dedicated,
            id_field: DEFAULT_ID_FIELD.to_string(),
            max_document_size: MAX_DOCUMENT_SIZE,
            app_name: Some("docbridge".to_string()),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `DOCBRIDGE_WORKERS`, `DOCBRIDGE_ID_FIELD` and
    /// `DOCBRIDGE_MAX_DOC_SIZE`. Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("DOCBRIDGE_WORKERS") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.workers = n,
                _ => warn!(value = %raw, "Ignoring invalid DOCBRIDGE_WORKERS"),
            }
        }
        if let Some(field) = lookup("DOCBRIDGE_ID_FIELD") {
            let field = field.trim();
            if !field.is_empty() {
                config.id_field = field.to_string();
            }
        }
        if let Some(raw) = lookup("DOCBRIDGE_MAX_DOC_SIZE") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.max_document_size = n,
                _ => warn!(value = %raw, "Ignoring invalid DOCBRIDGE_MAX_DOC_SIZE"),
            }
        }
        config
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    pub fn with_max_document_size(mut self, size: usize) -> Self {
        self.max_document_size = size;
        self
    }

    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }
}
