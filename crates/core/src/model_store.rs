//! Lazily populated, process-lifetime cache of loaded generators.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::generator::Generator;
use crate::model_id::ModelId;

/// Produces a generator for a model identifier. Called at most once per
/// identifier per successful load.
pub trait GeneratorLoader: Send + Sync {
    fn load(&self, model: ModelId) -> Result<Arc<dyn Generator>>;

    /// Whether persisted weights exist for `model`, without loading them.
    fn is_available(&self, model: ModelId) -> bool;
}

type LoadGuard = Arc<Mutex<()>>;

pub struct ModelStore {
    loader: Box<dyn GeneratorLoader>,
    cache: Mutex<HashMap<ModelId, Arc<dyn Generator>>>,
    loading: Mutex<HashMap<ModelId, LoadGuard>>,
}

/// Poisoning only means another thread panicked while holding the guard; the
/// protected data is still valid.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ModelStore {
    pub fn new(loader: impl GeneratorLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            cache: Mutex::new(HashMap::new()),
            loading: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, model: ModelId) -> Option<Arc<dyn Generator>> {
        lock(&self.cache).get(&model).cloned()
    }

    fn load_guard(&self, model: ModelId) -> LoadGuard {
        Arc::clone(lock(&self.loading).entry(model).or_default())
    }

    /// Cached instance for `model`, loading it on first use.
    ///
    /// Loads are serialized per identifier, so concurrent first requests for
    /// the same model read the weights once while other models load in
    /// parallel. The cache map itself is only locked for lookups and inserts.
    /// A failed load is not cached.
    pub fn get_model(&self, model: ModelId) -> Result<Arc<dyn Generator>> {
        if let Some(generator) = self.cached(model) {
            debug!(model = %model, "model cache hit");
            return Ok(generator);
        }

        let guard = self.load_guard(model);
        let _loading = lock(&guard);
        if let Some(generator) = self.cached(model) {
            debug!(model = %model, "model loaded by a concurrent request");
            return Ok(generator);
        }

        info!(model = %model, "model cache miss, loading");
        match self.loader.load(model) {
            Ok(generator) => {
                lock(&self.cache).insert(model, Arc::clone(&generator));
                Ok(generator)
            }
            Err(e) => {
                warn!(model = %model, error = %e, "model load failed");
                Err(e)
            }
        }
    }

    pub fn is_loaded(&self, model: ModelId) -> bool {
        lock(&self.cache).contains_key(&model)
    }

    pub fn is_available(&self, model: ModelId) -> bool {
        self.loader.is_available(model)
    }

    /// Identifiers currently cached, in canonical order.
    pub fn loaded_models(&self) -> Vec<ModelId> {
        let mut ids: Vec<ModelId> = lock(&self.cache).keys().copied().collect();
        ids.sort();
        ids
    }

    /// Warm the cache, stopping at the first failure.
    pub fn preload(&self, models: &[ModelId]) -> Result<()> {
        for &model in models {
            self.get_model(model)?;
        }
        Ok(())
    }
}
