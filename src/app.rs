use std::ops::Deref;
use std::sync::Arc;

use crate::modules::{cache::HitCounterCache, store::VisitStore};

pub struct AppData(Arc<RuntimeData>);

impl From<RuntimeData> for AppData {
    fn from(data: RuntimeData) -> Self {
        Self(Arc::new(data))
    }
}

impl Clone for AppData {
    fn clone(&self) -> Self {
        AppData(Arc::clone(&self.0))
    }
}

impl Deref for AppData {
    type Target = Arc<RuntimeData>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(typed_builder::TypedBuilder)]
pub struct RuntimeData {
    pub store: Arc<dyn VisitStore>,
    pub cache: Arc<dyn HitCounterCache>,
    /// Name of the counter inside the cache.
    #[builder(default = String::from("hits"), setter(into))]
    pub cache_key: String,
}
