use std::collections::HashMap;
use std::sync::Arc;

use llmgate_common::ProviderTag;

use crate::provider::Provider;

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderTag, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tag: ProviderTag, provider: Arc<dyn Provider>) {
        self.providers.insert(tag, provider);
    }

    pub fn get(&self, tag: ProviderTag) -> Option<Arc<dyn Provider>> {
        self.providers.get(&tag).cloned()
    }
}
