use std::sync::Arc;

use crate::{config::Config, explain::LlmClient, store::Store};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub llm: Option<Arc<dyn LlmClient>>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, llm: Option<Arc<dyn LlmClient>>, config: Config) -> Self {
        Self {
            store,
            llm,
            config: Arc::new(config),
        }
    }
}
