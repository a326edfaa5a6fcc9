use std::sync::Arc;
use vulnscan_core::queue::JobReceiver;
use vulnscan_core::{
    Analyzer, Classifier, Dispatcher, JobQueue, OpenAiClassifier, ScanEngine, ScanStore,
    SqliteStore, ToolsConfig, WorkerPool,
};

use crate::config::Settings;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ScanStore>,
    pub engine: Arc<ScanEngine>,
    pub queue: JobQueue,
}

/// Worker side of the application, started by `main` once recovery ran.
pub struct Workers {
    pub pool: WorkerPool,
    pub jobs: JobReceiver,
}

impl AppState {
    pub async fn new(settings: &Settings) -> anyhow::Result<(Self, Workers)> {
        // 初始化数据库
        let store: Arc<dyn ScanStore> = Arc::new(SqliteStore::connect(&settings.database_url).await?);

        // 工具配置
        let tools = match &settings.tools_config {
            Some(path) => ToolsConfig::load(path)?,
            None => ToolsConfig::default(),
        };
        let dispatcher = Dispatcher::from_config(store.clone(), &tools);
        tracing::info!("Enabled tools: {:?}", dispatcher.tools());

        // 结果研判
        let classifier: Option<Arc<dyn Classifier>> = match &settings.openai_api_key {
            Some(key) => {
                let client = OpenAiClassifier::new(
                    key.clone(),
                    settings.openai_model.clone(),
                    settings.openai_base_url.clone(),
                )?;
                tracing::info!("Classifier: {} ({})", client.name(), client.model());
                Some(Arc::new(client) as Arc<dyn Classifier>)
            }
            None => {
                tracing::warn!("OPENAI_API_KEY not set, using heuristic analysis only");
                None
            }
        };
        let analyzer = Analyzer::new(classifier, settings.analysis_prompt_budget);

        let engine = Arc::new(ScanEngine::new(
            store.clone(),
            dispatcher,
            analyzer,
            settings.analysis_mode,
        ));
        let (queue, jobs) = JobQueue::channel();
        let pool = WorkerPool::new(engine.clone(), queue.clone(), settings.worker_concurrency);

        Ok((
            Self::from_parts(store, engine, queue),
            Workers { pool, jobs },
        ))
    }

    pub fn from_parts(store: Arc<dyn ScanStore>, engine: Arc<ScanEngine>, queue: JobQueue) -> Self {
        Self { store, engine, queue }
    }
}
