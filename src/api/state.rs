//! Shared application state, threaded into every handler via
//! `axum::extract::State`.

use std::sync::Arc;
use std::time::Instant;

use crate::cache::SqliteCache;
use crate::coalescer::Coalescer;
use crate::config::Config;
use crate::executor::model::ModelSingleton;
use crate::executor::Executor;
use crate::render::Renderer;
use crate::upload::JobOutcome;

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<SqliteCache>,
    pub coalescer: Arc<Coalescer<JobOutcome>>,
    pub executor: Executor,
    pub model: Arc<ModelSingleton>,
    pub renderer: Arc<dyn Renderer>,
    pub config: Arc<Config>,
    pub started_at: Instant,
}

impl AppState {
    pub async fn new(config: Config, renderer: Arc<dyn Renderer>) -> Result<Self, crate::cache::CacheError> {
        let limits = crate::cache::sqlite::CacheLimits {
            threshold: config.cache_threshold,
            max_size: config.cache_max_size,
            default_timeout: config.cache_default_timeout,
            ignore_errors: config.cache_ignore_errors,
        };

        let cache = match config.cache_backend {
            crate::config::CacheBackend::Memory => SqliteCache::open_memory(limits).await?,
            crate::config::CacheBackend::Sqlite => {
                SqliteCache::open_file(&config.cache_path, limits).await?
            }
        };

        let executor = Executor::new(config.executor_max_workers);
        let model = Arc::new(ModelSingleton::with_default_model());

        if config.profile.eager_warmup() {
            let warm = model.clone();
            let exec = executor.clone();
            let _ = exec.submit(move || async move { warm.warm_up().await }).await;
        }

        Ok(Self {
            cache: Arc::new(cache),
            coalescer: Arc::new(Coalescer::new()),
            executor,
            model,
            renderer,
            config: Arc::new(config),
            started_at: Instant::now(),
        })
    }

    pub fn upload_pipeline(&self) -> crate::upload::UploadPipeline<SqliteCache> {
        crate::upload::UploadPipeline::new(
            self.cache.clone(),
            self.coalescer.clone(),
            self.executor.clone(),
            self.model.clone(),
            self.config.clone(),
        )
    }
}
