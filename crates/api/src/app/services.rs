use std::io;
use std::sync::Arc;
use std::time::Duration;

use secx_broker::{Broker, InMemoryBroker};
use secx_core::{ExtractionResult, FilingKind, FilingRef, Job};
use secx_extraction::{ExtractionRunner, ExtractorRegistry, HttpExtractor};
use secx_infra::{
    BatchSummary, CoordinatorError, Dispatcher, FilingSource, InMemoryJobStore, JobCoordinator, JobStats, JobStore,
    JobStoreError, PipelineConfig, PoolStats, Scheduler, SchedulerHandle, SchedulerStats, StaticFilingSource,
    WorkerPool, WorkerPoolConfig, WorkerPoolHandle,
};

use anyhow::Context;
#[cfg(feature = "redis")]
use secx_infra::{PostgresFilingSource, PostgresJobStore, RedisStreamsBroker};
#[cfg(feature = "redis")]
use sqlx::PgPool;

/// Extractor endpoints by filing kind.
///
/// `SECX_XBRL_EXTRACTOR_URL` and `SECX_HTML_EXTRACTOR_URL` route their kinds;
/// `SECX_EXTRACTOR_URL` takes everything else. At least one must be set.
/// Builds blocking HTTP clients, so call it outside the async runtime.
pub fn extractor_registry<F>(lookup: F, request_timeout: Duration) -> anyhow::Result<ExtractorRegistry>
where
    F: Fn(&str) -> Option<String>,
{
    let mut registry = ExtractorRegistry::new();
    let mut configured = false;

    for (var, kind) in [
        ("SECX_XBRL_EXTRACTOR_URL", FilingKind::Xbrl),
        ("SECX_HTML_EXTRACTOR_URL", FilingKind::Html),
    ] {
        if let Some(url) = lookup(var) {
            let extractor =
                HttpExtractor::new(url, request_timeout).with_context(|| format!("failed to build {var} client"))?;
            registry = registry.register(kind, extractor);
            configured = true;
        }
    }

    if let Some(url) = lookup("SECX_EXTRACTOR_URL") {
        let extractor =
            HttpExtractor::new(url, request_timeout).context("failed to build SECX_EXTRACTOR_URL client")?;
        registry = registry.with_fallback(extractor);
        configured = true;
    }

    anyhow::ensure!(
        configured,
        "set SECX_EXTRACTOR_URL or a per-kind SECX_XBRL_EXTRACTOR_URL / SECX_HTML_EXTRACTOR_URL"
    );
    Ok(registry)
}

type InMemoryCoordinator = JobCoordinator<Arc<InMemoryJobStore>, Arc<InMemoryBroker>>;

#[cfg(feature = "redis")]
type PersistentCoordinator = JobCoordinator<Arc<PostgresJobStore>, Arc<RedisStreamsBroker>>;

#[derive(Clone)]
pub enum AppServices {
    InMemory {
        coordinator: Arc<InMemoryCoordinator>,
        store: Arc<InMemoryJobStore>,
        broker: Arc<InMemoryBroker>,
        source: Arc<StaticFilingSource>,
    },
    #[cfg(feature = "redis")]
    Persistent {
        coordinator: Arc<PersistentCoordinator>,
        store: Arc<PostgresJobStore>,
        broker: Arc<RedisStreamsBroker>,
        source: Arc<PostgresFilingSource>,
    },
}

/// Wire services from the environment (`USE_PERSISTENT_STORES`, `DATABASE_URL`, `REDIS_URL`).
pub async fn build_services(config: &PipelineConfig) -> anyhow::Result<AppServices> {
    let use_persistent = std::env::var("USE_PERSISTENT_STORES")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    if use_persistent {
        #[cfg(feature = "redis")]
        {
            return build_persistent_services(config).await;
        }
        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!(
                "USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory"
            );
        }
    }

    Ok(AppServices::in_memory(config))
}

#[cfg(feature = "redis")]
async fn build_persistent_services(config: &PipelineConfig) -> anyhow::Result<AppServices> {
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;
    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

    let pool = PgPool::connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    secx_infra::jobs::migrate(&pool)
        .await
        .context("failed to apply job store schema")?;

    let runtime = tokio::runtime::Handle::current();
    let store = Arc::new(PostgresJobStore::new(pool.clone(), runtime.clone()));
    let source = Arc::new(PostgresFilingSource::new(pool, runtime));

    let broker = Arc::new(
        tokio::task::spawn_blocking(move || RedisStreamsBroker::new(&redis_url))
            .await
            .context("redis setup task failed")?
            .context("failed to create Redis Streams broker")?,
    );

    tracing::info!("using Postgres job store and Redis Streams broker");
    Ok(AppServices::Persistent {
        coordinator: Arc::new(JobCoordinator::new(store.clone(), broker.clone(), config.max_attempts)),
        store,
        broker,
        source,
    })
}

/// Background workers and scheduler started for a set of services.
#[derive(Debug)]
pub struct PipelineHandles {
    pub workers: WorkerPoolHandle,
    pub scheduler: SchedulerHandle,
}

impl PipelineHandles {
    /// Stop the scheduler first so it publishes nothing new, then drain the workers.
    pub fn shutdown(self) {
        self.scheduler.shutdown();
        self.workers.shutdown();
    }

    pub fn worker_stats(&self) -> PoolStats {
        self.workers.stats()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }
}

fn start_pipeline<S, B, F>(
    store: S,
    broker: B,
    source: F,
    runner: ExtractionRunner,
    config: &PipelineConfig,
) -> io::Result<PipelineHandles>
where
    S: JobStore + Clone + 'static,
    B: Broker + Clone + 'static,
    F: FilingSource + 'static,
{
    let dispatcher = Arc::new(
        Dispatcher::new(store.clone(), broker.clone(), runner, config.retry_policy())
            .with_infra_retry_delay(config.infra_retry_delay),
    );
    let workers = WorkerPool::spawn(
        dispatcher,
        WorkerPoolConfig::default()
            .with_workers(config.worker_count)
            .with_lease_timeout(config.lease_timeout),
    )?;

    let scheduler = Scheduler::new(store, broker, source, config.max_attempts, config.stall_timeout);
    match scheduler.spawn(config.scheduler_interval) {
        Ok(scheduler) => Ok(PipelineHandles { workers, scheduler }),
        Err(e) => {
            workers.shutdown();
            Err(e)
        }
    }
}

impl AppServices {
    /// In-memory store and broker (dev/test). Filings to sweep can be pushed
    /// through [`AppServices::filing_source`].
    pub fn in_memory(config: &PipelineConfig) -> Self {
        let store = InMemoryJobStore::arc();
        let broker = Arc::new(InMemoryBroker::new());
        let source = Arc::new(StaticFilingSource::new(Vec::new()));
        AppServices::InMemory {
            coordinator: Arc::new(JobCoordinator::new(store.clone(), broker.clone(), config.max_attempts)),
            store,
            broker,
            source,
        }
    }

    /// Static filing source backing the in-memory scheduler, if any.
    pub fn filing_source(&self) -> Option<Arc<StaticFilingSource>> {
        match self {
            AppServices::InMemory { source, .. } => Some(source.clone()),
            #[cfg(feature = "redis")]
            AppServices::Persistent { .. } => None,
        }
    }

    /// Start the worker pool and scheduler against these services.
    ///
    /// The returned handles must be shut down from a thread that is not
    /// driving an async runtime.
    pub fn spawn_pipeline(&self, runner: ExtractionRunner, config: &PipelineConfig) -> io::Result<PipelineHandles> {
        match self {
            AppServices::InMemory { store, broker, source, .. } => {
                start_pipeline(store.clone(), broker.clone(), source.clone(), runner, config)
            }
            #[cfg(feature = "redis")]
            AppServices::Persistent { store, broker, source, .. } => {
                start_pipeline(store.clone(), broker.clone(), source.clone(), runner, config)
            }
        }
    }

    pub fn submit(&self, filing_ref: &FilingRef) -> Result<Job, CoordinatorError> {
        match self {
            AppServices::InMemory { coordinator, .. } => coordinator.submit(filing_ref),
            #[cfg(feature = "redis")]
            AppServices::Persistent { coordinator, .. } => coordinator.submit(filing_ref),
        }
    }

    pub fn submit_batch(&self, filings: Vec<FilingRef>) -> BatchSummary {
        match self {
            AppServices::InMemory { coordinator, .. } => coordinator.submit_batch(filings),
            #[cfg(feature = "redis")]
            AppServices::Persistent { coordinator, .. } => coordinator.submit_batch(filings),
        }
    }

    pub fn status(&self, filing_ref: &FilingRef) -> Result<Option<Job>, CoordinatorError> {
        match self {
            AppServices::InMemory { coordinator, .. } => coordinator.status(filing_ref),
            #[cfg(feature = "redis")]
            AppServices::Persistent { coordinator, .. } => coordinator.status(filing_ref),
        }
    }

    pub fn result(&self, filing_ref: &FilingRef) -> Result<Option<ExtractionResult>, CoordinatorError> {
        match self {
            AppServices::InMemory { coordinator, .. } => coordinator.result(filing_ref),
            #[cfg(feature = "redis")]
            AppServices::Persistent { coordinator, .. } => coordinator.result(filing_ref),
        }
    }

    pub fn history(&self, filing_ref: &FilingRef) -> Result<Vec<Job>, CoordinatorError> {
        match self {
            AppServices::InMemory { coordinator, .. } => coordinator.history(filing_ref),
            #[cfg(feature = "redis")]
            AppServices::Persistent { coordinator, .. } => coordinator.history(filing_ref),
        }
    }

    pub fn stats(&self) -> Result<JobStats, CoordinatorError> {
        match self {
            AppServices::InMemory { coordinator, .. } => coordinator.stats(),
            #[cfg(feature = "redis")]
            AppServices::Persistent { coordinator, .. } => coordinator.stats(),
        }
    }
}

/// Run a coordinator call on the blocking pool.
///
/// The Postgres store drives its queries with `Handle::block_on`, which must
/// not happen on an async worker thread.
pub async fn blocking<T, F>(services: Arc<AppServices>, f: F) -> Result<T, CoordinatorError>
where
    T: Send + 'static,
    F: FnOnce(&AppServices) -> Result<T, CoordinatorError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&services))
        .await
        .map_err(|e| CoordinatorError::Store(JobStoreError::Storage(format!("blocking task failed: {e}"))))?
}
