//! The knowledge engine: environments, ingestion and the query surface.
//!
//! An [`Environment`] bundles the knowledge store, the model client, the
//! shared recursion-depth counter and the configuration. The
//! [`KnowledgeEngine`] opens and disposes environments, ingests documents
//! (see [`ingest`]) and answers queries by driving the iteration loop (see
//! [`r#loop`]). Refinement lives in [`refine`].

pub mod ingest;
pub mod r#loop;
pub mod refine;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::client::{ModelClient, ModelError};
use crate::config::StraylightConfig;
use crate::sandbox::{Sandbox, SubQueryRunner};
use crate::store::{KnowledgeStore, StoreError};

pub use ingest::{IngestOptions, IngestReport, VisionBackend};
pub use r#loop::{LoopStatus, QueryOpts, QueryOutcome};
pub use refine::{Criterion, RefineEvaluator, RefineOutcome, RubricEvaluation};

/// Errors surfaced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store failure (persistence, decode).
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Model call failure after retries / coercion.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// A blocking evaluation task failed to join.
    #[error("sandbox execution task failed: {0}")]
    Execution(String),
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Runtime handle for one opened store.
///
/// Cloning forks the handle: the store, client, config and depth counter
/// are shared; each fork builds its own sandboxes (fresh locals, fresh
/// claims) via [`Environment::make_sandbox`].
#[derive(Clone)]
pub struct Environment {
    store: Arc<KnowledgeStore>,
    client: Arc<ModelClient>,
    config: Arc<StraylightConfig>,
    depth: Arc<AtomicU32>,
    query_counter: Arc<AtomicU64>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("store", &self.store.base_path())
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// The shared store.
    pub fn store(&self) -> &Arc<KnowledgeStore> {
        &self.store
    }

    /// The shared model client.
    pub fn client(&self) -> &Arc<ModelClient> {
        &self.client
    }

    /// The engine configuration.
    pub fn config(&self) -> &StraylightConfig {
        &self.config
    }

    /// The shared recursion-depth counter.
    pub fn depth(&self) -> &Arc<AtomicU32> {
        &self.depth
    }

    /// Allocate the next query id for this environment.
    pub fn next_query_id(&self) -> String {
        let n = self.query_counter.fetch_add(1, Ordering::Relaxed);
        format!("q-{n}")
    }

    /// Build a sandbox for one query, wired for sub-queries when a tokio
    /// runtime is available.
    pub fn make_sandbox(&self, query_id: &str, runner: Option<Arc<dyn SubQueryRunner>>) -> Sandbox {
        let mut sandbox = Sandbox::new(self.store.clone(), query_id).with_timeout(Some(
            std::time::Duration::from_millis(self.config.limits.sandbox_timeout_ms),
        ));
        if let (Some(runner), Ok(handle)) = (runner, tokio::runtime::Handle::try_current()) {
            sandbox = sandbox.with_sub_query(
                runner,
                self.depth.clone(),
                self.config.limits.max_recursion_depth,
                handle,
            );
        }
        sandbox
    }
}

/// Where an environment's store comes from.
#[derive(Debug)]
pub enum StoreTarget {
    /// Fresh owned store on a temp path, removed on dispose.
    Disposable,
    /// Caller-chosen directory; never removed.
    Path(PathBuf),
    /// Caller-owned store wrapped as-is; never removed.
    External(Arc<KnowledgeStore>),
}

// ---------------------------------------------------------------------------
// KnowledgeEngine
// ---------------------------------------------------------------------------

/// Top-level orchestration surface.
#[derive(Clone)]
pub struct KnowledgeEngine {
    client: Arc<ModelClient>,
    config: Arc<StraylightConfig>,
    vision: Option<Arc<dyn VisionBackend>>,
}

impl std::fmt::Debug for KnowledgeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeEngine")
            .field("vision", &self.vision.is_some())
            .finish_non_exhaustive()
    }
}

impl KnowledgeEngine {
    /// Build an engine over a client and configuration.
    pub fn new(client: Arc<ModelClient>, config: Arc<StraylightConfig>) -> Self {
        Self {
            client,
            config,
            vision: None,
        }
    }

    /// Attach a vision backend for image rescans during ingest.
    pub fn with_vision(mut self, vision: Arc<dyn VisionBackend>) -> Self {
        self.vision = Some(vision);
        self
    }

    /// The configured vision backend, if any.
    pub fn vision(&self) -> Option<&Arc<dyn VisionBackend>> {
        self.vision.as_ref()
    }

    /// Open an environment over the given store target.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the store cannot be opened.
    pub fn create_env(&self, target: StoreTarget) -> Result<Environment, EngineError> {
        let store = match target {
            StoreTarget::Disposable => Arc::new(KnowledgeStore::create_disposable()?),
            StoreTarget::Path(path) => Arc::new(KnowledgeStore::open(&path)?),
            StoreTarget::External(store) => store,
        };
        Ok(Environment {
            store,
            client: self.client.clone(),
            config: self.config.clone(),
            depth: Arc::new(AtomicU32::new(0)),
            query_counter: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Flush and close an environment. Owned (disposable) stores are
    /// removed from disk; external and path-backed stores only flush.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the final flush or removal
    /// fails; in-memory state stays valid on flush failure.
    pub fn dispose_env(&self, env: Environment) -> Result<(), EngineError> {
        env.store.flush_now()?;
        match Arc::try_unwrap(env.store) {
            Ok(store) => store.dispose()?,
            Err(shared) => {
                // Forked handles still alive; flushing was the essential part.
                if shared.is_owned() {
                    warn!(path = %shared.base_path().display(),
                        "disposable store still shared, skipping removal");
                }
            }
        }
        info!("environment disposed");
        Ok(())
    }

    /// Ingest documents into an environment's store.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] on store failure. Per-page extraction
    /// failures are counted in the report, never raised.
    pub async fn ingest(
        &self,
        env: &Environment,
        docs: Vec<crate::types::Document>,
        opts: IngestOptions,
    ) -> Result<Vec<IngestReport>, EngineError> {
        ingest::ingest(env, self.vision.as_ref(), docs, opts).await
    }

    /// Answer a query by driving the iteration loop.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] on store or model faults; iteration and
    /// deadline exhaustion are reported in the outcome, not as errors.
    pub async fn query(
        &self,
        env: &Environment,
        query: &str,
        opts: QueryOpts,
    ) -> Result<QueryOutcome, EngineError> {
        let runner: Arc<dyn SubQueryRunner> = Arc::new(EngineSubQuery {
            engine: self.clone(),
            env: env.clone(),
        });
        r#loop::run_query(env, runner, query, opts).await
    }
}

/// Bridges `rlm-query` back into the engine as a bounded sub-query.
struct EngineSubQuery {
    engine: KnowledgeEngine,
    env: Environment,
}

#[async_trait]
impl SubQueryRunner for EngineSubQuery {
    async fn run_sub_query(&self, query: String) -> serde_json::Value {
        // Sub-queries run lean: no refinement, no learning, fewer turns.
        let opts = QueryOpts {
            max_iterations: Some(self.env.config.limits.max_iterations.min(5)),
            ..QueryOpts::default()
        };
        match self.engine.query(&self.env, &query, opts).await {
            Ok(outcome) => outcome.answer,
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        }
    }
}
