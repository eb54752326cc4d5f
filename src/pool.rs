//! Bounded pool of pipeline instances plus the global concurrency limiter.
//!
//! An acquisition takes a semaphore slot first, then claims an idle
//! instance, blocking while none is free; release happens in the reverse
//! order. The pool and the limiter are the only process-wide shared state
//! in the engine, and both live behind this one object; handlers receive
//! it explicitly instead of reaching for globals.
//!
//! Graceful shutdown: new acquisitions are rejected, active tasks get a
//! bounded grace period to drain, and whatever is still running is
//! cancelled through its [`CancelToken`].

use crate::config::Settings;
use crate::events::EventSink;
use crate::llm::{LanguageModel, LlmClient};
use crate::mcp::{ToolDispatch, ToolManager};
use crate::orchestrator::{CancelToken, Orchestrator};
use crate::types::AgentRole;
use crate::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// One pre-initialized orchestrator slot: LLM clients plus tool-manager
/// connections. Instances are reused across requests but never shared by
/// two tasks at once.
pub struct PipelineInstance {
    pub id: usize,
    pub llm: Arc<dyn LanguageModel>,
    pub summarizer: Arc<dyn LanguageModel>,
    pub tools: Arc<dyn ToolDispatch>,
}

impl PipelineInstance {
    /// Build the per-task orchestrator for this instance.
    pub fn orchestrator(
        &self,
        settings: Arc<Settings>,
        events: EventSink,
        cancel: CancelToken,
    ) -> Orchestrator {
        Orchestrator::new(
            AgentRole::Main,
            self.llm.clone(),
            self.summarizer.clone(),
            self.tools.clone(),
            settings,
            events,
            cancel,
        )
    }
}

/// Health-probe snapshot.
#[derive(Debug, Clone, Copy)]
pub struct PoolHealth {
    pub active_requests: usize,
    pub pool_size: usize,
}

/// The pool itself. Cheap to share as `Arc<PipelinePool>`.
pub struct PipelinePool {
    settings: Arc<Settings>,
    pool_size: usize,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<PipelineInstance>>,
    instance_returned: Notify,
    active: AtomicUsize,
    shutting_down: AtomicBool,
    lease_seq: AtomicU64,
    active_cancels: Mutex<HashMap<u64, CancelToken>>,
}

impl PipelinePool {
    /// Build a pool over already-constructed instances. The semaphore
    /// capacity may exceed the instance count; excess acquirers queue on
    /// the instance list.
    pub fn with_instances(
        settings: Arc<Settings>,
        instances: Vec<PipelineInstance>,
        max_concurrent: usize,
    ) -> Arc<Self> {
        let pool_size = instances.len();
        Arc::new(Self {
            settings,
            pool_size,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            idle: Mutex::new(instances.into()),
            instance_returned: Notify::new(),
            active: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            lease_seq: AtomicU64::new(0),
            active_cancels: Mutex::new(HashMap::new()),
        })
    }

    /// Build production instances: one LLM client pair and one tool-manager
    /// connection set per slot.
    pub async fn initialize(settings: Arc<Settings>) -> Result<Arc<Self>> {
        let mut instances = Vec::with_capacity(settings.pipeline_pool_size);
        let servers = settings.enabled_tools();
        let tool_timeout = Duration::from_secs(settings.tool_timeout_secs);

        for id in 0..settings.pipeline_pool_size {
            let llm: Arc<dyn LanguageModel> = Arc::new(LlmClient::new(settings.llm.clone())?);
            let summarizer: Arc<dyn LanguageModel> =
                Arc::new(LlmClient::new(settings.effective_summary_llm())?);
            let tools: Arc<dyn ToolDispatch> = Arc::new(
                ToolManager::connect(&servers, tool_timeout, settings.max_tool_result_chars)
                    .await?,
            );
            instances.push(PipelineInstance {
                id,
                llm,
                summarizer,
                tools,
            });
        }

        tracing::info!(
            pool_size = settings.pipeline_pool_size,
            max_concurrent = settings.max_concurrent_requests,
            "pipeline pool initialized"
        );
        let max_concurrent = settings.max_concurrent_requests;
        Ok(Self::with_instances(settings, instances, max_concurrent))
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.clone()
    }

    /// Acquire an instance: semaphore slot first, then an idle instance.
    pub async fn acquire(self: &Arc<Self>) -> Result<PipelineLease> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::pool("shutting down"));
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::pool("semaphore closed"))?;

        let instance = loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(Error::pool("shutting down"));
            }
            if let Some(instance) = self.idle.lock().expect("pool mutex poisoned").pop_front() {
                break instance;
            }
            self.instance_returned.notified().await;
        };

        let lease_id = self.lease_seq.fetch_add(1, Ordering::SeqCst);
        let cancel = CancelToken::new();
        self.active_cancels
            .lock()
            .expect("pool mutex poisoned")
            .insert(lease_id, cancel.clone());
        self.active.fetch_add(1, Ordering::SeqCst);

        Ok(PipelineLease {
            pool: self.clone(),
            instance: Some(instance),
            lease_id,
            cancel,
            _permit: permit,
        })
    }

    /// Health-probe snapshot: `(active_requests, pool_size)`.
    pub fn health(&self) -> PoolHealth {
        PoolHealth {
            active_requests: self.active.load(Ordering::SeqCst),
            pool_size: self.pool_size,
        }
    }

    /// Graceful shutdown: reject new work, wait up to `grace` for active
    /// tasks, then cancel the stragglers.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        // Wake any acquirer parked on the instance queue so it observes
        // the flag.
        self.instance_returned.notify_waiters();

        let deadline = tokio::time::Instant::now() + grace;
        while self.active.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                let cancels: Vec<CancelToken> = self
                    .active_cancels
                    .lock()
                    .expect("pool mutex poisoned")
                    .values()
                    .cloned()
                    .collect();
                tracing::warn!(remaining = cancels.len(), "grace period over, cancelling tasks");
                for token in cancels {
                    token.cancel();
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn release(&self, lease_id: u64, instance: PipelineInstance) {
        self.active_cancels
            .lock()
            .expect("pool mutex poisoned")
            .remove(&lease_id);
        self.idle
            .lock()
            .expect("pool mutex poisoned")
            .push_back(instance);
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.instance_returned.notify_one();
    }
}

/// RAII lease over one pipeline instance. Dropping it returns the instance
/// to the pool and then releases the semaphore slot.
pub struct PipelineLease {
    pool: Arc<PipelinePool>,
    instance: Option<PipelineInstance>,
    lease_id: u64,
    cancel: CancelToken,
    _permit: OwnedSemaphorePermit,
}

impl PipelineLease {
    pub fn instance(&self) -> &PipelineInstance {
        self.instance
            .as_ref()
            .expect("instance present until drop")
    }

    /// The cancellation token the pool will fire on forced shutdown.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The settings of the owning pool.
    pub fn pool_settings(&self) -> Arc<Settings> {
        self.pool.settings()
    }
}

impl Drop for PipelineLease {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.pool.release(self.lease_id, instance);
        }
        // The semaphore permit drops after this body: instance first,
        // permit second, the reverse of acquisition.
    }
}
