//! Runs many scenarios concurrently while bounding in-flight runs per provider.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
};

use futures_util::{stream::FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::{
    artifact::{ModelSettings, RunArtifact},
    detection::DetectionEngine,
    orchestrator::{CancellationFlag, Orchestrator},
    providers::LLMProvider,
    scenario::Scenario,
    tools::{FixtureToolExecutor, ToolExecutor},
};

pub const DEFAULT_PROVIDER_CONCURRENCY: usize = 2;

/// One scenario run against one provider. Jobs sharing a `provider_key` share
/// that key's concurrency limit.
#[derive(Clone)]
pub struct SuiteJob {
    pub provider_key: String,
    pub provider: Arc<dyn LLMProvider>,
    pub settings: ModelSettings,
    pub scenario: Arc<Scenario>,
    /// Defaults to a fixture executor built from the scenario's tools.
    pub tools: Option<Arc<dyn ToolExecutor>>,
}

impl SuiteJob {
    pub fn new(
        provider_key: impl Into<String>,
        provider: Arc<dyn LLMProvider>,
        settings: ModelSettings,
        scenario: Arc<Scenario>,
    ) -> Self {
        Self {
            provider_key: provider_key.into(),
            provider,
            settings,
            scenario,
            tools: None,
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }
}

#[derive(Debug, Clone)]
pub struct SuiteOutcome {
    pub provider_key: String,
    pub artifact: RunArtifact,
}

pub struct SuiteRunner {
    max_turns: usize,
    default_limit: usize,
    limits: HashMap<String, usize>,
    engine: Arc<DetectionEngine>,
    cancel: CancellationFlag,
}

impl SuiteRunner {
    pub fn new(max_turns: usize) -> Self {
        Self {
            max_turns,
            default_limit: DEFAULT_PROVIDER_CONCURRENCY,
            limits: HashMap::new(),
            engine: Arc::new(DetectionEngine::default()),
            cancel: CancellationFlag::default(),
        }
    }

    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit.max(1);
        self
    }

    pub fn with_limit(mut self, provider_key: impl Into<String>, limit: usize) -> Self {
        self.limits.insert(provider_key.into(), limit.max(1));
        self
    }

    pub fn with_engine(mut self, engine: Arc<DetectionEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancel = flag;
        self
    }

    pub fn limit_for(&self, provider_key: &str) -> usize {
        self.limits
            .get(provider_key)
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// Runs every job and returns outcomes in the interleaved submission order.
    pub async fn run(&self, jobs: Vec<SuiteJob>) -> Vec<SuiteOutcome> {
        let jobs = interleave(jobs, |job| job.provider_key.clone());
        let semaphores: HashMap<String, Arc<Semaphore>> = jobs
            .iter()
            .map(|job| {
                (
                    job.provider_key.clone(),
                    Arc::new(Semaphore::new(self.limit_for(&job.provider_key))),
                )
            })
            .collect();
        info!(jobs = jobs.len(), providers = semaphores.len(), "suite started");

        let mut pending = FuturesUnordered::new();
        for (index, job) in jobs.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphores[&job.provider_key]);
            let engine = Arc::clone(&self.engine);
            let cancel = self.cancel.clone();
            let max_turns = self.max_turns;
            pending.push(async move {
                // Never closed, so acquisition cannot fail.
                let _permit = semaphore.acquire_owned().await.ok();
                debug!(provider = %job.provider_key, scenario = %job.scenario.id, "suite job running");
                let tools = job
                    .tools
                    .clone()
                    .unwrap_or_else(|| {
                        Arc::new(FixtureToolExecutor::new(&job.scenario.tools)) as Arc<dyn ToolExecutor>
                    });
                let artifact = Orchestrator::new(job.provider, tools, job.settings)
                    .with_engine(engine)
                    .with_cancellation(cancel)
                    .run(&job.scenario, max_turns)
                    .await;
                (
                    index,
                    SuiteOutcome {
                        provider_key: job.provider_key,
                        artifact,
                    },
                )
            });
        }

        let mut finished = Vec::new();
        while let Some(done) = pending.next().await {
            finished.push(done);
        }
        finished.sort_by_key(|(index, _)| *index);
        info!(runs = finished.len(), "suite finished");
        finished.into_iter().map(|(_, outcome)| outcome).collect()
    }
}

/// Round-robin over keys in first-seen order, preserving per-key order.
pub fn interleave<T>(items: Vec<T>, key: impl Fn(&T) -> String) -> Vec<T> {
    let mut order: Vec<String> = Vec::new();
    let mut lanes: BTreeMap<String, VecDeque<T>> = BTreeMap::new();
    let total = items.len();
    for item in items {
        let k = key(&item);
        if !lanes.contains_key(&k) {
            order.push(k.clone());
        }
        lanes.entry(k).or_default().push_back(item);
    }

    let mut out = Vec::with_capacity(total);
    while out.len() < total {
        for k in &order {
            if let Some(item) = lanes.get_mut(k).and_then(VecDeque::pop_front) {
                out.push(item);
            }
        }
    }
    out
}
