//! Request orchestration.
//!
//! `route` walks one request through the lifecycle: dedup claim, classify,
//! plan candidates (healthy models, ranked by effective cost under their own
//! cache decision), dispatch with timeout and fallback, record the response
//! for duplicates, and emit exactly one [`CostEvent`].

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::admission::{AdmissionController, AdmissionPolicy, CacheDecision, CacheMode};
use crate::classifier::{ComplexityClassifier, TierBoundaries};
use crate::config::{Config, ConfigError, RouterConfig};
use crate::cost;
use crate::dedup::{
    Claim, ContextFingerprint, DedupEntry, DedupRecord, DedupStats, DedupStore, FlightGuard,
    RequestFingerprint,
};
use crate::error::{Error, Result};
use crate::provider::{ModelProvider, ProviderCall, ProviderError, ProviderReply};
use crate::registry::{CapabilityTier, ModelProfile, ModelRegistry, RegistrySnapshot};
use crate::request::RoutableRequest;
use crate::sink::{CostEvent, CostEventSink, TracingSink};

use super::health::HealthRegistry;
use super::retry::{run_candidates, AttemptRecord, Candidate, DispatchOutcome, Retryable};

/// Dispatch tunables that can change on reload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouterSettings {
    pub call_timeout: Duration,
    /// Output size assumed when ranking candidates
    pub assumed_output_tokens: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from_config(&RouterConfig::default())
    }
}

impl RouterSettings {
    pub fn from_config(config: &RouterConfig) -> Self {
        Self {
            call_timeout: config.call_timeout(),
            assumed_output_tokens: config.assumed_output_tokens,
        }
    }
}

/// One model in a route plan with the cache decision it would be called with.
#[derive(Debug, Clone)]
pub struct PlannedCall {
    pub profile: Arc<ModelProfile>,
    pub decision: CacheDecision,
    /// Context under `decision`, user input, and assumed output
    pub estimated_cost: f64,
}

impl Candidate for PlannedCall {
    fn label(&self) -> String {
        self.profile.id()
    }
}

/// Ordered candidates for one request, cheapest effective cost first.
#[derive(Debug, Clone)]
pub struct RoutePlan {
    pub tier: CapabilityTier,
    pub context_fingerprint: ContextFingerprint,
    pub candidates: Vec<PlannedCall>,
}

/// What the caller gets back from a routed request.
#[derive(Debug, Clone, Serialize)]
pub struct RouteResponse {
    /// Id of the cost event emitted for this request
    pub request_id: Uuid,
    pub output: String,
    pub model: String,
    pub tier: CapabilityTier,
    pub cache_decision: CacheMode,
    pub dedup_hit: bool,
    pub output_tokens: u64,
    pub cost: f64,
    /// Failed attempts before the one that answered
    pub attempts: Vec<AttemptRecord>,
}

struct RouterInner {
    registry: ModelRegistry,
    classifier: ComplexityClassifier,
    admission: AdmissionController,
    dedup: Arc<DedupStore>,
    health: HealthRegistry,
    provider: Arc<dyn ModelProvider>,
    sink: Arc<dyn CostEventSink>,
    settings: RwLock<RouterSettings>,
}

/// Cost-aware router. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

/// Assembles a [`Router`] with non-default components.
pub struct RouterBuilder {
    registry: ModelRegistry,
    provider: Arc<dyn ModelProvider>,
    sink: Arc<dyn CostEventSink>,
    boundaries: TierBoundaries,
    policy: AdmissionPolicy,
    dedup_ttl: Duration,
    failure_threshold: u32,
    open_for: Duration,
    settings: RouterSettings,
}

impl RouterBuilder {
    pub fn sink(mut self, sink: Arc<dyn CostEventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn boundaries(mut self, boundaries: TierBoundaries) -> Self {
        self.boundaries = boundaries;
        self
    }

    pub fn admission_policy(mut self, policy: AdmissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    pub fn circuit(mut self, failure_threshold: u32, open_for: Duration) -> Self {
        self.failure_threshold = failure_threshold;
        self.open_for = open_for;
        self
    }

    pub fn settings(mut self, settings: RouterSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Result<Router> {
        self.boundaries.validate().map_err(config_error)?;
        self.policy.validate().map_err(config_error)?;

        Ok(Router {
            inner: Arc::new(RouterInner {
                registry: self.registry,
                classifier: ComplexityClassifier::new(self.boundaries),
                admission: AdmissionController::new(self.policy),
                dedup: Arc::new(DedupStore::new(self.dedup_ttl)),
                health: HealthRegistry::new(self.failure_threshold, self.open_for),
                provider: self.provider,
                sink: self.sink,
                settings: RwLock::new(self.settings),
            }),
        })
    }
}

fn config_error(message: String) -> Error {
    Error::Config(ConfigError::Validation(message))
}

impl Router {
    /// Start building a router over `registry` that calls out through `provider`.
    ///
    /// Events go to a [`TracingSink`] unless another sink is set.
    pub fn builder(registry: ModelRegistry, provider: Arc<dyn ModelProvider>) -> RouterBuilder {
        let router = RouterConfig::default();
        RouterBuilder {
            registry,
            provider,
            sink: Arc::new(TracingSink),
            boundaries: TierBoundaries::default(),
            policy: AdmissionPolicy::default(),
            dedup_ttl: Duration::from_secs(300),
            failure_threshold: router.failure_threshold,
            open_for: router.open_for(),
            settings: RouterSettings::from_config(&router),
        }
    }

    /// Router with default policy over `registry`.
    pub fn new(
        registry: ModelRegistry,
        provider: Arc<dyn ModelProvider>,
        sink: Arc<dyn CostEventSink>,
    ) -> Result<Self> {
        Self::builder(registry, provider).sink(sink).build()
    }

    /// Router configured from a validated [`Config`].
    pub fn from_config(
        config: &Config,
        provider: Arc<dyn ModelProvider>,
        sink: Arc<dyn CostEventSink>,
    ) -> Result<Self> {
        let registry = ModelRegistry::new(config.profiles())?;
        Self::builder(registry, provider)
            .sink(sink)
            .boundaries(config.classifier)
            .admission_policy(config.admission.clone())
            .dedup_ttl(config.dedup.ttl())
            .circuit(config.router.failure_threshold, config.router.open_for())
            .settings(RouterSettings::from_config(&config.router))
            .build()
    }

    /// Apply a reloaded configuration.
    ///
    /// Either everything is applied or, on error, nothing is. Requests
    /// already in flight keep the registry snapshot they started with.
    pub fn apply_config(&self, config: &Config) -> Result<()> {
        config.classifier.validate().map_err(config_error)?;
        config.admission.validate().map_err(config_error)?;

        let inner = &self.inner;
        let version = inner.registry.refresh(config.profiles())?;
        inner
            .admission
            .set_policy(config.admission.clone())
            .map_err(config_error)?;
        inner
            .classifier
            .set_boundaries(config.classifier)
            .map_err(config_error)?;
        inner.dedup.set_ttl(config.dedup.ttl());
        inner
            .health
            .set_thresholds(config.router.failure_threshold, config.router.open_for());
        *inner.settings.write().unwrap_or_else(PoisonError::into_inner) =
            RouterSettings::from_config(&config.router);

        info!(
            registry_version = version,
            dedup_ttl_secs = config.dedup.ttl_secs,
            "Configuration applied"
        );
        Ok(())
    }

    /// Start the background dedup sweeper and reuse-tracker sweep.
    ///
    /// Both tasks stop on their own once the router is dropped.
    pub fn spawn_maintenance(&self, interval: Duration) -> Vec<JoinHandle<()>> {
        let sweeper = self.inner.dedup.spawn_sweeper(interval);

        let weak = Arc::downgrade(&self.inner);
        let tracker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let retired = inner.admission.sweep(Instant::now());
                if retired > 0 {
                    debug!(retired, "Reuse tracker swept idle contexts");
                }
            }
        });

        vec![sweeper, tracker]
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.inner.health
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.inner.admission
    }

    pub fn classifier(&self) -> &ComplexityClassifier {
        &self.inner.classifier
    }

    pub fn dedup(&self) -> &Arc<DedupStore> {
        &self.inner.dedup
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.inner.dedup.stats()
    }

    pub fn settings(&self) -> RouterSettings {
        self.inner.settings()
    }

    /// Rank the candidates for `request` without dispatching or recording anything.
    pub fn plan(&self, request: &RoutableRequest) -> Result<RoutePlan> {
        request.validate()?;
        let snapshot = self.inner.registry.snapshot();
        let tier = self.inner.classifier.classify(request);
        self.inner.plan_with(&snapshot, request, tier, Instant::now())
    }

    /// Route one request and return its response with the emitted cost event.
    pub async fn route(&self, request: RoutableRequest) -> Result<(RouteResponse, CostEvent)> {
        let started = Instant::now();
        request.validate()?;

        let snapshot = self.inner.registry.snapshot();
        if let Some(model) = &request.model {
            snapshot.get(model)?;
        }

        let fp = RequestFingerprint::of(&request);
        let tier = self.inner.classifier.classify(&request);
        let span = tracing::info_span!("route", fingerprint = %fp, tier = %tier);

        self.route_claimed(request, snapshot, fp, tier, started)
            .instrument(span)
            .await
    }

    async fn route_claimed(
        &self,
        request: RoutableRequest,
        snapshot: Arc<RegistrySnapshot>,
        fp: RequestFingerprint,
        tier: CapabilityTier,
        started: Instant,
    ) -> Result<(RouteResponse, CostEvent)> {
        let inner = &self.inner;

        let guard = loop {
            match inner.dedup.claim(&fp, Instant::now()) {
                Claim::Hit(entry) => {
                    return Ok(inner.dedup_hit(&request, fp, tier, entry, started).await);
                }
                Claim::Wait(waiter) => {
                    debug!("Duplicate in flight, waiting for leader");
                    if let Some(entry) = waiter.wait().await {
                        return Ok(inner.dedup_hit(&request, fp, tier, entry, started).await);
                    }
                }
                Claim::Leader(guard) => break guard,
            }
        };

        let plan = match inner.plan_with(&snapshot, &request, tier, Instant::now()) {
            Ok(plan) => plan,
            Err(err) => {
                guard.abandon();
                let mut event = base_event(&request, fp, tier);
                event.failed = true;
                event.error = Some(err.to_string());
                event.latency_ms = elapsed_ms(started);
                inner.emit(&event).await;
                return Err(err);
            }
        };

        // The call runs to completion even if the caller goes away
        let task = tokio::spawn(
            inner
                .clone()
                .dispatch(request, fp, plan, guard, started)
                .in_current_span(),
        );
        match task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!("dispatch task failed: {}", e))),
        }
    }
}

impl RouterInner {
    fn settings(&self) -> RouterSettings {
        *self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn plan_with(
        &self,
        snapshot: &RegistrySnapshot,
        request: &RoutableRequest,
        tier: CapabilityTier,
        now: Instant,
    ) -> Result<RoutePlan> {
        let eligible = match &request.model {
            Some(model) => vec![snapshot.get(model)?],
            None => snapshot.candidates_for(tier),
        };
        let healthy: Vec<Arc<ModelProfile>> = eligible
            .into_iter()
            .filter(|p| self.health.is_available(&p.id()))
            .collect();
        let Some(cheapest_listed) = healthy.first().map(|p| p.id()) else {
            return Err(Error::NoCandidates { tier });
        };

        let context_fingerprint = ContextFingerprint::of(&request.context);
        let context_tokens = request.context_token_count();
        let user_tokens = request.user_token_count();
        let settings = self.settings();
        let output_tokens = request
            .sampling
            .max_output_tokens
            .map_or(settings.assumed_output_tokens, |max| {
                u64::from(max).min(settings.assumed_output_tokens)
            });

        let mut candidates: Vec<PlannedCall> = healthy
            .into_iter()
            .map(|profile| {
                let decision =
                    self.admission
                        .decide(&profile, &context_fingerprint, context_tokens, now);
                let estimated_cost = decision.effective_cost(&profile, context_tokens, output_tokens)
                    + cost::input_cost(&profile, user_tokens);
                PlannedCall {
                    profile,
                    decision,
                    estimated_cost,
                }
            })
            .collect();

        // Stable: equal costs keep the registry's cheapest-fastest order
        candidates.sort_by(|a, b| a.estimated_cost.total_cmp(&b.estimated_cost));

        let chosen = &candidates[0];
        if chosen.profile.id() != cheapest_listed {
            debug!(
                chosen = %chosen.profile.id(),
                listed_first = %cheapest_listed,
                cache = %chosen.decision.mode,
                "Cache decision re-ranked candidates"
            );
        }

        Ok(RoutePlan {
            tier,
            context_fingerprint,
            candidates,
        })
    }

    async fn dispatch(
        self: Arc<Self>,
        request: RoutableRequest,
        fp: RequestFingerprint,
        plan: RoutePlan,
        guard: FlightGuard,
        started: Instant,
    ) -> Result<(RouteResponse, CostEvent)> {
        let call_timeout = self.settings().call_timeout;
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let inner: &RouterInner = &self;
        let req = &request;

        let outcome = run_candidates(
            &plan.candidates,
            attempts.clone(),
            move |_, planned: &PlannedCall| {
                let call = ProviderCall {
                    model: planned.profile.clone(),
                    context: req.context.clone(),
                    user_input: req.user_input.clone(),
                    sampling: req.sampling.clone(),
                    cache: planned.decision.mode,
                };
                inner.call_with_health(call, call_timeout)
            },
        )
        .await;

        let attempts: Vec<AttemptRecord> =
            std::mem::take(&mut *attempts.lock().unwrap_or_else(PoisonError::into_inner));
        let mut attempted: Vec<String> = attempts.iter().map(|a| a.model.clone()).collect();
        let mut event = base_event(&request, fp, plan.tier);

        let (index, reply) = match outcome {
            DispatchOutcome::Completed { index, value } => (index, value),
            DispatchOutcome::Failed { .. } | DispatchOutcome::NoCandidates => {
                guard.abandon();
                let err = Error::AllCandidatesExhausted { attempts };
                event.failed = true;
                event.error = Some(err.to_string());
                event.attempted_models = attempted;
                event.latency_ms = elapsed_ms(started);
                warn!(error = %err, "Request failed");
                self.emit(&event).await;
                return Err(err);
            }
        };

        let planned = &plan.candidates[index];
        let profile = &planned.profile;
        let model_id = profile.id();
        let context_tokens = event.context_tokens;
        let user_cost = cost::input_cost(profile, event.user_tokens);
        let cost_with_policy =
            planned.decision.call_cost(profile, context_tokens, reply.output_tokens) + user_cost;
        let cost_if_naive =
            cost::cost_without_cache(profile, context_tokens, reply.output_tokens) + user_cost;

        let now = Instant::now();
        self.admission
            .observe(&plan.context_fingerprint, &model_id, context_tokens, now);
        if planned.decision.mode == CacheMode::Write {
            self.admission
                .record_write(&model_id, &plan.context_fingerprint, now);
        }
        guard.complete(
            DedupRecord {
                response: reply.output.clone(),
                model_id: model_id.clone(),
                output_tokens: reply.output_tokens,
                cost: cost_with_policy,
                naive_cost: cost_if_naive,
            },
            now,
        );

        attempted.push(model_id.clone());
        event.model = Some(model_id.clone());
        event.output_tokens = reply.output_tokens;
        event.cache_decision = planned.decision.mode;
        event.cache_hit = planned.decision.mode == CacheMode::Read;
        event.cost_with_policy = cost_with_policy;
        event.cost_if_naive = cost_if_naive;
        event.projected_cache_delta = planned.decision.projected_delta;
        event.admission_anomaly = planned.decision.is_anomaly();
        event.attempted_models = attempted;
        event.latency_ms = elapsed_ms(started);

        if event.admission_anomaly {
            warn!(
                model = %model_id,
                cache = %planned.decision.mode,
                projected_delta = planned.decision.projected_delta,
                "Cache decision projected to cost more than skipping"
            );
        }
        self.emit(&event).await;

        let response = RouteResponse {
            request_id: event.event_id,
            output: reply.output,
            model: model_id,
            tier: plan.tier,
            cache_decision: planned.decision.mode,
            dedup_hit: false,
            output_tokens: reply.output_tokens,
            cost: cost_with_policy,
            attempts,
        };
        Ok((response, event))
    }

    /// One provider call under the model's circuit breaker and a hard deadline.
    async fn call_with_health(
        &self,
        call: ProviderCall,
        limit: Duration,
    ) -> std::result::Result<ProviderReply, ProviderError> {
        let model_id = call.model.id();
        let permit = self
            .health
            .acquire(&model_id)
            .map_err(|e| ProviderError::Fault(e.to_string()))?;

        debug!(model = %model_id, cache = %call.cache, "Dispatching provider call");
        match tokio::time::timeout(limit, self.provider.invoke(call)).await {
            Ok(Ok(reply)) => {
                permit.success();
                Ok(reply)
            }
            Ok(Err(err)) if err.is_retryable() => {
                permit.failure(&err.to_string());
                Err(err)
            }
            Ok(Err(err)) => {
                permit.neutral();
                Err(err)
            }
            Err(_) => {
                let err = ProviderError::Timeout(limit.as_millis() as u64);
                permit.failure(&err.to_string());
                Err(err)
            }
        }
    }

    async fn dedup_hit(
        &self,
        request: &RoutableRequest,
        fp: RequestFingerprint,
        tier: CapabilityTier,
        entry: DedupEntry,
        started: Instant,
    ) -> (RouteResponse, CostEvent) {
        let mut event = base_event(request, fp, tier);
        event.model = Some(entry.model_id.clone());
        event.output_tokens = entry.output_tokens;
        event.dedup_hit = true;
        event.cost_if_naive = entry.naive_cost;
        event.latency_ms = elapsed_ms(started);

        debug!(model = %entry.model_id, hits = entry.hit_count, "Dedup hit");
        self.emit(&event).await;

        let response = RouteResponse {
            request_id: event.event_id,
            output: entry.response,
            model: entry.model_id,
            tier,
            cache_decision: CacheMode::Skip,
            dedup_hit: true,
            output_tokens: entry.output_tokens,
            cost: 0.0,
            attempts: Vec::new(),
        };
        (response, event)
    }

    async fn emit(&self, event: &CostEvent) {
        if let Err(e) = self.sink.record(event).await {
            warn!(event_id = %event.event_id, error = %e, "Failed to record cost event");
        }
    }
}

fn base_event(request: &RoutableRequest, fp: RequestFingerprint, tier: CapabilityTier) -> CostEvent {
    let mut event = CostEvent::new(fp);
    event.tier = Some(tier);
    event.context_tokens = request.context_token_count();
    event.user_tokens = request.user_token_count();
    event
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
