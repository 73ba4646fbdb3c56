//! Athlete engine
//!
//! Arena of per-athlete state addressed by athlete id. Each athlete's
//! aggregator, plan and recent events sit behind one `tokio::sync::Mutex`, taken
//! with a timeout. Every operation works on a staged copy of the state and
//! swaps it in only after the persistence sink accepted the update.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::adaptation::{AdaptationEngine, AdaptationEvent};
use crate::aggregate::{
    DailyLoad, IngestOutcome, LoadAggregator, LoadWindow, ReplayJob, ReplayResult, WindowConfig,
};
use crate::collaborators::{PersistenceSink, ProfileStore, StateUpdate};
use crate::config::EngineSettings;
use crate::error::{AggregateError, EngineError, InvariantViolation, PlanError, Result};
use crate::load::{LoadCalculator, LoadComputation};
use crate::logging::DiagnosticReport;
use crate::models::{AthleteId, AthleteProfile, LoadSample};
use crate::normalize::{ActivityNormalizer, RawActivity};
use crate::training_plan::{PeriodizationPlanner, TrainingPlan};

/// Everything the engine keeps for one athlete
#[derive(Debug, Clone)]
pub struct AthleteState {
    pub athlete_id: AthleteId,
    pub aggregator: LoadAggregator,
    pub plan: Option<TrainingPlan>,
    /// Latest adaptation events, oldest first
    pub recent_events: VecDeque<AdaptationEvent>,
    pub event_count: u64,
    /// Latest date adaptation was evaluated at for the current plan
    pub adapted_through: Option<NaiveDate>,
}

impl AthleteState {
    pub fn new(profile: &AthleteProfile) -> Self {
        AthleteState {
            athlete_id: profile.athlete_id.clone(),
            aggregator: LoadAggregator::new(
                profile.athlete_id.clone(),
                WindowConfig::from(&profile.plan_policy),
            ),
            plan: None,
            recent_events: VecDeque::new(),
            event_count: 0,
            adapted_through: None,
        }
    }

    fn record_event(&mut self, event: AdaptationEvent, keep: usize) {
        self.event_count += 1;
        self.recent_events.push_back(event);
        while self.recent_events.len() > keep {
            self.recent_events.pop_front();
        }
    }

    /// Serializable view for diagnostics and reporting
    pub fn snapshot(&self) -> AthleteSnapshot {
        AthleteSnapshot {
            athlete_id: self.athlete_id.clone(),
            window: self.aggregator.window(),
            replay_pending: self.aggregator.is_replay_pending(),
            daily_loads: self.aggregator.daily_loads().cloned().collect(),
            plan: self.plan.clone(),
            event_count: self.event_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AthleteSnapshot {
    pub athlete_id: AthleteId,
    pub window: LoadWindow,
    pub replay_pending: bool,
    pub daily_loads: Vec<DailyLoad>,
    pub plan: Option<TrainingPlan>,
    pub event_count: u64,
}

/// How an ingested activity reached the window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    /// Folded in order
    Applied,
    /// Arrived out of order; the window was replayed
    Replayed,
    /// A newer replay superseded this one; the window reflects it once committed
    ReplaySuperseded,
    /// Same or older revision already recorded
    Ignored,
}

/// Result of ingesting one activity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub athlete_id: AthleteId,
    pub activity_id: String,
    pub status: IngestStatus,
    pub load: Decimal,
    pub intensity_minutes: Decimal,
    pub partial: bool,
    pub window: LoadWindow,
    pub event: Option<AdaptationEvent>,
}

/// Training load engine over an arena of athletes
pub struct TrainingEngine {
    settings: EngineSettings,
    profiles: Arc<dyn ProfileStore>,
    sink: Arc<dyn PersistenceSink>,
    athletes: RwLock<HashMap<AthleteId, Arc<Mutex<AthleteState>>>>,
    profile_cache: RwLock<HashMap<AthleteId, Arc<AthleteProfile>>>,
}

impl TrainingEngine {
    pub fn new(
        settings: EngineSettings,
        profiles: Arc<dyn ProfileStore>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Self {
        TrainingEngine {
            settings,
            profiles,
            sink,
            athletes: RwLock::new(HashMap::new()),
            profile_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub async fn athlete_ids(&self) -> Vec<AthleteId> {
        let mut ids: Vec<AthleteId> = self.athletes.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cached profile, fetched from the store on first use
    pub async fn profile(&self, athlete_id: &str) -> Result<Arc<AthleteProfile>> {
        if let Some(profile) = self.profile_cache.read().await.get(athlete_id) {
            return Ok(Arc::clone(profile));
        }

        let profile = Arc::new(self.profiles.fetch_profile(athlete_id).await?);
        tracing::debug!(athlete_id, "Fetched athlete profile");
        self.profile_cache
            .write()
            .await
            .insert(athlete_id.to_string(), Arc::clone(&profile));
        Ok(profile)
    }

    /// Drop the cached profile; the next operation refetches it
    pub async fn invalidate_profile(&self, athlete_id: &str) {
        if self.profile_cache.write().await.remove(athlete_id).is_some() {
            tracing::debug!(athlete_id, "Invalidated cached profile");
        }
    }

    async fn handle(&self, profile: &AthleteProfile) -> Arc<Mutex<AthleteState>> {
        if let Some(handle) = self.athletes.read().await.get(&profile.athlete_id) {
            return Arc::clone(handle);
        }
        let mut athletes = self.athletes.write().await;
        Arc::clone(
            athletes
                .entry(profile.athlete_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(AthleteState::new(profile)))),
        )
    }

    async fn existing_handle(&self, athlete_id: &str) -> Result<Arc<Mutex<AthleteState>>> {
        self.athletes
            .read()
            .await
            .get(athlete_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownAthlete(athlete_id.to_string()))
    }

    /// Exclusive, time-boxed access to one athlete
    async fn lock(
        &self,
        athlete_id: &str,
        handle: Arc<Mutex<AthleteState>>,
    ) -> Result<OwnedMutexGuard<AthleteState>> {
        let wait = Duration::from_millis(self.settings.lock_timeout_ms);
        tokio::time::timeout(wait, handle.lock_owned())
            .await
            .map_err(|_| {
                tracing::warn!(athlete_id, waited_ms = self.settings.lock_timeout_ms, "Athlete lock timed out");
                EngineError::LockTimeout {
                    athlete_id: athlete_id.to_string(),
                    waited_ms: self.settings.lock_timeout_ms,
                }
            })
    }

    /// Normalize, compute load, aggregate, adapt and persist one activity
    pub async fn ingest_activity(&self, raw: &RawActivity, as_of: Option<NaiveDate>) -> Result<IngestReport> {
        let activity = ActivityNormalizer::normalize(raw)?;
        let profile = self.profile(&activity.athlete_id).await?;
        let computation = LoadCalculator::calculate(&activity, &profile)?;

        let handle = self.handle(&profile).await;
        let mut guard = self.lock(&activity.athlete_id, Arc::clone(&handle)).await?;

        let mut staged = guard.clone();
        staged
            .aggregator
            .reconfigure(WindowConfig::from(&profile.plan_policy));
        let outcome = staged
            .aggregator
            .ingest_computation(&computation, activity.revision)?;

        let mut update = StateUpdate::new(activity.athlete_id.clone());
        let status = match outcome {
            IngestOutcome::Ignored { .. } => {
                return Ok(self.report(&computation, IngestStatus::Ignored, &guard, None));
            }
            IngestOutcome::Applied { samples } => {
                update.samples = samples;
                IngestStatus::Applied
            }
            IngestOutcome::ReplayRequired { from } => {
                tracing::debug!(
                    athlete_id = %activity.athlete_id,
                    activity_id = %activity.id,
                    from = %from,
                    "Replaying load window"
                );
                update.samples = Self::computation_samples(&staged, &computation);
                self.sink.commit(&update).await?;
                *guard = staged;

                return self
                    .replay_locked(guard, handle, &profile, as_of, &computation)
                    .await;
            }
        };

        let event = self.adapt_staged(&mut staged, &profile, as_of)?;
        update.window = Some(staged.aggregator.window());
        if let Some(event) = &event {
            update.plan = staged.plan.clone();
            update.events.push(event.clone());
        }

        self.sink.commit(&update).await?;
        *guard = staged;

        tracing::info!(
            athlete_id = %activity.athlete_id,
            activity_id = %activity.id,
            load = %computation.total_load,
            adapted = event.is_some(),
            "Ingested activity"
        );

        Ok(self.report(&computation, status, &guard, event))
    }

    /// Run a pending replay, releasing the lock while folding when configured
    async fn replay_locked(
        &self,
        mut guard: OwnedMutexGuard<AthleteState>,
        handle: Arc<Mutex<AthleteState>>,
        profile: &AthleteProfile,
        as_of: Option<NaiveDate>,
        computation: &LoadComputation,
    ) -> Result<IngestReport> {
        let job = guard.aggregator.replay_job();
        let athlete_id = guard.athlete_id.clone();

        let result = if self.settings.replay_on_blocking_pool {
            drop(guard);
            let result = Self::run_detached(job).await?;
            guard = self.lock(&athlete_id, handle).await?;
            result
        } else {
            job.run()
        };

        let result = match result {
            Ok(result) => result,
            Err(AggregateError::OutOfOrderReplayConflict { generation, latest }) => {
                tracing::debug!(%athlete_id, generation, latest, "Discarding superseded replay");
                return Ok(self.report(computation, IngestStatus::ReplaySuperseded, &guard, None));
            }
            Err(e) => return Err(e.into()),
        };

        let mut staged = guard.clone();
        let window = match staged.aggregator.commit_replay(result) {
            Ok(window) => window,
            Err(AggregateError::OutOfOrderReplayConflict { generation, latest }) => {
                tracing::debug!(%athlete_id, generation, latest, "Discarding superseded replay");
                return Ok(self.report(computation, IngestStatus::ReplaySuperseded, &guard, None));
            }
            Err(e) => return Err(e.into()),
        };

        let event = self.adapt_staged(&mut staged, profile, as_of)?;
        let mut update = StateUpdate::new(athlete_id.clone());
        update.window = Some(window);
        if let Some(event) = &event {
            update.plan = staged.plan.clone();
            update.events.push(event.clone());
        }
        self.sink.commit(&update).await?;
        *guard = staged;

        tracing::info!(
            %athlete_id,
            activity_id = %computation.activity_id,
            adapted = event.is_some(),
            "Committed replayed load window"
        );

        Ok(self.report(computation, IngestStatus::Replayed, &guard, event))
    }

    async fn run_detached(job: ReplayJob) -> Result<std::result::Result<ReplayResult, AggregateError>> {
        tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|e| EngineError::TaskFailed(format!("replay: {}", e)))
    }

    fn computation_samples(state: &AthleteState, computation: &LoadComputation) -> Vec<LoadSample> {
        computation
            .daily_loads
            .keys()
            .filter_map(|date| state.aggregator.daily_sample(*date))
            .collect()
    }

    fn report(
        &self,
        computation: &LoadComputation,
        status: IngestStatus,
        state: &AthleteState,
        event: Option<AdaptationEvent>,
    ) -> IngestReport {
        IngestReport {
            athlete_id: computation.athlete_id.clone(),
            activity_id: computation.activity_id.clone(),
            status,
            load: computation.total_load,
            intensity_minutes: computation.intensity_minutes,
            partial: computation.is_partial(),
            window: state.aggregator.window(),
            event,
        }
    }

    /// Evaluate adaptation on staged state; invariant breaks are reported with full state
    fn adapt_staged(
        &self,
        staged: &mut AthleteState,
        profile: &AthleteProfile,
        as_of: Option<NaiveDate>,
    ) -> Result<Option<AdaptationEvent>> {
        if !self.settings.adapt_on_ingest {
            return Ok(None);
        }
        let Some(as_of) = as_of.or_else(|| staged.aggregator.last_processed_date()) else {
            return Ok(None);
        };
        self.adapt_at(staged, profile, as_of)
    }

    /// Never evaluates before a date already used; a revision that empties the
    /// last day must not reopen blocks that were treated as started

    fn adapt_at(
        &self,
        staged: &mut AthleteState,
        profile: &AthleteProfile,
        as_of: NaiveDate,
    ) -> Result<Option<AdaptationEvent>> {
        let as_of = staged.adapted_through.map_or(as_of, |through| through.max(as_of));
        let Some(plan) = staged.plan.as_mut() else {
            return Ok(None);
        };

        let started = Instant::now();
        match AdaptationEngine::run(plan, &staged.aggregator, profile, as_of) {
            Ok(event) => {
                staged.adapted_through = Some(as_of);
                if let Some(event) = &event {
                    staged.record_event(event.clone(), self.settings.recent_events);
                }
                Ok(event)
            }
            Err(violation) => {
                // the plan is untouched on error, so this is the state before the attempt
                let state = staged.snapshot();
                self.report_violation("adapt plan", &violation, &state, as_of, started.elapsed());
                Err(PlanError::from(violation).into())
            }
        }
    }

    fn report_violation(
        &self,
        operation: &str,
        violation: &InvariantViolation,
        state: &AthleteSnapshot,
        as_of: NaiveDate,
        elapsed: Duration,
    ) {
        let mut report = DiagnosticReport::new(operation).for_athlete(state.athlete_id.clone());
        report.add_error(violation);
        report.set_as_of(as_of);
        report.capture_state(state);
        report.set_duration(elapsed);
        report.log();

        if self.settings.save_diagnostics {
            if let Err(e) = report.save_default() {
                tracing::warn!(error = %e, "Failed to save diagnostic report");
            }
        }
    }

    /// Seed a plan if the athlete has none; returns the current plan otherwise
    pub async fn seed_plan(&self, athlete_id: &str, as_of: NaiveDate) -> Result<TrainingPlan> {
        self.plan_with(athlete_id, as_of, false).await
    }

    /// Replace the plan with a freshly seeded one
    pub async fn replan(&self, athlete_id: &str, as_of: NaiveDate) -> Result<TrainingPlan> {
        self.plan_with(athlete_id, as_of, true).await
    }

    async fn plan_with(&self, athlete_id: &str, as_of: NaiveDate, replace: bool) -> Result<TrainingPlan> {
        let profile = self.profile(athlete_id).await?;
        let handle = self.handle(&profile).await;
        let mut guard = self.lock(athlete_id, handle).await?;

        if let (Some(plan), false) = (&guard.plan, replace) {
            return Ok(plan.clone());
        }

        let chronic = guard
            .aggregator
            .snapshot_as_of(as_of)
            .map(|w| w.chronic)
            .unwrap_or_else(|_| guard.aggregator.window().chronic);
        let plan = PeriodizationPlanner::seed(&profile, chronic, as_of)?;

        let mut update = StateUpdate::new(athlete_id);
        update.plan = Some(plan.clone());
        self.sink.commit(&update).await?;
        guard.plan = Some(plan.clone());
        guard.adapted_through = None;

        Ok(plan)
    }

    /// Evaluate adaptation explicitly at `as_of`
    pub async fn adapt(&self, athlete_id: &str, as_of: NaiveDate) -> Result<Option<AdaptationEvent>> {
        let profile = self.profile(athlete_id).await?;
        let handle = self.existing_handle(athlete_id).await?;
        let mut guard = self.lock(athlete_id, handle).await?;
        if guard.plan.is_none() {
            return Err(EngineError::NoPlan(athlete_id.to_string()));
        }

        let mut staged = guard.clone();
        let Some(event) = self.adapt_at(&mut staged, &profile, as_of)? else {
            return Ok(None);
        };

        let mut update = StateUpdate::new(athlete_id);
        update.plan = staged.plan.clone();
        update.events.push(event.clone());
        self.sink.commit(&update).await?;
        *guard = staged;
        Ok(Some(event))
    }

    /// Force a full replay of the athlete's retained log
    pub async fn replay(&self, athlete_id: &str) -> Result<LoadWindow> {
        let handle = self.existing_handle(athlete_id).await?;
        let mut guard = self.lock(athlete_id, handle).await?;

        let mut staged = guard.clone();
        let window = staged.aggregator.replay_now()?;
        let mut update = StateUpdate::new(athlete_id);
        update.window = Some(window.clone());
        self.sink.commit(&update).await?;
        *guard = staged;
        Ok(window)
    }

    pub async fn window(&self, athlete_id: &str) -> Result<LoadWindow> {
        let handle = self.existing_handle(athlete_id).await?;
        let guard = self.lock(athlete_id, handle).await?;
        Ok(guard.aggregator.window())
    }

    pub async fn plan(&self, athlete_id: &str) -> Result<TrainingPlan> {
        let handle = self.existing_handle(athlete_id).await?;
        let guard = self.lock(athlete_id, handle).await?;
        guard
            .plan
            .clone()
            .ok_or_else(|| EngineError::NoPlan(athlete_id.to_string()))
    }

    /// Most recent adaptation events, oldest first
    pub async fn recent_events(&self, athlete_id: &str) -> Result<Vec<AdaptationEvent>> {
        let handle = self.existing_handle(athlete_id).await?;
        let guard = self.lock(athlete_id, handle).await?;
        Ok(guard.recent_events.iter().cloned().collect())
    }

    pub async fn snapshot(&self, athlete_id: &str) -> Result<AthleteSnapshot> {
        let handle = self.existing_handle(athlete_id).await?;
        let guard = self.lock(athlete_id, handle).await?;
        Ok(guard.snapshot())
    }

    /// Clone of every athlete's aggregator, for batch recomputation
    pub async fn aggregators(&self) -> Result<Vec<LoadAggregator>> {
        let handles: Vec<(AthleteId, Arc<Mutex<AthleteState>>)> = self
            .athletes
            .read()
            .await
            .iter()
            .map(|(id, h)| (id.clone(), Arc::clone(h)))
            .collect();

        let mut aggregators = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            let guard = self.lock(&id, handle).await?;
            aggregators.push(guard.aggregator.clone());
        }
        Ok(aggregators)
    }
}
