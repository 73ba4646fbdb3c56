//! Rolling acute/chronic load windows
//!
//! The window is a pure fold over the daily load log, started from a
//! checkpoint that absorbs days older than the retention horizon:
//!
//! `value_d = value_prev × (1 − α)^(d − prev) + α × load_d`, with `α = 1 / window_days`.
//!
//! In-order samples extend the fold incrementally; anything else marks the
//! window stale until a replay of the retained log is committed.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::AggregateError;
use crate::load::LoadComputation;
use crate::models::{AthleteId, LoadSample, PlanPolicy};

/// Decimal places reported on window snapshots
const WINDOW_SCALE: u32 = 4;

/// Window lengths and ratio guards, taken from the athlete's plan policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub acute_days: u16,
    pub chronic_days: u16,
    pub ratio_min_chronic: Decimal,
    pub ratio_min_samples: u16,
    pub retention_days: u16,
}

impl From<&PlanPolicy> for WindowConfig {
    fn from(policy: &PlanPolicy) -> Self {
        WindowConfig {
            acute_days: policy.acute_window_days,
            chronic_days: policy.chronic_window_days,
            ratio_min_chronic: policy.ratio_min_chronic,
            ratio_min_samples: policy.ratio_min_samples,
            retention_days: policy.retention_days,
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig::from(&PlanPolicy::default())
    }
}

/// Acute:chronic ratio interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    /// Ratio below 0.8
    Detraining,
    /// 0.8 to 1.3
    Productive,
    /// 1.3 to 1.5
    Overreaching,
    /// Above 1.5
    HighRisk,
}

impl TrainingStatus {
    pub fn from_ratio(ratio: Decimal) -> Self {
        if ratio < dec!(0.8) {
            TrainingStatus::Detraining
        } else if ratio <= dec!(1.3) {
            TrainingStatus::Productive
        } else if ratio <= dec!(1.5) {
            TrainingStatus::Overreaching
        } else {
            TrainingStatus::HighRisk
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            TrainingStatus::Detraining => "Load is falling below the fitness baseline",
            TrainingStatus::Productive => "Load is in the productive range",
            TrainingStatus::Overreaching => "Load is rising faster than fitness (monitor closely)",
            TrainingStatus::HighRisk => "Load spike well above baseline (recovery needed)",
        }
    }
}

/// Window snapshot handed to persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadWindow {
    pub athlete_id: AthleteId,

    /// Date the values are valid for; `None` before the first sample
    pub as_of: Option<NaiveDate>,

    /// Short-window EWMA
    pub acute: Decimal,

    /// Long-window EWMA
    pub chronic: Decimal,

    /// acute / chronic, undefined while chronic is insignificant
    pub ratio: Option<Decimal>,

    /// chronic − acute
    pub balance: Decimal,

    pub status: Option<TrainingStatus>,

    /// Days with positive load folded into the window
    pub contributing_days: u32,

    /// Days from the first positive load through `as_of`, inclusive
    pub history_days: u32,
}

/// One activity's share of a day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub load: Decimal,
    pub revision: u32,
}

/// All load recorded for one date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyLoad {
    pub date: NaiveDate,

    /// Per-activity loads keyed by activity id
    pub contributions: BTreeMap<String, Contribution>,
}

impl DailyLoad {
    fn new(date: NaiveDate) -> Self {
        DailyLoad {
            date,
            contributions: BTreeMap::new(),
        }
    }

    /// Day total, summed in activity-id order
    pub fn total(&self) -> Decimal {
        self.contributions.values().map(|c| c.load).sum()
    }
}

/// Single activity load for one date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadContribution {
    pub athlete_id: AthleteId,
    pub activity_id: String,
    pub revision: u32,
    pub date: NaiveDate,
    pub load: Decimal,
}

/// What an ingest did to the window
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Applied in order; the affected day samples are returned
    Applied { samples: Vec<LoadSample> },
    /// Log updated, window stale until a replay from `from` is committed
    ReplayRequired { from: NaiveDate },
    /// Same or older revision already recorded
    Ignored { activity_id: String, retained_revision: u32 },
}

/// EWMA state after folding some prefix of the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EwmaState {
    acute: Decimal,
    chronic: Decimal,
    last_date: Option<NaiveDate>,
    first_load_date: Option<NaiveDate>,
    contributing_days: u32,
}

impl EwmaState {
    fn zero() -> Self {
        EwmaState {
            acute: Decimal::ZERO,
            chronic: Decimal::ZERO,
            last_date: None,
            first_load_date: None,
            contributing_days: 0,
        }
    }
}

/// Shared generation counter; a replay is current while its generation is the latest
#[derive(Debug, Clone)]
pub struct ReplayToken {
    generation: u64,
    latest: Arc<AtomicU64>,
}

impl ReplayToken {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        self.latest.load(Ordering::SeqCst) == self.generation
    }

    fn check(&self) -> Result<(), AggregateError> {
        let latest = self.latest.load(Ordering::SeqCst);
        if latest == self.generation {
            Ok(())
        } else {
            Err(AggregateError::OutOfOrderReplayConflict {
                generation: self.generation,
                latest,
            })
        }
    }
}

/// Detached replay: a snapshot of the retained log that can be folded off-lock
#[derive(Debug, Clone)]
pub struct ReplayJob {
    config: WindowConfig,
    checkpoint: EwmaState,
    days: Vec<(NaiveDate, Decimal)>,
    token: ReplayToken,
}

/// Folded state ready to be committed
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayResult {
    generation: u64,
    base: EwmaState,
    state: EwmaState,
}

impl ReplayJob {
    pub fn token(&self) -> &ReplayToken {
        &self.token
    }

    /// Fold the snapshot; aborts as soon as a newer replay is requested
    pub fn run(&self) -> Result<ReplayResult, AggregateError> {
        let mut base = self.checkpoint.clone();
        let mut state = self.checkpoint.clone();

        for (date, total) in &self.days {
            self.token.check()?;
            base = state;
            state = fold_day(&self.config, &base, *date, *total);
        }
        self.token.check()?;

        Ok(ReplayResult {
            generation: self.token.generation,
            base,
            state,
        })
    }
}

/// `(1 − 1/days)^gap`
fn decay_factor(days: u16, gap: i64) -> Decimal {
    let keep = Decimal::ONE - Decimal::ONE / Decimal::from(days);
    let mut factor = Decimal::ONE;
    for _ in 0..gap.max(0) {
        factor *= keep;
    }
    factor
}

/// Fold one day onto `prev`. The only place EWMA arithmetic happens.
fn fold_day(config: &WindowConfig, prev: &EwmaState, date: NaiveDate, total: Decimal) -> EwmaState {
    let gap = prev.last_date.map(|last| (date - last).num_days()).unwrap_or(0);
    let acute_alpha = Decimal::ONE / Decimal::from(config.acute_days);
    let chronic_alpha = Decimal::ONE / Decimal::from(config.chronic_days);

    EwmaState {
        acute: prev.acute * decay_factor(config.acute_days, gap) + acute_alpha * total,
        chronic: prev.chronic * decay_factor(config.chronic_days, gap) + chronic_alpha * total,
        last_date: Some(date),
        first_load_date: prev
            .first_load_date
            .or_else(|| (total > Decimal::ZERO).then_some(date)),
        contributing_days: prev.contributing_days + u32::from(total > Decimal::ZERO),
    }
}

/// Per-athlete rolling load state.
///
/// Clones share the replay generation counter, so a staged copy that changes
/// the log also invalidates replays started from the original.
#[derive(Debug, Clone)]
pub struct LoadAggregator {
    athlete_id: AthleteId,
    config: WindowConfig,
    /// Fold of every day pruned from `log`
    checkpoint: EwmaState,
    /// Retained daily loads
    log: BTreeMap<NaiveDate, DailyLoad>,
    /// Fold of all days before `state.last_date`
    base: EwmaState,
    /// Fold through `state.last_date`
    state: EwmaState,
    replay_pending: bool,
    generation: Arc<AtomicU64>,
}

impl LoadAggregator {
    pub fn new(athlete_id: impl Into<AthleteId>, config: WindowConfig) -> Self {
        LoadAggregator {
            athlete_id: athlete_id.into(),
            config,
            checkpoint: EwmaState::zero(),
            log: BTreeMap::new(),
            base: EwmaState::zero(),
            state: EwmaState::zero(),
            replay_pending: false,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn athlete_id(&self) -> &str {
        &self.athlete_id
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Last date folded into the window
    pub fn last_processed_date(&self) -> Option<NaiveDate> {
        self.state.last_date
    }

    /// Oldest date that can still be ingested
    pub fn retention_horizon(&self) -> Option<NaiveDate> {
        self.checkpoint.last_date.and_then(|d| d.succ_opt())
    }

    pub fn is_replay_pending(&self) -> bool {
        self.replay_pending
    }

    /// Switch window parameters. The window is stale until the next replay;
    /// the checkpoint keeps the values it was folded with.
    pub fn reconfigure(&mut self, config: WindowConfig) {
        if self.config == config {
            return;
        }
        tracing::info!(
            athlete_id = %self.athlete_id,
            acute_days = config.acute_days,
            chronic_days = config.chronic_days,
            "Window configuration changed, replay required"
        );
        self.config = config;
        self.replay_pending = true;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Retained daily loads in date order
    pub fn daily_loads(&self) -> impl Iterator<Item = &DailyLoad> {
        self.log.values()
    }

    /// Aggregated load sample for a date, if any load was recorded
    pub fn daily_sample(&self, date: NaiveDate) -> Option<LoadSample> {
        self.log.get(&date).map(|day| LoadSample {
            athlete_id: self.athlete_id.clone(),
            date,
            load: day.total(),
            activity_ids: day.contributions.keys().cloned().collect(),
        })
    }

    /// Sum of retained daily loads in `[start, end)`
    pub fn load_between(&self, start: NaiveDate, end: NaiveDate) -> Decimal {
        if start >= end {
            return Decimal::ZERO;
        }
        self.log.range(start..end).map(|(_, day)| day.total()).sum()
    }

    /// Ingest every date of one activity's load computation
    pub fn ingest_computation(
        &mut self,
        computation: &LoadComputation,
        revision: u32,
    ) -> Result<IngestOutcome, AggregateError> {
        let contributions: Vec<LoadContribution> = computation
            .daily_loads
            .iter()
            .map(|(date, load)| LoadContribution {
                athlete_id: computation.athlete_id.clone(),
                activity_id: computation.activity_id.clone(),
                revision,
                date: *date,
                load: *load,
            })
            .collect();
        self.ingest_activity(&computation.activity_id, revision, &contributions)
    }

    /// Ingest a single-date contribution
    pub fn ingest(&mut self, contribution: LoadContribution) -> Result<IngestOutcome, AggregateError> {
        let activity_id = contribution.activity_id.clone();
        let revision = contribution.revision;
        self.ingest_activity(&activity_id, revision, &[contribution])
    }

    /// Record all contributions of one activity revision, superseding older ones
    fn ingest_activity(
        &mut self,
        activity_id: &str,
        revision: u32,
        contributions: &[LoadContribution],
    ) -> Result<IngestOutcome, AggregateError> {
        for c in contributions {
            if c.athlete_id != self.athlete_id {
                return Err(AggregateError::AthleteMismatch {
                    expected: self.athlete_id.clone(),
                    got: c.athlete_id.clone(),
                });
            }
            if let Some(horizon) = self.retention_horizon() {
                if c.date < horizon {
                    return Err(AggregateError::SampleBeyondRetention {
                        date: c.date,
                        horizon,
                    });
                }
            }
        }

        let existing: BTreeMap<NaiveDate, Contribution> = self
            .log
            .iter()
            .filter_map(|(date, day)| day.contributions.get(activity_id).map(|c| (*date, c.clone())))
            .collect();

        if let Some(retained) = existing.values().map(|c| c.revision).max() {
            let unchanged = existing.len() == contributions.len()
                && contributions.iter().all(|c| {
                    existing
                        .get(&c.date)
                        .map(|e| e.load == c.load)
                        .unwrap_or(false)
                });
            if revision < retained || (revision == retained && unchanged) {
                tracing::debug!(
                    athlete_id = %self.athlete_id,
                    activity_id,
                    revision,
                    retained,
                    "Ignoring stale or duplicate activity load"
                );
                return Ok(IngestOutcome::Ignored {
                    activity_id: activity_id.to_string(),
                    retained_revision: retained,
                });
            }
        }

        // Superseded revision: drop every date it touched
        for date in existing.keys() {
            if let Some(day) = self.log.get_mut(date) {
                day.contributions.remove(activity_id);
                if day.contributions.is_empty() {
                    self.log.remove(date);
                }
            }
        }
        for c in contributions {
            self.log
                .entry(c.date)
                .or_insert_with(|| DailyLoad::new(c.date))
                .contributions
                .insert(
                    activity_id.to_string(),
                    Contribution {
                        load: c.load,
                        revision,
                    },
                );
        }

        let affected_from = existing
            .keys()
            .chain(contributions.iter().map(|c| &c.date))
            .min()
            .copied();
        let Some(from) = affected_from else {
            return Ok(IngestOutcome::Applied { samples: Vec::new() });
        };

        // A superseded revision that emptied a day cannot be folded incrementally
        let emptied_day = existing.keys().any(|d| !self.log.contains_key(d));
        let in_order = !emptied_day
            && match self.state.last_date {
                None => true,
                Some(last) => from >= last,
            };

        if self.replay_pending || !in_order {
            self.replay_pending = true;
            // Any in-flight replay no longer reflects the log
            self.generation.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(
                athlete_id = %self.athlete_id,
                activity_id,
                from = %from,
                last_processed = ?self.state.last_date,
                "Out-of-order load, replay required"
            );
            return Ok(IngestOutcome::ReplayRequired { from });
        }

        let mut dates: Vec<NaiveDate> = contributions.iter().map(|c| c.date).collect();
        dates.extend(existing.keys().copied());
        dates.sort();
        dates.dedup();
        for date in &dates {
            self.apply_day(*date);
        }
        self.prune();

        Ok(IngestOutcome::Applied {
            samples: dates.iter().filter_map(|d| self.daily_sample(*d)).collect(),
        })
    }

    /// Extend the fold with `date`, recomputing it if it is the current last day
    fn apply_day(&mut self, date: NaiveDate) {
        let total = self.log.get(&date).map(DailyLoad::total).unwrap_or(Decimal::ZERO);
        if self.state.last_date != Some(date) {
            self.base = self.state.clone();
        }
        self.state = fold_day(&self.config, &self.base, date, total);
    }

    /// Snapshot the retained log for an off-lock replay. Supersedes earlier jobs.
    pub fn replay_job(&self) -> ReplayJob {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        ReplayJob {
            config: self.config.clone(),
            checkpoint: self.checkpoint.clone(),
            days: self.log.values().map(|d| (d.date, d.total())).collect(),
            token: ReplayToken {
                generation,
                latest: Arc::clone(&self.generation),
            },
        }
    }

    /// Commit a finished replay. Stale results are refused.
    pub fn commit_replay(&mut self, result: ReplayResult) -> Result<LoadWindow, AggregateError> {
        let latest = self.generation.load(Ordering::SeqCst);
        if result.generation != latest {
            return Err(AggregateError::OutOfOrderReplayConflict {
                generation: result.generation,
                latest,
            });
        }
        self.base = result.base;
        self.state = result.state;
        self.replay_pending = false;
        self.prune();
        Ok(self.window())
    }

    /// Replay synchronously and commit
    pub fn replay_now(&mut self) -> Result<LoadWindow, AggregateError> {
        let result = self.replay_job().run()?;
        self.commit_replay(result)
    }

    /// Fold days older than the retention horizon into the checkpoint
    fn prune(&mut self) {
        let Some(last) = self.state.last_date else {
            return;
        };
        let Some(cutoff) = last.checked_sub_days(chrono::Days::new(u64::from(self.config.retention_days))) else {
            return;
        };

        let retained = self.log.split_off(&cutoff.succ_opt().unwrap_or(cutoff));
        let pruned = std::mem::replace(&mut self.log, retained);
        if pruned.is_empty() {
            return;
        }

        for (date, day) in &pruned {
            self.checkpoint = fold_day(&self.config, &self.checkpoint, *date, day.total());
        }
        tracing::trace!(
            athlete_id = %self.athlete_id,
            pruned_days = pruned.len(),
            checkpoint = ?self.checkpoint.last_date,
            "Folded expired days into checkpoint"
        );
    }

    /// Window as of the last processed date
    pub fn window(&self) -> LoadWindow {
        self.snapshot(&self.state, self.state.last_date)
    }

    /// Window as of `date`: earlier dates are re-folded from the log,
    /// later dates decay the current values without adding load
    pub fn snapshot_as_of(&self, date: NaiveDate) -> Result<LoadWindow, AggregateError> {
        if let Some(horizon) = self.retention_horizon() {
            if date < horizon {
                return Err(AggregateError::SampleBeyondRetention { date, horizon });
            }
        }

        let mut state = self.checkpoint.clone();
        for day in self.log.range(..=date).map(|(_, d)| d) {
            state = fold_day(&self.config, &state, day.date, day.total());
        }
        if state.last_date.map(|last| last < date).unwrap_or(false) {
            state = fold_day(&self.config, &state, date, Decimal::ZERO);
        }
        Ok(self.snapshot(&state, Some(date)))
    }

    fn snapshot(&self, state: &EwmaState, as_of: Option<NaiveDate>) -> LoadWindow {
        let ratio = if state.chronic > self.config.ratio_min_chronic
            && !state.chronic.is_zero()
            && state.contributing_days >= u32::from(self.config.ratio_min_samples)
        {
            Some((state.acute / state.chronic).round_dp(WINDOW_SCALE))
        } else {
            None
        };

        LoadWindow {
            athlete_id: self.athlete_id.clone(),
            as_of,
            acute: state.acute.round_dp(WINDOW_SCALE),
            chronic: state.chronic.round_dp(WINDOW_SCALE),
            ratio,
            balance: (state.chronic - state.acute).round_dp(WINDOW_SCALE),
            status: ratio.map(TrainingStatus::from_ratio),
            contributing_days: state.contributing_days,
            history_days: match (state.first_load_date, as_of) {
                (Some(first), Some(as_of)) if as_of >= first => {
                    u32::try_from((as_of - first).num_days() + 1).unwrap_or(u32::MAX)
                }
                _ => 0,
            },
        }
    }
}
