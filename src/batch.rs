//! Parallel recomputation across athletes using rayon
//!
//! Athletes share nothing, so each one's log is rebuilt and folded on its own
//! rayon task. Used by the CLI `replay` command and after bulk imports.

use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::aggregate::{LoadAggregator, LoadWindow, WindowConfig};
use crate::error::{AggregateError, EngineError};
use crate::load::LoadCalculator;
use crate::models::{AthleteId, AthleteProfile};
use crate::normalize::{ActivityNormalizer, InvalidActivity, RawActivity};

/// Configuration for batch recomputation
#[derive(Debug, Clone, Default)]
pub struct BatchConfig {
    /// Worker threads; rayon's default pool when unset
    pub num_threads: Option<usize>,
}

/// Outcome for one athlete
#[derive(Debug, Clone)]
pub struct AthleteBatchResult {
    pub athlete_id: AthleteId,
    pub window: Option<LoadWindow>,
    pub activities: usize,
    pub rejected: Vec<InvalidActivity>,
    pub error: Option<String>,
    pub duration_ms: u128,
}

impl AthleteBatchResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary of a batch run
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub results: Vec<AthleteBatchResult>,
    pub total_duration_ms: u128,
}

impl BatchSummary {
    pub fn successful(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.successful()
    }

    pub fn rejected_activities(&self) -> usize {
        self.results.iter().map(|r| r.rejected.len()).sum()
    }

    /// Athletes per second
    pub fn throughput(&self) -> f64 {
        if self.total_duration_ms == 0 {
            return 0.0;
        }
        (self.results.len() as f64 / self.total_duration_ms as f64) * 1000.0
    }

    pub fn to_string_pretty(&self) -> String {
        format!(
            "Batch Replay Summary\n  \
             Athletes: {}\n  \
             Successful: {}\n  \
             Failed: {}\n  \
             Rejected Activities: {}\n  \
             Total Time: {:.2}s\n  \
             Throughput: {:.2} athletes/sec",
            self.results.len(),
            self.successful(),
            self.failed(),
            self.rejected_activities(),
            self.total_duration_ms as f64 / 1000.0,
            self.throughput()
        )
    }
}

/// Window of a finished replay; a failed replay is recorded as the athlete's error
fn settle_replay(
    athlete_id: &str,
    replayed: Result<LoadWindow, AggregateError>,
    error: &mut Option<String>,
) -> Option<LoadWindow> {
    match replayed {
        Ok(window) => Some(window),
        Err(e) => {
            warn!(athlete_id, error = %e, "Replay failed");
            error.get_or_insert_with(|| format!("replay failed: {}", e));
            None
        }
    }
}

/// Parallel recomputation of load windows
pub struct BatchProcessor {
    config: BatchConfig,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig) -> Self {
        BatchProcessor { config }
    }

    fn install<R: Send>(&self, work: impl FnOnce() -> R + Send) -> Result<R, EngineError> {
        match self.config.num_threads {
            Some(threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .map_err(|e| EngineError::Configuration(format!("thread pool: {}", e)))?;
                Ok(pool.install(work))
            }
            None => Ok(work()),
        }
    }

    /// Replay every aggregator in place
    pub fn replay_all(
        &self,
        aggregators: &mut [LoadAggregator],
    ) -> Result<Vec<Result<LoadWindow, AggregateError>>, EngineError> {
        self.install(|| {
            aggregators
                .par_iter_mut()
                .map(|aggregator| aggregator.replay_now())
                .collect()
        })
    }

    /// Rebuild aggregators from raw activities, grouped by athlete.
    ///
    /// Activities of athletes without a profile are reported as failures.
    pub fn rebuild(
        &self,
        activities: &[RawActivity],
        profiles: &HashMap<AthleteId, AthleteProfile>,
    ) -> Result<(Vec<LoadAggregator>, BatchSummary), EngineError> {
        let started = Instant::now();

        let (valid, rejected) = ActivityNormalizer::normalize_batch(activities);
        let mut rejected_by_athlete: BTreeMap<AthleteId, Vec<InvalidActivity>> = BTreeMap::new();
        for invalid in rejected {
            let athlete = activities
                .iter()
                .find(|raw| raw.activity_id == invalid.activity_id)
                .and_then(|raw| raw.athlete_id.clone())
                .unwrap_or_default();
            rejected_by_athlete.entry(athlete).or_default().push(invalid);
        }

        let mut by_athlete: BTreeMap<AthleteId, Vec<_>> = BTreeMap::new();
        for activity in valid {
            by_athlete
                .entry(activity.athlete_id.clone())
                .or_default()
                .push(activity);
        }
        for athlete in rejected_by_athlete.keys() {
            by_athlete.entry(athlete.clone()).or_default();
        }

        let outcomes: Vec<(Option<LoadAggregator>, AthleteBatchResult)> = self.install(|| {
            by_athlete
                .into_par_iter()
                .map(|(athlete_id, mut activities)| {
                    let athlete_started = Instant::now();
                    let rejected = rejected_by_athlete.get(&athlete_id).cloned().unwrap_or_default();
                    let count = activities.len();

                    let Some(profile) = profiles.get(&athlete_id) else {
                        warn!(%athlete_id, "No profile for athlete, skipping");
                        return (
                            None,
                            AthleteBatchResult {
                                error: Some(format!("no profile for athlete {}", athlete_id)),
                                athlete_id,
                                window: None,
                                activities: count,
                                rejected,
                                duration_ms: athlete_started.elapsed().as_millis(),
                            },
                        );
                    };

                    activities.sort_by(|a, b| (a.local_date(), &a.id).cmp(&(b.local_date(), &b.id)));
                    let mut aggregator =
                        LoadAggregator::new(athlete_id.clone(), WindowConfig::from(&profile.plan_policy));
                    let mut error = None;

                    for activity in &activities {
                        let ingested = LoadCalculator::calculate(activity, profile)
                            .map_err(EngineError::from)
                            .and_then(|load| {
                                aggregator
                                    .ingest_computation(&load, activity.revision)
                                    .map_err(EngineError::from)
                            });
                        if let Err(e) = ingested {
                            debug!(%athlete_id, activity_id = %activity.id, error = %e, "Activity skipped");
                            error.get_or_insert_with(|| e.to_string());
                        }
                    }

                    let window = if aggregator.is_replay_pending() {
                        settle_replay(&athlete_id, aggregator.replay_now(), &mut error)
                    } else {
                        Some(aggregator.window())
                    };

                    (
                        Some(aggregator),
                        AthleteBatchResult {
                            athlete_id,
                            window,
                            activities: count,
                            rejected,
                            error,
                            duration_ms: athlete_started.elapsed().as_millis(),
                        },
                    )
                })
                .collect()
        })?;

        let mut aggregators = Vec::new();
        let mut results = Vec::new();
        for (aggregator, result) in outcomes {
            aggregators.extend(aggregator);
            results.push(result);
        }

        let summary = BatchSummary {
            results,
            total_duration_ms: started.elapsed().as_millis(),
        };
        info!(
            athletes = summary.results.len(),
            failed = summary.failed(),
            rejected = summary.rejected_activities(),
            "Batch rebuild complete"
        );

        Ok((aggregators, summary))
    }
}

impl Default for BatchProcessor {
    fn default() -> Self {
        BatchProcessor::new(BatchConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricType;
    use crate::normalize::RawSample;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn raw(athlete: &str, id: &str, day: u32, watts: f64) -> RawActivity {
        RawActivity {
            activity_id: Some(id.to_string()),
            athlete_id: Some(athlete.to_string()),
            start_time: Some(Utc.with_ymd_and_hms(2024, 3, day, 6, 0, 0).unwrap()),
            duration_seconds: Some(1800),
            samples: (0..30)
                .map(|i| RawSample::new(i * 60, MetricType::Power, watts))
                .collect(),
            ..RawActivity::default()
        }
    }

    fn profiles() -> HashMap<AthleteId, AthleteProfile> {
        ["rider-a", "rider-b"]
            .iter()
            .map(|id| {
                let mut profile = AthleteProfile::new(*id);
                profile.thresholds.power = Some(dec!(250));
                (id.to_string(), profile)
            })
            .collect()
    }

    #[test]
    fn test_rebuild_matches_sequential_ingest() {
        let activities = vec![
            raw("rider-a", "a2", 5, 200.0),
            raw("rider-b", "b1", 2, 260.0),
            raw("rider-a", "a1", 3, 250.0),
        ];
        let profiles = profiles();
        let processor = BatchProcessor::new(BatchConfig { num_threads: Some(2) });

        let (aggregators, summary) = processor.rebuild(&activities, &profiles).unwrap();
        assert_eq!(summary.successful(), 2);
        assert_eq!(aggregators.len(), 2);

        let mut sequential = LoadAggregator::new("rider-a", WindowConfig::default());
        for raw in [&activities[2], &activities[0]] {
            let activity = ActivityNormalizer::normalize(raw).unwrap();
            let load = LoadCalculator::calculate(&activity, &profiles["rider-a"]).unwrap();
            sequential.ingest_computation(&load, 0).unwrap();
        }
        let rider_a = summary
            .results
            .iter()
            .find(|r| r.athlete_id == "rider-a")
            .and_then(|r| r.window.clone())
            .unwrap();
        assert_eq!(rider_a, sequential.window());
    }

    #[test]
    fn test_rejections_and_missing_profiles_are_reported() {
        let mut bad = raw("rider-a", "bad", 4, 200.0);
        bad.duration_seconds = Some(-5);
        let activities = vec![raw("rider-c", "c1", 1, 200.0), bad];

        let (aggregators, summary) = BatchProcessor::default().rebuild(&activities, &profiles()).unwrap();

        assert_eq!(summary.rejected_activities(), 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(aggregators.len(), 1);
        assert!(summary.to_string_pretty().contains("Athletes: 2"));
    }

    #[test]
    fn test_failed_replay_marks_athlete_failed() {
        let mut error = None;
        let conflict = Err(AggregateError::OutOfOrderReplayConflict { generation: 1, latest: 2 });

        assert_eq!(settle_replay("rider-a", conflict, &mut error), None);
        assert!(error.as_deref().is_some_and(|e| e.starts_with("replay failed")));

        // the first recorded error is kept
        let mut earlier = Some("missing threshold".to_string());
        let conflict = Err(AggregateError::OutOfOrderReplayConflict { generation: 1, latest: 2 });
        settle_replay("rider-a", conflict, &mut earlier);
        assert_eq!(earlier.as_deref(), Some("missing threshold"));

        let result = AthleteBatchResult {
            athlete_id: "rider-a".to_string(),
            window: None,
            activities: 1,
            rejected: Vec::new(),
            error,
            duration_ms: 0,
        };
        assert!(!result.is_success());
    }

    #[test]
    fn test_replay_all_in_place() {
        let (mut aggregators, _) = BatchProcessor::default()
            .rebuild(&[raw("rider-a", "a1", 3, 250.0)], &profiles())
            .unwrap();
        let before = aggregators[0].window();

        let windows = BatchProcessor::default().replay_all(&mut aggregators).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].as_ref().unwrap(), &before);
    }
}
