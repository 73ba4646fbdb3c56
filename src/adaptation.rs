//! Plan adaptation
//!
//! `classify` turns a block's actual vs. expected load into a [`Decision`];
//! [`AdaptationEngine::propose`] turns a decision into block changes for
//! future blocks only; [`AdaptationEngine::apply`] commits them atomically
//! and emits one [`AdaptationEvent`].
//!
//! Proposals only ever lower targets or swap in recovery, so running the
//! engine again on the same inputs finds nothing to change.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::LoadAggregator;
use crate::error::InvariantViolation;
use crate::models::{AthleteId, AthleteProfile, PlanPolicy};
use crate::training_plan::{BlockChange, Emphasis, PeriodizationPlanner, PlanBlock, TrainingPlan};

const RATIO_SCALE: u32 = 4;

/// Outcome of comparing a block's actual load to its target
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "magnitude", rename_all = "snake_case")]
pub enum Decision {
    OnTarget,
    /// Relative excess over the accepted band
    Overreach(Decimal),
    /// Relative shortfall below target
    Undershoot(Decimal),
}

impl Decision {
    pub fn is_on_target(&self) -> bool {
        matches!(self, Decision::OnTarget)
    }
}

/// Measured deviation that triggered a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deviation {
    pub block_index: u32,
    pub actual: Decimal,
    pub expected: Decimal,
    /// actual / expected; `None` when nothing was expected
    pub ratio: Option<Decimal>,
    pub acute_chronic_ratio: Option<Decimal>,
    pub elapsed_days: i64,
    pub in_progress: bool,
}

/// Evaluated block plus its decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub deviation: Deviation,
    pub decision: Decision,
    pub as_of: NaiveDate,
}

/// Non-empty set of changes waiting to be applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub assessment: Assessment,
    pub changes: Vec<BlockChange>,
}

/// Audit record of one applied adaptation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub athlete_id: AthleteId,
    pub plan_id: Uuid,
    pub evaluated_block: u32,
    pub deviation: Deviation,
    pub decision: Decision,
    pub changes: Vec<BlockChange>,
    /// Plan revision after the changes
    pub plan_revision: u32,
}

/// Classify a block's load against its expectation
///
/// Load above the band is overreach; load below it is undershoot. An
/// acute:chronic ratio at or above `overreach_ratio` is overreach when the
/// block itself is not short.
pub fn classify(
    actual: Decimal,
    expected: Decimal,
    acute_chronic_ratio: Option<Decimal>,
    policy: &PlanPolicy,
) -> Decision {
    let deviation = deviation_ratio(actual, expected);
    let excess = deviation.map(|d| d - Decimal::ONE).unwrap_or(Decimal::ZERO);

    if let Some(d) = deviation {
        if d > Decimal::ONE + policy.tolerance_pct {
            return Decision::Overreach(excess.round_dp(RATIO_SCALE));
        }
        if d < Decimal::ONE - policy.tolerance_pct {
            return Decision::Undershoot((Decimal::ONE - d).round_dp(RATIO_SCALE));
        }
    }

    match acute_chronic_ratio {
        Some(ratio) if ratio >= policy.overreach_ratio && policy.overreach_ratio > Decimal::ZERO => {
            let spike = ratio / policy.overreach_ratio - Decimal::ONE;
            Decision::Overreach(spike.max(excess).max(Decimal::ZERO).round_dp(RATIO_SCALE))
        }
        _ => Decision::OnTarget,
    }
}

fn deviation_ratio(actual: Decimal, expected: Decimal) -> Option<Decimal> {
    if expected > Decimal::ZERO {
        Some((actual / expected).round_dp(RATIO_SCALE))
    } else {
        None
    }
}

pub struct AdaptationEngine;

impl AdaptationEngine {
    /// Pick the block to evaluate and classify it
    ///
    /// The in-progress block is used once `min_block_progress_days` have
    /// elapsed, with its target pro-rated; otherwise the last completed block.
    pub fn assess(
        plan: &TrainingPlan,
        loads: &LoadAggregator,
        as_of: NaiveDate,
        policy: &PlanPolicy,
    ) -> Option<Assessment> {
        let (block, elapsed, in_progress) = Self::evaluated_block(plan, as_of, policy)?;

        let end = block.start + Duration::days(elapsed);
        let actual = loads.load_between(block.start, end);
        let expected = block.prorated_target(elapsed).round_dp(2);
        // A young history inflates acute against chronic
        let acute_chronic_ratio = loads
            .snapshot_as_of(as_of)
            .ok()
            .filter(|w| w.history_days >= u32::from(policy.ratio_min_history_days))
            .and_then(|w| w.ratio);
        let decision = classify(actual, expected, acute_chronic_ratio, policy);

        tracing::debug!(
            athlete_id = %plan.athlete_id,
            block = block.index,
            %actual,
            %expected,
            ratio = ?acute_chronic_ratio,
            ?decision,
            "Assessed block"
        );

        Some(Assessment {
            deviation: Deviation {
                block_index: block.index,
                actual,
                expected,
                ratio: deviation_ratio(actual, expected),
                acute_chronic_ratio,
                elapsed_days: elapsed,
                in_progress,
            },
            decision,
            as_of,
        })
    }

    fn evaluated_block<'a>(
        plan: &'a TrainingPlan,
        as_of: NaiveDate,
        policy: &PlanPolicy,
    ) -> Option<(&'a PlanBlock, i64, bool)> {
        if let Some(current) = plan.block_at(as_of) {
            let elapsed = current.elapsed_days(as_of);
            if elapsed >= i64::from(policy.min_block_progress_days) {
                return Some((current, elapsed, elapsed < current.length_days()));
            }
        }
        plan.last_completed_block(as_of)
            .map(|block| (block, block.length_days(), false))
    }

    /// Block changes implied by an assessment. `None` when nothing would change.
    pub fn propose(
        plan: &TrainingPlan,
        assessment: Assessment,
        profile: &AthleteProfile,
    ) -> Option<Proposal> {
        let policy = &profile.plan_policy;
        let as_of = assessment.as_of;
        let future: Vec<&PlanBlock> = plan.future_blocks(as_of).collect();
        if future.is_empty() {
            return None;
        }

        let evaluated = plan.blocks.get(assessment.deviation.block_index as usize)?;

        let desired: Vec<(Decimal, Emphasis)> = match assessment.decision {
            Decision::OnTarget => return None,
            Decision::Overreach(magnitude) => {
                let cap = (evaluated.target * policy.recovery_factor).round_dp(2);
                let extend = future[0].baseline_emphasis == Emphasis::Recover
                    || magnitude >= policy.severe_overreach;
                let recover_count = if extend { 2 } else { 1 };

                future
                    .iter()
                    .enumerate()
                    .map(|(i, block)| {
                        if i < recover_count {
                            let emphasis = if block.emphasis == Emphasis::Taper {
                                Emphasis::Taper
                            } else {
                                Emphasis::Recover
                            };
                            (block.target.min(cap), emphasis)
                        } else {
                            (block.target, block.emphasis)
                        }
                    })
                    .collect()
            }
            // A short start to a block can still be made up inside it
            Decision::Undershoot(_) if assessment.deviation.in_progress => return None,
            Decision::Undershoot(_) => {
                let elapsed = assessment.deviation.elapsed_days.max(1);
                let achieved = assessment.deviation.actual * Decimal::from(evaluated.length_days())
                    / Decimal::from(elapsed);
                let floor = evaluated.target * policy.recovery_factor;
                let full_block = achieved.max(floor).round_dp(2);
                let emphases: Vec<Emphasis> = future.iter().map(|b| b.baseline_emphasis).collect();
                let cap = profile.availability.load_cap(policy.block_length_days);
                let rederived = PeriodizationPlanner::project_targets(
                    &emphases,
                    full_block,
                    Some(full_block),
                    policy,
                    cap,
                );

                future
                    .iter()
                    .zip(rederived)
                    .map(|(block, target)| (block.target.min(target), block.emphasis))
                    .collect()
            }
        };

        let changes: Vec<BlockChange> = future
            .iter()
            .zip(desired)
            .filter(|(block, (target, emphasis))| block.target != *target || block.emphasis != *emphasis)
            .map(|(block, (target, emphasis))| BlockChange {
                index: block.index,
                old_target: block.target,
                new_target: target,
                old_emphasis: block.emphasis,
                new_emphasis: emphasis,
            })
            .collect();

        if changes.is_empty() {
            return None;
        }
        Some(Proposal { assessment, changes })
    }

    /// Apply a proposal atomically. The plan is untouched on error.
    pub fn apply(
        plan: &mut TrainingPlan,
        proposal: Proposal,
        as_of: NaiveDate,
        tolerance: Decimal,
    ) -> Result<AdaptationEvent, InvariantViolation> {
        plan.apply_changes(&proposal.changes, as_of, tolerance)?;
        plan.check_contiguity()?;

        let event = AdaptationEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            athlete_id: plan.athlete_id.clone(),
            plan_id: plan.id,
            evaluated_block: proposal.assessment.deviation.block_index,
            deviation: proposal.assessment.deviation,
            decision: proposal.assessment.decision,
            changes: proposal.changes,
            plan_revision: plan.revision,
        };

        tracing::info!(
            athlete_id = %event.athlete_id,
            block = event.evaluated_block,
            decision = ?event.decision,
            changed_blocks = event.changes.len(),
            plan_revision = event.plan_revision,
            "Adapted training plan"
        );

        Ok(event)
    }

    /// Assess, propose and apply in one step
    pub fn run(
        plan: &mut TrainingPlan,
        loads: &LoadAggregator,
        profile: &AthleteProfile,
        as_of: NaiveDate,
    ) -> Result<Option<AdaptationEvent>, InvariantViolation> {
        let policy = &profile.plan_policy;
        let Some(assessment) = Self::assess(plan, loads, as_of, policy) else {
            return Ok(None);
        };
        let Some(proposal) = Self::propose(plan, assessment, profile) else {
            return Ok(None);
        };
        Self::apply(plan, proposal, as_of, policy.tolerance_pct).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{LoadContribution, WindowConfig};
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn profile() -> AthleteProfile {
        let mut profile = AthleteProfile::new("athlete-1");
        profile.target_event_date = Some(date(2024, 2, 26));
        profile.plan_policy.initial_block_target = dec!(100);
        profile
    }

    fn plan(profile: &AthleteProfile) -> TrainingPlan {
        PeriodizationPlanner::seed(profile, Decimal::ZERO, date(2024, 1, 1)).unwrap()
    }

    /// 56 days of steady load before the plan, then `daily` for `days` days
    fn loads(daily: Decimal, days: i64) -> LoadAggregator {
        let mut agg = LoadAggregator::new("athlete-1", WindowConfig::default());
        let mut day = date(2023, 11, 6);
        let mut n = 0;
        while day < date(2024, 1, 1) {
            agg.ingest(LoadContribution {
                athlete_id: "athlete-1".to_string(),
                activity_id: format!("hist-{}", n),
                revision: 0,
                date: day,
                load: dec!(14.29),
            })
            .unwrap();
            day += Duration::days(1);
            n += 1;
        }
        for i in 0..days {
            agg.ingest(LoadContribution {
                athlete_id: "athlete-1".to_string(),
                activity_id: format!("plan-{}", i),
                revision: 0,
                date: date(2024, 1, 1) + Duration::days(i),
                load: daily,
            })
            .unwrap();
        }
        agg
    }

    #[test]
    fn test_classify_bands() {
        let policy = PlanPolicy::default();
        assert_eq!(classify(dec!(100), dec!(100), Some(dec!(1.0)), &policy), Decision::OnTarget);
        assert_eq!(classify(dec!(114), dec!(100), None, &policy), Decision::OnTarget);
        assert_eq!(classify(dec!(130), dec!(100), None, &policy), Decision::Overreach(dec!(0.3)));
        assert_eq!(classify(dec!(50), dec!(100), None, &policy), Decision::Undershoot(dec!(0.5)));
        assert_eq!(
            classify(dec!(100), dec!(100), Some(dec!(1.8)), &policy),
            Decision::Overreach(dec!(0.2))
        );
        // short block wins over a ratio spike
        assert!(matches!(
            classify(dec!(20), dec!(100), Some(dec!(3)), &policy),
            Decision::Undershoot(_)
        ));
        assert_eq!(classify(dec!(10), Decimal::ZERO, None, &policy), Decision::OnTarget);
    }

    #[test]
    fn test_on_target_produces_no_event() {
        let profile = profile();
        let mut plan = plan(&profile);
        let agg = loads(dec!(14.29), 7);

        let event = AdaptationEngine::run(&mut plan, &agg, &profile, date(2024, 1, 7)).unwrap();
        assert!(event.is_none());
        assert_eq!(plan.revision, 0);
    }

    #[test]
    fn test_overreach_inserts_recovery() {
        let profile = profile();
        let mut plan = plan(&profile);
        let agg = loads(dec!(17.5), 7); // 122.5 for a 100 block

        let event = AdaptationEngine::run(&mut plan, &agg, &profile, date(2024, 1, 7))
            .unwrap()
            .expect("overreach event");

        assert!(matches!(event.decision, Decision::Overreach(_)));
        assert_eq!(event.changes.len(), 1);
        assert_eq!(plan.blocks[1].emphasis, Emphasis::Recover);
        assert_eq!(plan.blocks[1].target, dec!(80));
        assert_eq!(plan.blocks[2].emphasis, Emphasis::Build);
        assert_eq!(event.plan_revision, 1);
        assert!(plan.check_contiguity().is_ok());
    }

    #[test]
    fn test_severe_overreach_extends_recovery() {
        let profile = profile();
        let mut plan = plan(&profile);
        let agg = loads(dec!(25), 7); // 175 for a 100 block

        let event = AdaptationEngine::run(&mut plan, &agg, &profile, date(2024, 1, 7))
            .unwrap()
            .expect("overreach event");

        assert_eq!(event.changes.len(), 2);
        assert_eq!(plan.blocks[1].emphasis, Emphasis::Recover);
        assert_eq!(plan.blocks[2].emphasis, Emphasis::Recover);
        assert!(plan.blocks[2].target <= dec!(80));
    }

    #[test]
    fn test_undershoot_never_catches_up() {
        let profile = profile();
        let mut plan = plan(&profile);
        let agg = loads(dec!(7), 7); // 49 for a 100 block

        let event = AdaptationEngine::run(&mut plan, &agg, &profile, date(2024, 1, 7))
            .unwrap()
            .expect("undershoot event");

        assert!(matches!(event.decision, Decision::Undershoot(_)));
        for block in plan.blocks.iter().skip(1) {
            assert!(block.target <= block.baseline_target);
            assert_eq!(block.emphasis, block.baseline_emphasis);
        }
        assert_eq!(plan.blocks[1].target, dec!(88.00));
        assert!(plan.check_contiguity().is_ok());
    }

    fn fresh_loads(daily: Decimal, days: i64) -> LoadAggregator {
        let mut agg = LoadAggregator::new("athlete-1", WindowConfig::default());
        for i in 0..days {
            agg.ingest(LoadContribution {
                athlete_id: "athlete-1".to_string(),
                activity_id: format!("plan-{}", i),
                revision: 0,
                date: date(2024, 1, 1) + Duration::days(i),
                load: daily,
            })
            .unwrap();
        }
        agg
    }

    #[test]
    fn test_new_athlete_on_target_keeps_plan() {
        let profile = profile();
        let mut plan = plan(&profile);
        let agg = fresh_loads(dec!(14.2857), 7);

        // young history: the window ratio is high but not trusted yet
        assert!(agg.window().ratio.unwrap() > profile.plan_policy.overreach_ratio);
        let assessment = AdaptationEngine::assess(&plan, &agg, date(2024, 1, 7), &profile.plan_policy)
            .expect("assessment");
        assert_eq!(assessment.deviation.acute_chronic_ratio, None);
        assert_eq!(assessment.decision, Decision::OnTarget);

        let event = AdaptationEngine::run(&mut plan, &agg, &profile, date(2024, 1, 7)).unwrap();
        assert!(event.is_none());
        assert_eq!(plan.blocks[1].emphasis, Emphasis::Build);
        assert_eq!(plan.blocks[1].target, dec!(110));
    }

    #[test]
    fn test_ratio_counts_once_history_is_long_enough() {
        let mut profile = profile();
        profile.plan_policy.ratio_min_history_days = 7;
        let plan = plan(&profile);
        let agg = fresh_loads(dec!(14.2857), 7);

        let assessment = AdaptationEngine::assess(&plan, &agg, date(2024, 1, 7), &profile.plan_policy)
            .expect("assessment");
        assert!(assessment.deviation.acute_chronic_ratio.is_some());
        assert!(matches!(assessment.decision, Decision::Overreach(_)));
    }

    #[test]
    fn test_rest_early_in_block_changes_nothing() {
        let profile = profile();
        let mut plan = plan(&profile);
        let agg = fresh_loads(Decimal::ZERO, 0);
        let before = plan.clone();

        let assessment = AdaptationEngine::assess(&plan, &agg, date(2024, 1, 3), &profile.plan_policy)
            .expect("assessment");
        assert!(assessment.deviation.in_progress);
        assert_eq!(assessment.decision, Decision::Undershoot(dec!(1)));

        let event = AdaptationEngine::run(&mut plan, &agg, &profile, date(2024, 1, 3)).unwrap();
        assert!(event.is_none());
        assert_eq!(plan, before);
    }

    #[test]
    fn test_missed_block_keeps_future_targets_positive() {
        let profile = profile();
        let mut plan = plan(&profile);
        let agg = fresh_loads(Decimal::ZERO, 0);

        let event = AdaptationEngine::run(&mut plan, &agg, &profile, date(2024, 1, 7))
            .unwrap()
            .expect("undershoot event");

        assert_eq!(event.decision, Decision::Undershoot(dec!(1)));
        // re-derived from a recovery-sized block, not from zero
        assert_eq!(plan.blocks[1].target, dec!(88.00));
        for block in plan.blocks.iter().skip(1) {
            assert!(block.target > Decimal::ZERO);
            assert!(block.target <= block.baseline_target);
        }
    }

    #[test]
    fn test_adaptation_is_idempotent() {
        let profile = profile();
        let mut plan = plan(&profile);
        let agg = loads(dec!(7), 7);

        let first = AdaptationEngine::run(&mut plan, &agg, &profile, date(2024, 1, 7)).unwrap();
        let snapshot = plan.clone();
        let second = AdaptationEngine::run(&mut plan, &agg, &profile, date(2024, 1, 7)).unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(plan, snapshot);
    }

    #[test]
    fn test_in_progress_block_is_prorated() {
        let profile = profile();
        let plan = plan(&profile);
        let agg = loads(dec!(14.29), 4);

        let assessment = AdaptationEngine::assess(&plan, &agg, date(2024, 1, 4), &profile.plan_policy)
            .expect("assessment");
        assert!(assessment.deviation.in_progress);
        assert_eq!(assessment.deviation.elapsed_days, 4);
        assert_eq!(assessment.deviation.expected, dec!(57.14));
        assert_eq!(assessment.decision, Decision::OnTarget);
    }

    #[test]
    fn test_early_block_falls_back_to_last_completed() {
        let profile = profile();
        let plan = plan(&profile);
        let agg = loads(dec!(14.29), 8);

        let assessment = AdaptationEngine::assess(&plan, &agg, date(2024, 1, 8), &profile.plan_policy)
            .expect("assessment");
        assert_eq!(assessment.deviation.block_index, 0);
        assert!(!assessment.deviation.in_progress);
    }

    #[test]
    fn test_stale_proposal_is_invariant_violation() {
        let profile = profile();
        let mut plan = plan(&profile);
        let agg = loads(dec!(25), 7);

        let assessment = AdaptationEngine::assess(&plan, &agg, date(2024, 1, 7), &profile.plan_policy).unwrap();
        let proposal = AdaptationEngine::propose(&plan, assessment, &profile).unwrap();
        let before = plan.clone();

        let err = AdaptationEngine::apply(&mut plan, proposal, date(2024, 1, 9), dec!(0.15)).unwrap_err();
        assert_eq!(err.operation, "apply_changes");
        assert_eq!(plan, before);
    }
}
