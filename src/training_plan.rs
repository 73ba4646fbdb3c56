use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{InvariantViolation, PlanError};
use crate::models::{AthleteId, AthleteProfile, PlanPolicy};

/// Decimal places kept on block targets
const TARGET_SCALE: u32 = 2;

/// Block emphasis within the macro-pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emphasis {
    /// Progressive load increase
    Build,
    /// Last build before taper
    Peak,
    /// Unloading block
    Recover,
    /// Pre-event reduction
    Taper,
}

impl Emphasis {
    /// Build-like blocks carry the progression
    pub fn is_progressive(&self) -> bool {
        matches!(self, Emphasis::Build | Emphasis::Peak)
    }
}

impl fmt::Display for Emphasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Emphasis::Build => "Build",
            Emphasis::Peak => "Peak",
            Emphasis::Recover => "Recover",
            Emphasis::Taper => "Taper",
        };
        write!(f, "{}", name)
    }
}

/// Recovery pattern for training cycles: N build blocks then one recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPattern {
    pub build_blocks: u8,
}

impl RecoveryPattern {
    pub fn new(build_blocks: u8) -> Self {
        RecoveryPattern {
            build_blocks: build_blocks.max(1),
        }
    }

    pub fn cycle_length(&self) -> u32 {
        u32::from(self.build_blocks) + 1
    }

    /// Zero-based position within the pre-taper sequence
    pub fn is_recovery(&self, position: u32) -> bool {
        (position + 1) % self.cycle_length() == 0
    }
}

impl Default for RecoveryPattern {
    fn default() -> Self {
        RecoveryPattern::new(3)
    }
}

impl FromStr for RecoveryPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (builds, recover) = s
            .split_once(':')
            .ok_or_else(|| format!("Unknown recovery pattern: {}", s))?;
        let builds: u8 = builds
            .trim()
            .parse()
            .map_err(|_| format!("Unknown recovery pattern: {}", s))?;
        if recover.trim() != "1" || builds == 0 {
            return Err(format!("Unknown recovery pattern: {}", s));
        }
        Ok(RecoveryPattern::new(builds))
    }
}

impl fmt::Display for RecoveryPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:1", self.build_blocks)
    }
}

/// Accepted load band around a target
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetRange {
    pub low: Decimal,
    pub high: Decimal,
}

impl TargetRange {
    pub fn around(target: Decimal, tolerance: Decimal) -> Self {
        TargetRange {
            low: (target * (Decimal::ONE - tolerance)).round_dp(TARGET_SCALE),
            high: (target * (Decimal::ONE + tolerance)).round_dp(TARGET_SCALE),
        }
    }

    pub fn contains(&self, load: Decimal) -> bool {
        load >= self.low && load <= self.high
    }
}

/// One microcycle of the plan, `[start, end)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanBlock {
    pub index: u32,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub target: Decimal,
    pub range: TargetRange,
    pub emphasis: Emphasis,

    /// Target as seeded, before any adaptation
    pub baseline_target: Decimal,
    pub baseline_emphasis: Emphasis,

    /// Incremented on every mutation of this block
    pub revision: u32,
}

impl PlanBlock {
    pub fn length_days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date < self.end
    }

    /// Mutable only while it has not started
    pub fn is_future(&self, as_of: NaiveDate) -> bool {
        self.start > as_of
    }

    /// Days of the block elapsed through `as_of` inclusive
    pub fn elapsed_days(&self, as_of: NaiveDate) -> i64 {
        ((as_of - self.start).num_days() + 1).clamp(0, self.length_days())
    }

    /// Target scaled to the first `days` days of the block
    pub fn prorated_target(&self, days: i64) -> Decimal {
        let length = self.length_days();
        if length <= 0 || days >= length {
            return self.target;
        }
        self.target * Decimal::from(days.max(0)) / Decimal::from(length)
    }
}

/// A single change to a future block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockChange {
    pub index: u32,
    pub old_target: Decimal,
    pub new_target: Decimal,
    pub old_emphasis: Emphasis,
    pub new_emphasis: Emphasis,
}

/// Ordered, contiguous block plan ending the day before the target event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingPlan {
    pub id: Uuid,
    pub athlete_id: AthleteId,
    pub target_date: NaiveDate,
    pub pattern: RecoveryPattern,
    pub blocks: Vec<PlanBlock>,

    /// Incremented once per applied adaptation
    pub revision: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrainingPlan {
    pub fn start_date(&self) -> Option<NaiveDate> {
        self.blocks.first().map(|b| b.start)
    }

    pub fn block_at(&self, date: NaiveDate) -> Option<&PlanBlock> {
        self.blocks.iter().find(|b| b.contains(date))
    }

    /// Blocks that have not started as of `as_of`
    pub fn future_blocks(&self, as_of: NaiveDate) -> impl Iterator<Item = &PlanBlock> {
        self.blocks.iter().filter(move |b| b.is_future(as_of))
    }

    /// Latest block fully elapsed by `as_of`
    pub fn last_completed_block(&self, as_of: NaiveDate) -> Option<&PlanBlock> {
        self.blocks.iter().rev().find(|b| b.end <= as_of + Duration::days(1))
    }

    pub fn total_target(&self) -> Decimal {
        self.blocks.iter().map(|b| b.target).sum()
    }

    /// Blocks must be ordered, indexed from zero and tile without gaps
    pub fn check_contiguity(&self) -> Result<(), InvariantViolation> {
        for (i, block) in self.blocks.iter().enumerate() {
            if block.index as usize != i {
                return Err(InvariantViolation::new(
                    "check_contiguity",
                    format!("block at position {} has index {}", i, block.index),
                ));
            }
            if block.end <= block.start {
                return Err(InvariantViolation::new(
                    "check_contiguity",
                    format!("block {} ends on or before its start", block.index),
                ));
            }
            if let Some(next) = self.blocks.get(i + 1) {
                if next.start != block.end {
                    return Err(InvariantViolation::new(
                        "check_contiguity",
                        format!(
                            "block {} ends {} but block {} starts {}",
                            block.index, block.end, next.index, next.start
                        ),
                    ));
                }
            }
        }
        if let Some(last) = self.blocks.last() {
            if last.end != self.target_date {
                return Err(InvariantViolation::new(
                    "check_contiguity",
                    format!("plan ends {} instead of target {}", last.end, self.target_date),
                ));
            }
        }
        Ok(())
    }

    /// Apply all changes or none. Every change must address a future block.
    pub fn apply_changes(
        &mut self,
        changes: &[BlockChange],
        as_of: NaiveDate,
        tolerance: Decimal,
    ) -> Result<(), InvariantViolation> {
        for change in changes {
            let block = self.blocks.get(change.index as usize).ok_or_else(|| {
                InvariantViolation::new(
                    "apply_changes",
                    format!("block {} does not exist", change.index),
                )
            })?;
            if !block.is_future(as_of) {
                return Err(InvariantViolation::new(
                    "apply_changes",
                    format!(
                        "block {} started {} which is not after {}",
                        block.index, block.start, as_of
                    ),
                ));
            }
        }

        if changes.is_empty() {
            return Ok(());
        }

        for change in changes {
            if let Some(block) = self.blocks.get_mut(change.index as usize) {
                block.target = change.new_target;
                block.range = TargetRange::around(change.new_target, tolerance);
                block.emphasis = change.new_emphasis;
                block.revision += 1;
            }
        }
        self.revision += 1;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Macro-pattern layout and target generation
pub struct PeriodizationPlanner;

impl PeriodizationPlanner {
    /// Seed a plan tiling `[target − n × len, target)` from the current chronic load
    pub fn seed(
        profile: &AthleteProfile,
        chronic: Decimal,
        as_of: NaiveDate,
    ) -> Result<TrainingPlan, PlanError> {
        let policy = &profile.plan_policy;
        policy.validate().map_err(PlanError::InvalidPolicy)?;

        let target_date = profile
            .target_event_date
            .ok_or_else(|| PlanError::MissingTargetDate(profile.athlete_id.clone()))?;

        let len = i64::from(policy.block_length_days);
        let lead_days = (target_date - as_of).num_days();
        let block_count = if lead_days > 0 { lead_days / len } else { 0 };
        if block_count < i64::from(policy.min_lead_blocks) {
            return Err(PlanError::InsufficientLeadTime {
                as_of,
                target_date,
                min_days: i64::from(policy.min_lead_blocks) * len,
            });
        }

        let pattern = RecoveryPattern::new(policy.builds_per_cycle);
        let emphases = Self::layout(block_count as u32, policy);
        let cap = profile.availability.load_cap(policy.block_length_days);
        let first_build = Self::first_build_target(chronic, policy);
        let targets = Self::project_targets(&emphases, first_build, None, policy, cap);

        let start = target_date - Duration::days(block_count * len);
        let blocks: Vec<PlanBlock> = emphases
            .iter()
            .zip(targets)
            .enumerate()
            .map(|(i, (emphasis, target))| {
                let block_start = start + Duration::days(i as i64 * len);
                PlanBlock {
                    index: i as u32,
                    start: block_start,
                    end: block_start + Duration::days(len),
                    target,
                    range: TargetRange::around(target, policy.tolerance_pct),
                    emphasis: *emphasis,
                    baseline_target: target,
                    baseline_emphasis: *emphasis,
                    revision: 0,
                }
            })
            .collect();

        let now = Utc::now();
        let plan = TrainingPlan {
            id: Uuid::new_v4(),
            athlete_id: profile.athlete_id.clone(),
            target_date,
            pattern,
            blocks,
            revision: 0,
            created_at: now,
            updated_at: now,
        };
        plan.check_contiguity()?;

        tracing::info!(
            athlete_id = %plan.athlete_id,
            plan_id = %plan.id,
            blocks = plan.blocks.len(),
            start = %start,
            target_date = %target_date,
            first_target = %first_build,
            "Seeded training plan"
        );

        Ok(plan)
    }

    /// Build target for the first block: one block of chronic load, or the policy default
    pub fn first_build_target(chronic: Decimal, policy: &PlanPolicy) -> Decimal {
        if chronic > Decimal::ZERO {
            (chronic * Decimal::from(policy.block_length_days)).round_dp(TARGET_SCALE)
        } else {
            policy.initial_block_target
        }
    }

    /// Taper block count for a plan of `block_count` blocks
    pub fn taper_blocks(block_count: u32, policy: &PlanPolicy) -> u32 {
        let wanted = policy
            .taper_blocks
            .map(u32::from)
            .unwrap_or(if block_count >= 6 { 2 } else { 1 });
        wanted.min(block_count.saturating_sub(1))
    }

    /// Emphasis per block: repeating builds and recovery, then taper
    pub fn layout(block_count: u32, policy: &PlanPolicy) -> Vec<Emphasis> {
        let pattern = RecoveryPattern::new(policy.builds_per_cycle);
        let taper = Self::taper_blocks(block_count, policy);
        let pre_taper = block_count - taper;

        let mut emphases: Vec<Emphasis> = (0..pre_taper)
            .map(|i| {
                if pattern.is_recovery(i) {
                    Emphasis::Recover
                } else {
                    Emphasis::Build
                }
            })
            .collect();

        if let Some(peak) = emphases.iter().rposition(|e| *e == Emphasis::Build) {
            emphases[peak] = Emphasis::Peak;
        }
        emphases.extend((0..taper).map(|_| Emphasis::Taper));
        emphases
    }

    /// Targets for a run of blocks.
    ///
    /// Builds step up by `step_pct` from `previous_build` (or start at
    /// `first_build`), capped by `cap`. Recovery and taper blocks are derived
    /// from the most recent build.
    pub fn project_targets(
        emphases: &[Emphasis],
        first_build: Decimal,
        previous_build: Option<Decimal>,
        policy: &PlanPolicy,
        cap: Option<Decimal>,
    ) -> Vec<Decimal> {
        let capped = |value: Decimal| match cap {
            Some(limit) => value.min(limit),
            None => value,
        };

        let mut last_build = previous_build;
        let mut taper_step = 0u32;
        let mut targets = Vec::with_capacity(emphases.len());

        for emphasis in emphases {
            let target = match emphasis {
                Emphasis::Build | Emphasis::Peak => {
                    let next = match last_build {
                        Some(prev) => prev * (Decimal::ONE + policy.step_pct),
                        None => first_build,
                    };
                    // Truncate so rounding never pushes a step past step_pct
                    let next = capped(next).round_dp_with_strategy(TARGET_SCALE, RoundingStrategy::ToZero);
                    last_build = Some(next);
                    next
                }
                Emphasis::Recover => {
                    capped(last_build.unwrap_or(first_build) * policy.recovery_factor)
                        .round_dp(TARGET_SCALE)
                }
                Emphasis::Taper => {
                    taper_step += 1;
                    let mut factor = Decimal::ONE;
                    for _ in 0..taper_step {
                        factor *= policy.taper_factor;
                    }
                    capped(last_build.unwrap_or(first_build) * factor).round_dp(TARGET_SCALE)
                }
            };
            targets.push(target.max(dec!(0)));
        }

        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Availability;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn profile_with_target(target: NaiveDate) -> AthleteProfile {
        let mut profile = AthleteProfile::new("athlete-1");
        profile.target_event_date = Some(target);
        profile.plan_policy.initial_block_target = dec!(100);
        profile
    }

    #[test]
    fn test_recovery_pattern_parsing() {
        assert_eq!("3:1".parse::<RecoveryPattern>().unwrap(), RecoveryPattern::new(3));
        assert_eq!("3:1".parse::<RecoveryPattern>().unwrap().cycle_length(), 4);
        assert_eq!("2:1".parse::<RecoveryPattern>().unwrap().build_blocks, 2);
        assert!("3:2".parse::<RecoveryPattern>().is_err());
        assert!("block".parse::<RecoveryPattern>().is_err());
        assert_eq!(RecoveryPattern::new(4).to_string(), "4:1");
    }

    #[test]
    fn test_eight_week_plan_targets() {
        let profile = profile_with_target(date(2024, 2, 26));
        let plan = PeriodizationPlanner::seed(&profile, Decimal::ZERO, date(2024, 1, 1)).unwrap();

        let emphases: Vec<Emphasis> = plan.blocks.iter().map(|b| b.emphasis).collect();
        assert_eq!(
            emphases,
            vec![
                Emphasis::Build,
                Emphasis::Build,
                Emphasis::Build,
                Emphasis::Recover,
                Emphasis::Build,
                Emphasis::Peak,
                Emphasis::Taper,
                Emphasis::Taper,
            ]
        );

        let targets: Vec<Decimal> = plan.blocks.iter().map(|b| b.target).collect();
        assert_eq!(targets[0], dec!(100));
        assert_eq!(targets[1], dec!(110));
        assert_eq!(targets[2], dec!(121));
        assert_eq!(targets[3], dec!(96.80));
        assert_eq!(targets[4], dec!(133.10));
        assert_eq!(targets[5], dec!(146.41));
        assert!(targets[6] < targets[5]);
        assert!(targets[7] < targets[6]);

        assert_eq!(plan.start_date(), Some(date(2024, 1, 1)));
        assert_eq!(plan.blocks[7].end, date(2024, 2, 26));
        assert_eq!(plan.blocks[0].range, TargetRange { low: dec!(85.00), high: dec!(115.00) });
        assert!(plan.check_contiguity().is_ok());
    }

    #[test]
    fn test_plan_tiles_back_from_target() {
        // 17 days at 7-day blocks: two blocks, first starts three days out
        let profile = profile_with_target(date(2024, 1, 18));
        let plan = PeriodizationPlanner::seed(&profile, Decimal::ZERO, date(2024, 1, 1)).unwrap();

        assert_eq!(plan.blocks.len(), 2);
        assert_eq!(plan.blocks[0].start, date(2024, 1, 4));
        assert_eq!(plan.blocks[1].emphasis, Emphasis::Taper);
        assert_eq!(plan.blocks[0].emphasis, Emphasis::Peak);
    }

    #[test]
    fn test_insufficient_lead_time() {
        let profile = profile_with_target(date(2024, 1, 5));
        let err = PeriodizationPlanner::seed(&profile, Decimal::ZERO, date(2024, 1, 1)).unwrap_err();
        assert!(matches!(err, PlanError::InsufficientLeadTime { min_days: 7, .. }));

        let past = profile_with_target(date(2023, 12, 1));
        assert!(PeriodizationPlanner::seed(&past, Decimal::ZERO, date(2024, 1, 1)).is_err());

        let mut none = AthleteProfile::new("athlete-1");
        none.target_event_date = None;
        assert!(matches!(
            PeriodizationPlanner::seed(&none, Decimal::ZERO, date(2024, 1, 1)),
            Err(PlanError::MissingTargetDate(_))
        ));
    }

    #[test]
    fn test_first_build_from_chronic() {
        let policy = PlanPolicy::default();
        assert_eq!(PeriodizationPlanner::first_build_target(dec!(20), &policy), dec!(140));
        assert_eq!(
            PeriodizationPlanner::first_build_target(Decimal::ZERO, &policy),
            policy.initial_block_target
        );
    }

    #[test]
    fn test_build_steps_round_toward_zero() {
        let policy = PlanPolicy::default();
        let emphases = [Emphasis::Build, Emphasis::Build, Emphasis::Build];
        let targets = PeriodizationPlanner::project_targets(&emphases, dec!(106.05), None, &policy, None);

        assert_eq!(targets, vec![dec!(106.05), dec!(116.65), dec!(128.31)]);
        for pair in targets.windows(2) {
            assert!(pair[1] <= pair[0] * dec!(1.10));
        }
    }

    #[test]
    fn test_availability_caps_builds() {
        let mut profile = profile_with_target(date(2024, 2, 26));
        profile.availability = Availability {
            max_weekly_hours: Some(dec!(1.2)),
            training_days_per_week: 5,
        };
        let plan = PeriodizationPlanner::seed(&profile, Decimal::ZERO, date(2024, 1, 1)).unwrap();

        for block in &plan.blocks {
            assert!(block.target <= dec!(120), "block {} over cap", block.index);
        }
        assert_eq!(plan.blocks[2].target, dec!(120));
    }

    #[test]
    fn test_apply_changes_rejects_started_block() {
        let profile = profile_with_target(date(2024, 2, 26));
        let mut plan = PeriodizationPlanner::seed(&profile, Decimal::ZERO, date(2024, 1, 1)).unwrap();
        let before = plan.clone();

        let change = BlockChange {
            index: 0,
            old_target: dec!(100),
            new_target: dec!(80),
            old_emphasis: Emphasis::Build,
            new_emphasis: Emphasis::Recover,
        };
        let err = plan.apply_changes(&[change], date(2024, 1, 3), dec!(0.15)).unwrap_err();
        assert_eq!(err.operation, "apply_changes");
        assert_eq!(plan, before);
    }

    #[test]
    fn test_apply_changes_bumps_revisions() {
        let profile = profile_with_target(date(2024, 2, 26));
        let mut plan = PeriodizationPlanner::seed(&profile, Decimal::ZERO, date(2024, 1, 1)).unwrap();

        let change = BlockChange {
            index: 1,
            old_target: dec!(110),
            new_target: dec!(80),
            old_emphasis: Emphasis::Build,
            new_emphasis: Emphasis::Recover,
        };
        plan.apply_changes(&[change], date(2024, 1, 7), dec!(0.15)).unwrap();

        assert_eq!(plan.revision, 1);
        assert_eq!(plan.blocks[1].revision, 1);
        assert_eq!(plan.blocks[1].target, dec!(80));
        assert_eq!(plan.blocks[1].baseline_target, dec!(110));
        assert_eq!(plan.blocks[2].revision, 0);
    }

    #[test]
    fn test_prorated_target() {
        let profile = profile_with_target(date(2024, 2, 26));
        let plan = PeriodizationPlanner::seed(&profile, Decimal::ZERO, date(2024, 1, 1)).unwrap();
        let block = &plan.blocks[1];

        assert_eq!(block.elapsed_days(date(2024, 1, 10)), 3);
        assert_eq!(block.prorated_target(7), dec!(110));
        assert_eq!(block.prorated_target(0), Decimal::ZERO);
    }

    proptest! {
        #[test]
        fn test_builds_are_monotonic_and_bounded(
            lead_days in 7i64..400,
            chronic_cents in 0u32..12_000,
            builds in 1u8..5,
        ) {
            let as_of = date(2024, 1, 1);
            let mut profile = profile_with_target(as_of + Duration::days(lead_days));
            profile.plan_policy.builds_per_cycle = builds;
            let chronic = Decimal::new(i64::from(chronic_cents), 2);
            let plan = PeriodizationPlanner::seed(&profile, chronic, as_of).unwrap();
            let step = profile.plan_policy.step_pct;

            prop_assert!(plan.check_contiguity().is_ok());
            prop_assert_eq!(plan.blocks.len() as i64, lead_days / 7);
            prop_assert!(plan.blocks[0].start >= as_of);

            let progressive: Vec<Decimal> = plan
                .blocks
                .iter()
                .filter(|b| b.emphasis.is_progressive())
                .map(|b| b.target)
                .collect();
            for pair in progressive.windows(2) {
                prop_assert!(pair[1] >= pair[0]);
                prop_assert!(pair[1] <= pair[0] * (Decimal::ONE + step));
            }
            for block in plan.blocks.iter().filter(|b| !b.emphasis.is_progressive()) {
                prop_assert!(block.target < plan.blocks.iter().map(|b| b.target).max().unwrap_or(Decimal::ZERO)
                    || plan.blocks.len() == 1);
            }
        }
    }
}
