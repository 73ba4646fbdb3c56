use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Athlete identifier as handed over by the profile store
pub type AthleteId = String;

/// Intensity metric carried by an activity sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    HeartRate,
    Power,
    Pace,
}

impl MetricType {
    /// Preference order when an activity carries several metrics
    pub const PRIORITY: [MetricType; 3] = [MetricType::Power, MetricType::Pace, MetricType::HeartRate];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::HeartRate => "heart_rate",
            MetricType::Power => "power",
            MetricType::Pace => "pace",
        }
    }

    /// Physiological bounds accepted by the normalizer (inclusive)
    pub fn bounds(&self) -> (Decimal, Decimal) {
        match self {
            // bpm
            MetricType::HeartRate => (dec!(20), dec!(300)),
            // watts
            MetricType::Power => (dec!(0), dec!(3000)),
            // seconds per kilometre
            MetricType::Pace => (dec!(60), dec!(3600)),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "heart_rate" | "heartrate" | "hr" => Ok(MetricType::HeartRate),
            "power" | "watts" => Ok(MetricType::Power),
            "pace" | "speed_pace" => Ok(MetricType::Pace),
            _ => Err(format!("Unknown metric type: {}", s)),
        }
    }
}

/// Single intensity reading inside an activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Seconds from activity start
    pub offset_seconds: u32,

    pub metric: MetricType,

    /// bpm, watts or seconds per kilometre depending on `metric`
    pub value: Decimal,
}

/// Normalized activity. Never mutated; a corrected upload supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    /// Upstream activity identifier
    pub id: String,

    pub athlete_id: AthleteId,

    /// Start instant in UTC
    pub start_time: DateTime<Utc>,

    /// Start in the athlete's local time, used for calendar attribution
    pub local_start: NaiveDateTime,

    /// Upstream activity type ("running", "cycling", ...)
    pub activity_type: Option<String>,

    /// Upstream correction counter; higher revisions supersede lower ones
    pub revision: u32,

    /// Duration in seconds, always positive
    pub duration_seconds: u32,

    /// Samples ordered by offset
    pub samples: Vec<MetricSample>,
}

impl Activity {
    /// Calendar date the activity started on
    pub fn local_date(&self) -> NaiveDate {
        self.local_start.date()
    }

    /// Metric types that have at least one sample
    pub fn metrics_present(&self) -> BTreeSet<MetricType> {
        self.samples.iter().map(|s| s.metric).collect()
    }

    /// Samples of one metric in offset order
    pub fn samples_for(&self, metric: MetricType) -> impl Iterator<Item = &MetricSample> {
        self.samples.iter().filter(move |s| s.metric == metric)
    }
}

/// Derived load attributed to one athlete on one date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSample {
    pub athlete_id: AthleteId,
    pub date: NaiveDate,
    pub load: Decimal,

    /// Activities contributing to this date
    pub activity_ids: Vec<String>,
}

/// Threshold per metric type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Lactate threshold heart rate (bpm)
    pub heart_rate: Option<Decimal>,

    /// Functional threshold power (watts)
    pub power: Option<Decimal>,

    /// Threshold pace (seconds per kilometre)
    pub pace: Option<Decimal>,
}

impl Thresholds {
    pub fn get(&self, metric: MetricType) -> Option<Decimal> {
        let value = match metric {
            MetricType::HeartRate => self.heart_rate,
            MetricType::Power => self.power,
            MetricType::Pace => self.pace,
        };
        value.filter(|v| *v > Decimal::ZERO)
    }
}

/// Weekly availability constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Availability {
    /// Upper bound on training hours per 7 days
    pub max_weekly_hours: Option<Decimal>,

    pub training_days_per_week: u8,
}

impl Default for Availability {
    fn default() -> Self {
        Availability {
            max_weekly_hours: None,
            training_days_per_week: 6,
        }
    }
}

impl Availability {
    /// Maximum load a block of `days` can carry, assuming threshold effort (100 per hour)
    pub fn load_cap(&self, days: u16) -> Option<Decimal> {
        self.max_weekly_hours
            .map(|hours| hours * dec!(100) * Decimal::from(days) / dec!(7))
    }
}

/// Plan and aggregation policy owned by the athlete profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanPolicy {
    /// Maximum build-over-build increase (0.10 = 10%)
    pub step_pct: Decimal,

    /// Accepted deviation around a block target (0.15 = ±15%)
    pub tolerance_pct: Decimal,

    /// Acute EWMA window in days
    pub acute_window_days: u16,

    /// Chronic EWMA window in days
    pub chronic_window_days: u16,

    /// Microcycle length in days
    pub block_length_days: u16,

    /// Build blocks before each recovery block
    pub builds_per_cycle: u8,

    /// Recovery target relative to the preceding build
    pub recovery_factor: Decimal,

    /// Taper block count; derived from plan length when unset
    pub taper_blocks: Option<u8>,

    /// Per-block reduction applied to the peak target during taper
    pub taper_factor: Decimal,

    /// Acute:chronic ratio treated as overreach regardless of block deviation
    pub overreach_ratio: Decimal,

    /// Overreach magnitude that extends recovery by a second block
    pub severe_overreach: Decimal,

    /// Elapsed days before an in-progress block is evaluated
    pub min_block_progress_days: u16,

    /// Chronic load at or below which the ratio is undefined
    pub ratio_min_chronic: Decimal,

    /// Contributing days required before the ratio is defined
    pub ratio_min_samples: u16,

    /// Days of load history before the ratio can trigger overreach on its own
    pub ratio_min_history_days: u16,

    /// First build target when there is no chronic load yet
    pub initial_block_target: Decimal,

    /// Days of raw samples kept for replay
    pub retention_days: u16,

    /// Minimum number of whole blocks before the target event
    pub min_lead_blocks: u16,
}

impl Default for PlanPolicy {
    fn default() -> Self {
        PlanPolicy {
            step_pct: dec!(0.10),
            tolerance_pct: dec!(0.15),
            acute_window_days: 7,
            chronic_window_days: 28,
            block_length_days: 7,
            builds_per_cycle: 3,
            recovery_factor: dec!(0.8),
            taper_blocks: None,
            taper_factor: dec!(0.7),
            overreach_ratio: dec!(1.5),
            severe_overreach: dec!(0.3),
            min_block_progress_days: 3,
            ratio_min_chronic: Decimal::ZERO,
            ratio_min_samples: 2,
            ratio_min_history_days: 28,
            initial_block_target: dec!(200),
            retention_days: 56,
            min_lead_blocks: 1,
        }
    }
}

impl PlanPolicy {
    /// Check the policy is internally consistent
    pub fn validate(&self) -> Result<(), String> {
        if self.acute_window_days == 0 || self.chronic_window_days == 0 {
            return Err("EWMA windows must be at least one day".to_string());
        }
        if self.acute_window_days > self.chronic_window_days {
            return Err(format!(
                "acute window ({}) longer than chronic window ({})",
                self.acute_window_days, self.chronic_window_days
            ));
        }
        if self.block_length_days == 0 {
            return Err("block_length_days must be positive".to_string());
        }
        if self.step_pct <= Decimal::ZERO || self.step_pct > Decimal::ONE {
            return Err(format!("step_pct must be in (0, 1], got {}", self.step_pct));
        }
        if self.tolerance_pct < Decimal::ZERO || self.tolerance_pct >= Decimal::ONE {
            return Err(format!("tolerance_pct must be in [0, 1), got {}", self.tolerance_pct));
        }
        if self.recovery_factor <= Decimal::ZERO || self.recovery_factor >= Decimal::ONE {
            return Err(format!("recovery_factor must be in (0, 1), got {}", self.recovery_factor));
        }
        if self.taper_factor <= Decimal::ZERO || self.taper_factor >= Decimal::ONE {
            return Err(format!("taper_factor must be in (0, 1), got {}", self.taper_factor));
        }
        if self.builds_per_cycle == 0 {
            return Err("builds_per_cycle must be at least 1".to_string());
        }
        if self.initial_block_target <= Decimal::ZERO {
            return Err("initial_block_target must be positive".to_string());
        }
        if self.min_lead_blocks == 0 {
            return Err("min_lead_blocks must be at least 1".to_string());
        }
        if self.retention_days < self.chronic_window_days || self.retention_days < self.block_length_days {
            return Err(format!(
                "retention_days ({}) must cover the chronic window and one block",
                self.retention_days
            ));
        }
        Ok(())
    }
}

/// Athlete profile snapshot. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AthleteProfile {
    pub athlete_id: AthleteId,

    #[serde(default)]
    pub thresholds: Thresholds,

    /// Resting heart rate; enables heart-rate-reserve intensity
    #[serde(default)]
    pub resting_hr: Option<u16>,

    #[serde(default)]
    pub max_hr: Option<u16>,

    /// Date of the goal event
    #[serde(default)]
    pub target_event_date: Option<NaiveDate>,

    #[serde(default)]
    pub availability: Availability,

    #[serde(default)]
    pub plan_policy: PlanPolicy,
}

impl AthleteProfile {
    /// Profile with default policy and no thresholds
    pub fn new(athlete_id: impl Into<AthleteId>) -> Self {
        AthleteProfile {
            athlete_id: athlete_id.into(),
            thresholds: Thresholds::default(),
            resting_hr: None,
            max_hr: None,
            target_event_date: None,
            availability: Availability::default(),
            plan_policy: PlanPolicy::default(),
        }
    }
}
