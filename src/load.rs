//! Activity load calculation
//!
//! Load is intensity-weighted duration: each reading's intensity ratio against
//! the athlete threshold is squared and multiplied by the seconds it holds for.
//! One hour at threshold scores 100, split across local calendar dates.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::LoadError;
use crate::models::{Activity, AthleteProfile, LoadSample, MetricType};

/// Load accrued by one hour at threshold
const LOAD_PER_THRESHOLD_HOUR: Decimal = dec!(100);

/// Load per hour above which a computation is logged as implausible
const PLAUSIBLE_LOAD_PER_HOUR: Decimal = dec!(300);

/// Decimal places kept on per-date loads
const LOAD_SCALE: u32 = 4;

/// Intensity ratio from which time counts as moderate intensity minutes
const MODERATE_RATIO: Decimal = dec!(0.65);

/// Intensity ratio from which time counts double
const VIGOROUS_RATIO: Decimal = dec!(0.85);

/// Load computation result for one activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadComputation {
    pub activity_id: String,
    pub athlete_id: String,

    /// Metric the load was derived from
    pub metric: MetricType,

    /// Load of the primary metric, summed over all dates
    pub total_load: Decimal,

    /// Primary-metric load split by local calendar date
    pub daily_loads: BTreeMap<NaiveDate, Decimal>,

    /// Time-weighted mean intensity ratio of the primary metric
    pub intensity_factor: Decimal,

    /// Moderate minutes plus twice the vigorous minutes of the primary metric
    pub intensity_minutes: Decimal,

    /// Load per metric for every metric with a threshold
    pub per_metric: BTreeMap<MetricType, Decimal>,

    /// Metrics present in the activity but lacking a threshold
    pub skipped_metrics: Vec<MetricType>,
}

impl LoadComputation {
    /// True if some metric could not be used for lack of a threshold
    pub fn is_partial(&self) -> bool {
        !self.skipped_metrics.is_empty()
    }

    /// One load sample per date touched by the activity
    pub fn to_load_samples(&self) -> Vec<LoadSample> {
        self.daily_loads
            .iter()
            .map(|(date, load)| LoadSample {
                athlete_id: self.athlete_id.clone(),
                date: *date,
                load: *load,
                activity_ids: vec![self.activity_id.clone()],
            })
            .collect()
    }
}

/// Per-metric accumulation before scaling
struct MetricAccumulator {
    /// Σ ratio² × seconds, per date
    weighted_seconds: BTreeMap<NaiveDate, Decimal>,
    /// Σ ratio × seconds
    ratio_seconds: Decimal,
    seconds: u64,
    moderate_seconds: u64,
    vigorous_seconds: u64,
}

/// Core load calculation engine
pub struct LoadCalculator;

impl LoadCalculator {
    /// Calculate the load of an activity using the best available metric
    ///
    /// load = Σ intensity_factor(ratio) × Δt, scaled so one hour at threshold is 100.
    /// Metrics without a threshold are skipped and reported; the call only fails
    /// when no metric in the activity is usable.
    pub fn calculate(activity: &Activity, profile: &AthleteProfile) -> Result<LoadComputation, LoadError> {
        if activity.athlete_id != profile.athlete_id {
            return Err(LoadError::AthleteMismatch {
                activity_id: activity.id.clone(),
                activity_athlete: activity.athlete_id.clone(),
                profile_athlete: profile.athlete_id.clone(),
            });
        }

        let present = activity.metrics_present();
        let mut per_metric = BTreeMap::new();
        let mut accumulators = BTreeMap::new();
        let mut skipped_metrics = Vec::new();

        for metric in &present {
            match profile.thresholds.get(*metric) {
                Some(threshold) => {
                    let acc = Self::accumulate(activity, *metric, threshold, profile.resting_hr);
                    let total: Decimal = Self::scale(&acc.weighted_seconds).values().sum();
                    per_metric.insert(*metric, total);
                    accumulators.insert(*metric, acc);
                }
                None => skipped_metrics.push(*metric),
            }
        }

        let metric = MetricType::PRIORITY
            .iter()
            .copied()
            .find(|m| accumulators.contains_key(m))
            .ok_or_else(|| LoadError::MissingThreshold {
                activity_id: activity.id.clone(),
                metrics: present.iter().copied().collect(),
            })?;

        let primary = &accumulators[&metric];
        let daily_loads = Self::scale(&primary.weighted_seconds);
        let total_load: Decimal = daily_loads.values().sum();
        let intensity_factor = if primary.seconds > 0 {
            (primary.ratio_seconds / Decimal::from(primary.seconds)).round_dp(LOAD_SCALE)
        } else {
            Decimal::ZERO
        };
        let intensity_minutes = (Decimal::from(primary.moderate_seconds + 2 * primary.vigorous_seconds)
            / dec!(60))
        .round_dp(2);

        if !Self::is_plausible(total_load, activity.duration_seconds) {
            tracing::warn!(
                activity_id = %activity.id,
                load = %total_load,
                duration_seconds = activity.duration_seconds,
                "Load is unusually high for the activity duration"
            );
        }

        Ok(LoadComputation {
            activity_id: activity.id.clone(),
            athlete_id: activity.athlete_id.clone(),
            metric,
            total_load,
            daily_loads,
            intensity_factor,
            intensity_minutes,
            per_metric,
            skipped_metrics,
        })
    }

    /// Intensity ratio of a single reading against the athlete threshold
    ///
    /// Power: value / FTP. Pace: threshold / value (faster is harder).
    /// Heart rate: heart-rate reserve fraction when a resting HR is known.
    pub fn intensity_ratio(
        metric: MetricType,
        value: Decimal,
        threshold: Decimal,
        resting_hr: Option<u16>,
    ) -> Decimal {
        match metric {
            MetricType::Power => value / threshold,
            MetricType::Pace => {
                if value.is_zero() {
                    Decimal::ZERO
                } else {
                    threshold / value
                }
            }
            MetricType::HeartRate => match resting_hr.map(Decimal::from) {
                Some(rest) if threshold > rest => ((value - rest) / (threshold - rest)).max(Decimal::ZERO),
                _ => value / threshold,
            },
        }
    }

    /// Convex, monotonic weighting of an intensity ratio
    pub fn intensity_factor(ratio: Decimal) -> Decimal {
        ratio * ratio
    }

    /// Sanity check against the duration
    pub fn is_plausible(load: Decimal, duration_seconds: u32) -> bool {
        let hours = Decimal::from(duration_seconds) / dec!(3600);
        load >= Decimal::ZERO && load <= hours * PLAUSIBLE_LOAD_PER_HOUR
    }

    fn accumulate(
        activity: &Activity,
        metric: MetricType,
        threshold: Decimal,
        resting_hr: Option<u16>,
    ) -> MetricAccumulator {
        let samples: Vec<_> = activity.samples_for(metric).collect();
        let mut acc = MetricAccumulator {
            weighted_seconds: BTreeMap::new(),
            ratio_seconds: Decimal::ZERO,
            seconds: 0,
            moderate_seconds: 0,
            vigorous_seconds: 0,
        };

        // Each reading holds until the next reading of the same metric
        for (i, sample) in samples.iter().enumerate() {
            let end = samples
                .get(i + 1)
                .map(|next| next.offset_seconds)
                .unwrap_or(activity.duration_seconds);
            let span = end.saturating_sub(sample.offset_seconds);
            if span == 0 {
                continue;
            }

            let ratio = Self::intensity_ratio(metric, sample.value, threshold, resting_hr);
            let factor = Self::intensity_factor(ratio);
            let start = activity.local_start + Duration::seconds(i64::from(sample.offset_seconds));

            for (date, seconds) in Self::split_by_date(start, span) {
                *acc.weighted_seconds.entry(date).or_insert(Decimal::ZERO) +=
                    factor * Decimal::from(seconds);
            }
            acc.ratio_seconds += ratio * Decimal::from(span);
            acc.seconds += u64::from(span);
            if ratio >= VIGOROUS_RATIO {
                acc.vigorous_seconds += u64::from(span);
            } else if ratio >= MODERATE_RATIO {
                acc.moderate_seconds += u64::from(span);
            }
        }

        acc
    }

    /// Split a span starting at `start` into per-date second counts
    fn split_by_date(start: NaiveDateTime, span: u32) -> Vec<(NaiveDate, u32)> {
        let mut parts = Vec::new();
        let mut cursor = start;
        let mut remaining = i64::from(span);

        while remaining > 0 {
            let date = cursor.date();
            let until_midnight = date
                .succ_opt()
                .and_then(|next| next.and_hms_opt(0, 0, 0))
                .map(|midnight| (midnight - cursor).num_seconds())
                .unwrap_or(remaining);
            let chunk = remaining.min(until_midnight.max(1));
            parts.push((date, chunk as u32));
            cursor += Duration::seconds(chunk);
            remaining -= chunk;
        }

        parts
    }

    fn scale(weighted_seconds: &BTreeMap<NaiveDate, Decimal>) -> BTreeMap<NaiveDate, Decimal> {
        weighted_seconds
            .iter()
            .map(|(date, ws)| (*date, (*ws * LOAD_PER_THRESHOLD_HOUR / dec!(3600)).round_dp(LOAD_SCALE)))
            .collect()
    }
}
