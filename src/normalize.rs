//! Activity normalization
//!
//! Turns raw activity records from the wearable collaborator into the
//! immutable `Activity` representation, or rejects them with a reason code.

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use crate::models::{Activity, MetricSample, MetricType};

/// Longest accepted activity (7 days)
pub const MAX_DURATION_SECONDS: i64 = 7 * 24 * 3600;

/// Raw activity as delivered upstream; every field may be missing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawActivity {
    pub activity_id: Option<String>,
    pub athlete_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub start_time_local: Option<NaiveDateTime>,
    pub activity_type: Option<String>,
    pub revision: Option<u32>,
    pub duration_seconds: Option<i64>,
    pub samples: Vec<RawSample>,
}

/// Raw (offset, metric, value) triple
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSample {
    pub offset_seconds: Option<i64>,
    pub metric_type: Option<String>,
    pub value: Option<f64>,
}

impl RawSample {
    pub fn new(offset_seconds: i64, metric: MetricType, value: f64) -> Self {
        RawSample {
            offset_seconds: Some(offset_seconds),
            metric_type: Some(metric.as_str().to_string()),
            value: Some(value),
        }
    }
}

/// Why an activity was rejected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectionReason {
    MissingField { field: String },
    NonPositiveDuration,
    DurationOutOfRange { seconds: i64 },
    UnknownMetric { metric: String },
    NonFiniteValue { offset_seconds: i64 },
    SamplesOutOfOrder { offset_seconds: i64, previous: i64 },
    DuplicateSample { offset_seconds: i64, metric: MetricType },
    SampleOutsideDuration { offset_seconds: i64, duration_seconds: i64 },
    NoIntensityMetric,
    OutOfPhysiologicalRange { metric: MetricType, value: Decimal, offset_seconds: i64 },
}

impl RejectionReason {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::MissingField { .. } => "missing_field",
            RejectionReason::NonPositiveDuration => "non_positive_duration",
            RejectionReason::DurationOutOfRange { .. } => "duration_out_of_range",
            RejectionReason::UnknownMetric { .. } => "unknown_metric",
            RejectionReason::NonFiniteValue { .. } => "non_finite_value",
            RejectionReason::SamplesOutOfOrder { .. } => "samples_out_of_order",
            RejectionReason::DuplicateSample { .. } => "duplicate_sample",
            RejectionReason::SampleOutsideDuration { .. } => "sample_outside_duration",
            RejectionReason::NoIntensityMetric => "no_intensity_metric",
            RejectionReason::OutOfPhysiologicalRange { .. } => "out_of_physiological_range",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::MissingField { field } => write!(f, "missing field '{}'", field),
            RejectionReason::NonPositiveDuration => write!(f, "duration must be positive"),
            RejectionReason::DurationOutOfRange { seconds } => {
                write!(f, "duration of {}s exceeds {}s", seconds, MAX_DURATION_SECONDS)
            }
            RejectionReason::UnknownMetric { metric } => write!(f, "unknown metric '{}'", metric),
            RejectionReason::NonFiniteValue { offset_seconds } => {
                write!(f, "non-finite value at {}s", offset_seconds)
            }
            RejectionReason::SamplesOutOfOrder { offset_seconds, previous } => write!(
                f,
                "sample at {}s follows sample at {}s",
                offset_seconds, previous
            ),
            RejectionReason::DuplicateSample { offset_seconds, metric } => {
                write!(f, "duplicate {} sample at {}s", metric, offset_seconds)
            }
            RejectionReason::SampleOutsideDuration { offset_seconds, duration_seconds } => write!(
                f,
                "sample at {}s lies outside the {}s activity",
                offset_seconds, duration_seconds
            ),
            RejectionReason::NoIntensityMetric => write!(f, "no heart rate, power or pace samples"),
            RejectionReason::OutOfPhysiologicalRange { metric, value, offset_seconds } => write!(
                f,
                "{} value {} at {}s is outside physiological bounds",
                metric, value, offset_seconds
            ),
        }
    }
}

/// Rejected activity with its reason code
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("activity {} rejected: {reason}", .activity_id.as_deref().unwrap_or("<unknown>"))]
pub struct InvalidActivity {
    pub activity_id: Option<String>,
    pub reason: RejectionReason,
}

/// Validates and canonicalizes raw activities
pub struct ActivityNormalizer;

impl ActivityNormalizer {
    /// Normalize one raw activity. Pure.
    pub fn normalize(raw: &RawActivity) -> Result<Activity, InvalidActivity> {
        let reject = |reason: RejectionReason| InvalidActivity {
            activity_id: raw.activity_id.clone(),
            reason,
        };

        let id = Self::required_text(raw.activity_id.as_deref(), "activity_id").map_err(reject)?;
        let athlete_id =
            Self::required_text(raw.athlete_id.as_deref(), "athlete_id").map_err(reject)?;
        let start_time = raw
            .start_time
            .ok_or_else(|| reject(Self::missing("start_time")))?;
        let duration = raw
            .duration_seconds
            .ok_or_else(|| reject(Self::missing("duration_seconds")))?;

        if duration <= 0 {
            return Err(reject(RejectionReason::NonPositiveDuration));
        }
        if duration > MAX_DURATION_SECONDS {
            return Err(reject(RejectionReason::DurationOutOfRange { seconds: duration }));
        }

        let samples = Self::normalize_samples(&raw.samples, duration).map_err(reject)?;

        Ok(Activity {
            id,
            athlete_id,
            start_time,
            local_start: raw.start_time_local.unwrap_or_else(|| start_time.naive_utc()),
            activity_type: raw
                .activity_type
                .as_ref()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty()),
            revision: raw.revision.unwrap_or(0),
            duration_seconds: duration as u32,
            samples,
        })
    }

    /// Normalize a batch, splitting accepted activities from rejections
    pub fn normalize_batch(raws: &[RawActivity]) -> (Vec<Activity>, Vec<InvalidActivity>) {
        let mut accepted = Vec::with_capacity(raws.len());
        let mut rejected = Vec::new();

        for raw in raws {
            match Self::normalize(raw) {
                Ok(activity) => accepted.push(activity),
                Err(invalid) => {
                    tracing::debug!(
                        activity_id = ?invalid.activity_id,
                        code = invalid.reason.code(),
                        "Activity rejected"
                    );
                    rejected.push(invalid);
                }
            }
        }

        (accepted, rejected)
    }

    fn missing(field: &str) -> RejectionReason {
        RejectionReason::MissingField {
            field: field.to_string(),
        }
    }

    fn required_text(value: Option<&str>, field: &str) -> Result<String, RejectionReason> {
        value
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Self::missing(field))
    }

    fn normalize_samples(raw: &[RawSample], duration: i64) -> Result<Vec<MetricSample>, RejectionReason> {
        let mut samples = Vec::with_capacity(raw.len());
        let mut previous_offset: Option<i64> = None;
        let mut metrics_at_offset: BTreeSet<MetricType> = BTreeSet::new();

        for sample in raw {
            let offset = sample
                .offset_seconds
                .ok_or_else(|| Self::missing("samples.offset_seconds"))?;
            let metric_name = sample
                .metric_type
                .as_deref()
                .ok_or_else(|| Self::missing("samples.metric_type"))?;
            let metric: MetricType = metric_name.parse().map_err(|_| RejectionReason::UnknownMetric {
                metric: metric_name.to_string(),
            })?;
            let value = sample.value.ok_or_else(|| Self::missing("samples.value"))?;

            if offset < 0 || offset > duration {
                return Err(RejectionReason::SampleOutsideDuration {
                    offset_seconds: offset,
                    duration_seconds: duration,
                });
            }

            match previous_offset {
                Some(previous) if offset < previous => {
                    return Err(RejectionReason::SamplesOutOfOrder {
                        offset_seconds: offset,
                        previous,
                    });
                }
                Some(previous) if offset == previous => {}
                _ => metrics_at_offset.clear(),
            }
            if !metrics_at_offset.insert(metric) {
                return Err(RejectionReason::DuplicateSample {
                    offset_seconds: offset,
                    metric,
                });
            }
            previous_offset = Some(offset);

            let value = Decimal::from_f64(value)
                .map(|v| v.round_dp(3))
                .ok_or(RejectionReason::NonFiniteValue { offset_seconds: offset })?;

            let (min, max) = metric.bounds();
            if value < min || value > max {
                return Err(RejectionReason::OutOfPhysiologicalRange {
                    metric,
                    value,
                    offset_seconds: offset,
                });
            }

            samples.push(MetricSample {
                offset_seconds: offset as u32,
                metric,
                value,
            });
        }

        if samples.is_empty() {
            return Err(RejectionReason::NoIntensityMetric);
        }

        Ok(samples)
    }
}
