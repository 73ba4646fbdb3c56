use chrono::{Duration, NaiveDate, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use trainload::aggregate::{LoadAggregator, LoadContribution, WindowConfig};
use trainload::batch::{BatchConfig, BatchProcessor};
use trainload::load::LoadCalculator;
use trainload::models::{AthleteProfile, MetricType};
use trainload::normalize::{ActivityNormalizer, RawActivity, RawSample};
use trainload::training_plan::PeriodizationPlanner;

/// Performance benchmarks for load aggregation and planning
///
/// Replays and batch rebuilds are measured over growing logs to keep the
/// per-day fold cost linear.

fn start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
}

fn create_benchmark_athlete(id: &str) -> AthleteProfile {
    let mut profile = AthleteProfile::new(id);
    profile.thresholds.power = Some(dec!(250));
    profile.thresholds.heart_rate = Some(dec!(168));
    profile.resting_hr = Some(48);
    profile.target_event_date = Some(start() + Duration::days(364));
    profile.plan_policy.retention_days = 400;
    profile
}

fn create_raw_activity(athlete: &str, index: i64, seconds: i64) -> RawActivity {
    let day = start() + Duration::days(index);
    RawActivity {
        activity_id: Some(format!("{}-{}", athlete, index)),
        athlete_id: Some(athlete.to_string()),
        start_time: Some(Utc.from_utc_datetime(&day.and_hms_opt(6, 0, 0).unwrap())),
        duration_seconds: Some(seconds),
        samples: (0..seconds)
            .step_by(5)
            .flat_map(|t| {
                let watts = 180.0 + ((t / 60) % 20) as f64 * 5.0;
                [
                    RawSample::new(t, MetricType::Power, watts),
                    RawSample::new(t, MetricType::HeartRate, 130.0 + (t % 30) as f64),
                ]
            })
            .collect(),
        ..RawActivity::default()
    }
}

fn create_contributions(days: i64) -> Vec<LoadContribution> {
    (0..days)
        .map(|i| LoadContribution {
            athlete_id: "bench".to_string(),
            activity_id: format!("c{}", i),
            revision: 0,
            date: start() + Duration::days(i),
            load: Decimal::from(40 + (i * 17) % 90),
        })
        .collect()
}

fn bench_load_calculation(c: &mut Criterion) {
    let athlete = create_benchmark_athlete("bench");
    let mut group = c.benchmark_group("Load Calculation");

    // 30 minutes to 4 hours
    for &seconds in &[1800i64, 3600, 7200, 14400] {
        let activity = ActivityNormalizer::normalize(&create_raw_activity("bench", 0, seconds)).unwrap();

        group.throughput(Throughput::Elements(activity.samples.len() as u64));
        group.bench_with_input(BenchmarkId::new("calculate", seconds), &activity, |b, activity| {
            b.iter(|| LoadCalculator::calculate(black_box(activity), &athlete));
        });
    }

    group.finish();
}

fn bench_incremental_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("Incremental Ingest");

    for &days in &[30i64, 90, 365] {
        let contributions = create_contributions(days);
        let config = WindowConfig {
            retention_days: 400,
            ..WindowConfig::default()
        };

        group.throughput(Throughput::Elements(days as u64));
        group.bench_with_input(BenchmarkId::new("in_order", days), &contributions, |b, contributions| {
            b.iter(|| {
                let mut agg = LoadAggregator::new("bench", config.clone());
                for contribution in contributions {
                    let _ = agg.ingest(contribution.clone());
                }
                agg.window()
            });
        });
    }

    group.finish();
}

fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("Replay");

    for &days in &[90i64, 365] {
        let config = WindowConfig {
            retention_days: 400,
            ..WindowConfig::default()
        };
        let mut agg = LoadAggregator::new("bench", config);
        for contribution in create_contributions(days) {
            let _ = agg.ingest(contribution);
        }

        group.throughput(Throughput::Elements(days as u64));
        group.bench_with_input(BenchmarkId::new("replay_now", days), &agg, |b, agg| {
            b.iter(|| {
                let mut agg = agg.clone();
                agg.replay_now()
            });
        });
    }

    group.finish();
}

fn bench_plan_seeding(c: &mut Criterion) {
    let mut group = c.benchmark_group("Plan Seeding");
    let profile = create_benchmark_athlete("bench");

    // 4 weeks to a year of lead time
    for &lead_days in &[28i64, 112, 364] {
        let as_of = start() + Duration::days(364 - lead_days);
        group.bench_with_input(BenchmarkId::new("seed", lead_days), &as_of, |b, as_of| {
            b.iter(|| PeriodizationPlanner::seed(&profile, dec!(55), black_box(*as_of)));
        });
    }

    group.finish();
}

fn bench_batch_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("Batch Rebuild");
    group.sample_size(10);

    for &athletes in &[4usize, 16] {
        let profiles: HashMap<String, AthleteProfile> = (0..athletes)
            .map(|i| {
                let id = format!("athlete-{}", i);
                (id.clone(), create_benchmark_athlete(&id))
            })
            .collect();
        let activities: Vec<RawActivity> = profiles
            .keys()
            .flat_map(|id| (0..60).map(move |day| create_raw_activity(id, day, 1800)))
            .collect();
        let processor = BatchProcessor::new(BatchConfig::default());

        group.throughput(Throughput::Elements(athletes as u64));
        group.bench_with_input(BenchmarkId::new("rebuild", athletes), &activities, |b, activities| {
            b.iter(|| processor.rebuild(activities, &profiles));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_load_calculation,
    bench_incremental_ingest,
    bench_replay,
    bench_plan_seeding,
    bench_batch_rebuild
);
criterion_main!(benches);
