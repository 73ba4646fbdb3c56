use chrono::{Duration, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;

use trainload::adaptation::{AdaptationEngine, Decision};
use trainload::aggregate::{IngestOutcome, LoadAggregator, WindowConfig};
use trainload::batch::{BatchConfig, BatchProcessor};
use trainload::config::EngineConfig;
use trainload::load::LoadCalculator;
use trainload::models::{AthleteProfile, MetricType};
use trainload::normalize::{ActivityNormalizer, RawActivity, RawSample};
use trainload::training_plan::{Emphasis, PeriodizationPlanner};

/// Integration tests covering the library pipeline end to end

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn hr_profile() -> AthleteProfile {
    let mut profile = AthleteProfile::new("runner");
    profile.thresholds.heart_rate = Some(dec!(170));
    profile
}

fn hr_activity(id: &str, start: NaiveDate, seconds: i64, hr: f64) -> RawActivity {
    RawActivity {
        activity_id: Some(id.to_string()),
        athlete_id: Some("runner".to_string()),
        start_time: Some(Utc.from_utc_datetime(&start.and_hms_opt(7, 0, 0).unwrap())),
        duration_seconds: Some(seconds),
        samples: (0..seconds / 60)
            .map(|i| RawSample::new(i * 60, MetricType::HeartRate, hr))
            .collect(),
        ..RawActivity::default()
    }
}

/// Normalize, compute and fold one raw activity
fn fold(agg: &mut LoadAggregator, profile: &AthleteProfile, raw: &RawActivity) -> IngestOutcome {
    let activity = ActivityNormalizer::normalize(raw).unwrap();
    let load = LoadCalculator::calculate(&activity, profile).unwrap();
    agg.ingest_computation(&load, activity.revision).unwrap()
}

#[test]
fn test_first_activity_from_zero_history() {
    let profile = hr_profile();
    let mut agg = LoadAggregator::new("runner", WindowConfig::from(&profile.plan_policy));

    let outcome = fold(&mut agg, &profile, &hr_activity("run-1", date(2024, 3, 4), 3600, 160.0));

    let IngestOutcome::Applied { samples } = outcome else {
        panic!("expected an in-order apply, got {:?}", outcome);
    };
    assert_eq!(samples.len(), 1);
    assert!(samples[0].load > Decimal::ZERO);

    let window = agg.window();
    assert!(window.acute > Decimal::ZERO);
    assert!(window.chronic > Decimal::ZERO);
    assert!(window.acute > window.chronic);
    assert_eq!(window.ratio, None);
    assert_eq!(window.status, None);

    fold(&mut agg, &profile, &hr_activity("run-2", date(2024, 3, 5), 2400, 150.0));
    let window = agg.window();
    assert!(window.ratio.is_some());
    assert!(window.status.is_some());
}

#[test]
fn test_midnight_activity_splits_across_days() {
    let profile = hr_profile();
    let mut raw = hr_activity("late", date(2024, 3, 4), 3600, 165.0);
    raw.start_time = Some(Utc.with_ymd_and_hms(2024, 3, 4, 23, 30, 0).unwrap());

    let activity = ActivityNormalizer::normalize(&raw).unwrap();
    let load = LoadCalculator::calculate(&activity, &profile).unwrap();

    assert_eq!(load.daily_loads.len(), 2);
    let days: Vec<NaiveDate> = load.daily_loads.keys().copied().collect();
    assert_eq!(days, vec![date(2024, 3, 4), date(2024, 3, 5)]);
    assert_eq!(load.daily_loads.values().sum::<Decimal>(), load.total_load);
}

#[test]
fn test_rejected_activities_carry_reasons() {
    let mut too_hot = hr_activity("hot", date(2024, 3, 4), 600, 320.0);
    too_hot.samples.truncate(3);
    let mut no_samples = hr_activity("empty", date(2024, 3, 4), 600, 150.0);
    no_samples.samples.clear();
    let valid = hr_activity("ok", date(2024, 3, 4), 600, 150.0);

    let (accepted, rejected) = ActivityNormalizer::normalize_batch(&[too_hot, valid, no_samples]);

    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].id, "ok");
    assert_eq!(rejected.len(), 2);
    let codes: Vec<&str> = rejected.iter().map(|r| r.reason.code()).collect();
    assert!(codes.iter().all(|c| !c.is_empty()));
    assert_ne!(codes[0], codes[1]);
}

#[test]
fn test_eight_week_plan_follows_pattern() {
    let mut profile = AthleteProfile::new("cyclist");
    profile.target_event_date = Some(date(2024, 2, 26));
    profile.plan_policy.initial_block_target = dec!(100);

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
    assert_eq!(&targets[..6], &[dec!(100), dec!(110), dec!(121), dec!(96.8), dec!(133.1), dec!(146.41)]);
    assert!(targets[6] < targets[5]);
    assert!(targets[7] < targets[6]);

    for pair in plan.blocks.windows(2) {
        assert_eq!(pair[0].end, pair[1].start);
    }
    assert_eq!(plan.blocks.last().map(|b| b.end), Some(date(2024, 2, 26)));
}

#[test]
fn test_history_drives_plan_and_adaptation() {
    let mut profile = hr_profile();
    profile.target_event_date = Some(date(2024, 4, 29));
    let mut agg = LoadAggregator::new("runner", WindowConfig::from(&profile.plan_policy));

    // Six weeks of 45 minutes a day
    let mut day = date(2024, 1, 22);
    let mut n = 0;
    while day < date(2024, 3, 4) {
        fold(&mut agg, &profile, &hr_activity(&format!("base-{}", n), day, 2700, 150.0));
        day += Duration::days(1);
        n += 1;
    }

    let chronic = agg.window().chronic;
    let plan_start = date(2024, 3, 4);
    let mut plan = PeriodizationPlanner::seed(&profile, chronic, plan_start).unwrap();
    assert_eq!(plan.start_date(), Some(plan_start));
    assert_eq!(plan.blocks[0].target, (chronic * dec!(7)).round_dp(2));

    // Back off to ten minutes a day for the first block
    for i in 0..7 {
        let day = plan_start + Duration::days(i);
        fold(&mut agg, &profile, &hr_activity(&format!("easy-{}", i), day, 600, 150.0));
    }

    let before = plan.clone();
    let event = AdaptationEngine::run(&mut plan, &agg, &profile, date(2024, 3, 10))
        .unwrap()
        .expect("undershoot should adapt the plan");

    assert!(matches!(event.decision, Decision::Undershoot(_)));
    assert_eq!(event.evaluated_block, 0);
    assert!(!event.changes.is_empty());
    for change in &event.changes {
        assert!(change.new_target <= change.old_target);
        assert!(plan.blocks[change.index as usize].start > date(2024, 3, 10));
    }
    assert_eq!(plan.blocks[0], before.blocks[0]);
    assert!(plan.check_contiguity().is_ok());

    // Running again on the same data changes nothing
    let again = AdaptationEngine::run(&mut plan, &agg, &profile, date(2024, 3, 10)).unwrap();
    assert!(again.is_none());
}

#[test]
fn test_out_of_order_log_matches_in_order_log() {
    let profile = hr_profile();
    let raws: Vec<RawActivity> = (0..30)
        .map(|i| {
            let hr = 130.0 + f64::from(i % 5) * 8.0;
            hr_activity(&format!("a{}", i), date(2024, 5, 1) + Duration::days(i64::from(i)), 1800, hr)
        })
        .collect();

    let mut ordered = LoadAggregator::new("runner", WindowConfig::default());
    for raw in &raws {
        fold(&mut ordered, &profile, raw);
    }

    let mut shuffled = LoadAggregator::new("runner", WindowConfig::default());
    for i in (0..raws.len()).rev().step_by(2).chain((0..raws.len()).step_by(2)) {
        fold(&mut shuffled, &profile, &raws[i]);
    }
    assert!(shuffled.is_replay_pending());
    let replayed = shuffled.replay_now().unwrap();

    assert_eq!(replayed, ordered.window());
}

#[test]
fn test_batch_rebuild_from_config_profiles() {
    let config: EngineConfig = toml::from_str(
        r#"
        [athletes.runner]
        athlete_id = "runner"
        resting_hr = 50

        [athletes.runner.thresholds]
        heart_rate = "170"

        [athletes.runner.plan_policy]
        acute_window_days = 5
        "#,
    )
    .unwrap();
    config.validate().unwrap();

    let profiles: HashMap<_, _> = config
        .athletes
        .iter()
        .map(|(id, p)| (id.clone(), p.clone()))
        .collect();
    let raws: Vec<RawActivity> = (0..10)
        .map(|i| hr_activity(&format!("r{}", i), date(2024, 6, 1) + Duration::days(i), 3000, 155.0))
        .collect();

    let (aggregators, summary) = BatchProcessor::new(BatchConfig { num_threads: Some(2) })
        .rebuild(&raws, &profiles)
        .unwrap();

    assert_eq!(summary.successful(), 1);
    assert_eq!(aggregators[0].config().acute_days, 5);
    let window = summary.results[0].window.clone().unwrap();
    assert_eq!(window.as_of, Some(date(2024, 6, 10)));
    assert_eq!(window.contributing_days, 10);
}
