use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use uuid::Uuid;

use crate::models::{
    BenchmarkData, CohortRow, ComprehensiveSummary, Confidence, FatigueDropOff, Heatmap,
    HeatmapCell, LearningHealth, PracticeAttempt, ReadinessComponents, ReadinessScoreData,
    ReadinessTrend, RushFactor, ScoreComponent, StagnantTopic, StagnantTopics, SubjectAccuracy,
    SubjectPercentile, Subscription, SubscriptionTier, TrendDirection,
};
use crate::tiers::{MasteryLevel, ReadinessTier, RiskLevel, StagnationLevel};

pub const NEEDS_FOCUS_BELOW: f64 = 70.0;
pub const RUSH_THRESHOLD_MS: i32 = 5_000;
pub const STAGNATION_WINDOW_DAYS: i64 = 14;
pub const MIN_FATIGUE_SESSION: usize = 6;
pub const MIN_BENCHMARK_COHORT: u32 = 5;
pub const BENCHMARK_TIER: SubscriptionTier = SubscriptionTier::Summit;

const ACCURACY_WEIGHT: f64 = 35.0;
const COVERAGE_WEIGHT: f64 = 20.0;
const CONSISTENCY_WEIGHT: f64 = 15.0;
const DIFFICULTY_WEIGHT: f64 = 15.0;
const IMPROVEMENT_WEIGHT: f64 = 15.0;
const TARGET_DAYS_PER_WEEK: f64 = 4.0;
const HEATMAP_RECENT_DAYS: i64 = 7;

/// Reporting window ending at `now`. The prior window is the equal-length period before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub now: DateTime<Utc>,
    pub days: i64,
}

impl Window {
    pub fn new(now: DateTime<Utc>, days: i64) -> Self {
        Self {
            now,
            days: days.max(1),
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.now - Duration::days(self.days)
    }

    pub fn prior_start(&self) -> DateTime<Utc> {
        self.now - Duration::days(self.days * 2)
    }

    /// Earliest timestamp any computation over this window needs.
    pub fn fetch_since(&self) -> DateTime<Utc> {
        self.prior_start()
            .min(self.now - Duration::days(STAGNATION_WINDOW_DAYS * 2))
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at > self.start() && at <= self.now
    }

    pub fn in_prior(&self, at: DateTime<Utc>) -> bool {
        at > self.prior_start() && at <= self.start()
    }
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn accuracy_of<'a>(attempts: impl IntoIterator<Item = &'a PracticeAttempt>) -> Option<f64> {
    let (correct, total) = attempts.into_iter().fold((0u32, 0u32), |(c, t), a| {
        (c + u32::from(a.is_correct), t + 1)
    });
    if total == 0 {
        None
    } else {
        Some(correct as f64 / total as f64 * 100.0)
    }
}

fn in_window<'a>(attempts: &'a [PracticeAttempt], window: &Window) -> Vec<&'a PracticeAttempt> {
    attempts
        .iter()
        .filter(|a| window.contains(a.answered_at))
        .collect()
}

/// Distinct calendar days (UTC) with at least one answer.
pub fn practice_days<'a>(attempts: impl IntoIterator<Item = &'a PracticeAttempt>) -> BTreeSet<NaiveDate> {
    attempts.into_iter().map(|a| a.answered_at.date_naive()).collect()
}

/// Consecutive practice days ending today, or yesterday if today has no practice yet.
pub fn current_streak(days: &BTreeSet<NaiveDate>, today: NaiveDate) -> u32 {
    let mut cursor = if days.contains(&today) {
        today
    } else {
        today - Duration::days(1)
    };
    let mut streak = 0;
    while days.contains(&cursor) {
        streak += 1;
        cursor -= Duration::days(1);
    }
    streak
}

/// `history` is every practice day on record; the streak is not bounded by the window.
pub fn comprehensive(
    attempts: &[PracticeAttempt],
    window: &Window,
    history: &BTreeSet<NaiveDate>,
) -> ComprehensiveSummary {
    let current = in_window(attempts, window);
    let streak_days = current_streak(history, window.now.date_naive());

    if current.is_empty() {
        return ComprehensiveSummary {
            streak_days,
            ..ComprehensiveSummary::default()
        };
    }

    let total = current.len() as u32;
    let correct = current.iter().filter(|a| a.is_correct).count() as u32;
    let response_ms: i64 = current.iter().map(|a| a.response_time_ms as i64).sum();
    let active_days: BTreeSet<NaiveDate> =
        current.iter().map(|a| a.answered_at.date_naive()).collect();

    let mut by_subject: BTreeMap<&str, (u32, u32)> = BTreeMap::new();
    for attempt in &current {
        let entry = by_subject.entry(attempt.subject.as_str()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += u32::from(attempt.is_correct);
    }

    ComprehensiveSummary {
        total_attempts: total,
        correct_attempts: correct,
        accuracy: round1(correct as f64 / total as f64 * 100.0),
        average_response_seconds: round1(response_ms as f64 / total as f64 / 1000.0),
        active_days: active_days.len() as u32,
        streak_days,
        questions_per_day: round1(total as f64 / window.days as f64),
        last_practiced: current.iter().map(|a| a.answered_at).max(),
        subjects: by_subject
            .into_iter()
            .map(|(subject, (attempts, correct))| SubjectAccuracy {
                subject: subject.to_string(),
                attempts,
                correct,
                accuracy: round1(correct as f64 / attempts as f64 * 100.0),
            })
            .collect(),
    }
}

fn trend_between(recent: Option<f64>, earlier: Option<f64>, margin: f64) -> TrendDirection {
    match (recent, earlier) {
        (Some(r), Some(e)) if r - e >= margin => TrendDirection::Up,
        (Some(r), Some(e)) if e - r >= margin => TrendDirection::Down,
        _ => TrendDirection::Stable,
    }
}

pub fn heatmap(attempts: &[PracticeAttempt], window: &Window) -> Heatmap {
    let recent_since = window.now - Duration::days(HEATMAP_RECENT_DAYS);
    let mut groups: BTreeMap<(&str, &str), Vec<&PracticeAttempt>> = BTreeMap::new();
    for attempt in in_window(attempts, window) {
        groups
            .entry((attempt.subject.as_str(), attempt.topic.as_str()))
            .or_default()
            .push(attempt);
    }

    let mut subjects = BTreeSet::new();
    let cells = groups
        .into_iter()
        .map(|((subject, topic), group)| {
            subjects.insert(subject.to_string());
            let correct = group.iter().filter(|a| a.is_correct).count() as u32;
            let accuracy = round1(accuracy_of(group.iter().copied()).unwrap_or_default());
            let recent = accuracy_of(group.iter().copied().filter(|a| a.answered_at > recent_since));
            let earlier =
                accuracy_of(group.iter().copied().filter(|a| a.answered_at <= recent_since));

            let mastery_level = MasteryLevel::from_accuracy(Some(accuracy));

            HeatmapCell {
                subject: subject.to_string(),
                topic: topic.to_string(),
                attempts: group.len() as u32,
                correct,
                accuracy,
                mastery_level,
                mastery_badge: mastery_level.badge(),
                needs_focus: accuracy < NEEDS_FOCUS_BELOW,
                trend: trend_between(recent, earlier, 5.0),
                last_practiced: group.iter().map(|a| a.answered_at).max(),
            }
        })
        .collect();

    Heatmap {
        cells,
        subjects: subjects.into_iter().collect(),
    }
}

fn component(fraction: f64, max: f64) -> ScoreComponent {
    ScoreComponent {
        score: round1(fraction.clamp(0.0, 1.0) * max),
        max,
    }
}

fn readiness_components(
    attempts: &[&PracticeAttempt],
    prior_accuracy: Option<f64>,
    days: i64,
    curriculum_topics: usize,
) -> ReadinessComponents {
    let accuracy = accuracy_of(attempts.iter().copied()).unwrap_or_default();

    let practised: BTreeSet<(&str, &str)> = attempts
        .iter()
        .map(|a| (a.subject.as_str(), a.topic.as_str()))
        .collect();
    let coverage = if curriculum_topics == 0 {
        0.0
    } else {
        practised.len() as f64 / curriculum_topics as f64
    };

    let active_days: BTreeSet<NaiveDate> =
        attempts.iter().map(|a| a.answered_at.date_naive()).collect();
    let expected_days = (days as f64 * TARGET_DAYS_PER_WEEK / 7.0).max(1.0);
    let consistency = active_days.len() as f64 / expected_days;

    let (weighted_correct, weighted_total) = attempts.iter().fold((0.0, 0.0), |(c, t), a| {
        let weight = a.difficulty.clamp(1, 3) as f64;
        (c + if a.is_correct { weight } else { 0.0 }, t + weight)
    });
    let difficulty = if weighted_total > 0.0 {
        weighted_correct / weighted_total
    } else {
        0.0
    };

    let improvement = match prior_accuracy {
        Some(prior) => ((accuracy - prior).clamp(-10.0, 10.0) + 10.0) / 20.0,
        None => 0.5,
    };

    ReadinessComponents {
        accuracy: component(accuracy / 100.0, ACCURACY_WEIGHT),
        coverage: component(coverage, COVERAGE_WEIGHT),
        consistency: component(consistency, CONSISTENCY_WEIGHT),
        difficulty: component(difficulty, DIFFICULTY_WEIGHT),
        improvement: component(improvement, IMPROVEMENT_WEIGHT),
    }
}

fn total_score(components: &ReadinessComponents) -> u32 {
    let sum = components.accuracy.score
        + components.coverage.score
        + components.consistency.score
        + components.difficulty.score
        + components.improvement.score;
    sum.round().clamp(0.0, 100.0) as u32
}

fn confidence_for(attempts: usize) -> Confidence {
    match attempts {
        0..=49 => Confidence::Low,
        50..=149 => Confidence::Medium,
        _ => Confidence::High,
    }
}

/// Readiness for a child with nothing to score.
pub fn empty_readiness() -> ReadinessScoreData {
    let zero = |max| ScoreComponent { score: 0.0, max };
    ReadinessScoreData {
        has_data: false,
        overall_score: 0,
        tier: ReadinessTier::NoData,
        tier_badge: ReadinessTier::NoData.badge(),
        components: ReadinessComponents {
            accuracy: zero(ACCURACY_WEIGHT),
            coverage: zero(COVERAGE_WEIGHT),
            consistency: zero(CONSISTENCY_WEIGHT),
            difficulty: zero(DIFFICULTY_WEIGHT),
            improvement: zero(IMPROVEMENT_WEIGHT),
        },
        confidence: Confidence::Low,
        trend: None,
        attempts_counted: 0,
    }
}

pub fn readiness(
    attempts: &[PracticeAttempt],
    window: &Window,
    curriculum_topics: usize,
) -> ReadinessScoreData {
    let current = in_window(attempts, window);
    if current.is_empty() {
        return empty_readiness();
    }

    let prior: Vec<&PracticeAttempt> = attempts
        .iter()
        .filter(|a| window.in_prior(a.answered_at))
        .collect();
    let prior_accuracy = accuracy_of(prior.iter().copied());

    let components =
        readiness_components(&current, prior_accuracy, window.days, curriculum_topics);
    let overall_score = total_score(&components);

    let trend = if prior.is_empty() {
        None
    } else {
        let previous =
            total_score(&readiness_components(&prior, None, window.days, curriculum_topics));
        let delta = overall_score as i32 - previous as i32;
        let direction = match delta {
            d if d >= 2 => TrendDirection::Up,
            d if d <= -2 => TrendDirection::Down,
            _ => TrendDirection::Stable,
        };
        Some(ReadinessTrend {
            direction,
            delta,
            previous_score: previous,
        })
    };

    let tier = ReadinessTier::from_score(Some(overall_score as f64));
    ReadinessScoreData {
        has_data: true,
        overall_score,
        tier,
        tier_badge: tier.badge(),
        components,
        confidence: confidence_for(current.len()),
        trend,
        attempts_counted: current.len() as u32,
    }
}

fn rush_factor(current: &[&PracticeAttempt]) -> RushFactor {
    let percentage = if current.is_empty() {
        None
    } else {
        let rushed = current
            .iter()
            .filter(|a| a.response_time_ms < RUSH_THRESHOLD_MS)
            .count();
        Some(rushed as f64 / current.len() as f64 * 100.0)
    };

    let level = RiskLevel::for_rush_factor(percentage);
    RushFactor {
        percentage: round1(percentage.unwrap_or_default()),
        threshold_seconds: (RUSH_THRESHOLD_MS / 1000) as u32,
        level,
        badge: level.badge(),
    }
}

fn fatigue(current: &[&PracticeAttempt]) -> FatigueDropOff {
    let mut sessions: HashMap<Uuid, Vec<&PracticeAttempt>> = HashMap::new();
    for attempt in current {
        sessions.entry(attempt.session_id).or_default().push(attempt);
    }

    let mut drops = Vec::new();
    for session in sessions.values_mut() {
        if session.len() < MIN_FATIGUE_SESSION {
            continue;
        }
        session.sort_by_key(|a| a.answered_at);
        let half = session.len() / 2;
        let first = accuracy_of(session[..half].iter().copied());
        let second = accuracy_of(session[session.len() - half..].iter().copied());
        if let (Some(first), Some(second)) = (first, second) {
            drops.push(first - second);
        }
    }

    let mean = if drops.is_empty() {
        None
    } else {
        Some(drops.iter().sum::<f64>() / drops.len() as f64)
    };

    let level = RiskLevel::for_fatigue(mean);
    FatigueDropOff {
        drop_points: round1(mean.unwrap_or_default()),
        sessions_measured: drops.len() as u32,
        level,
        badge: level.badge(),
    }
}

fn stagnant_topics(attempts: &[PracticeAttempt], now: DateTime<Utc>) -> StagnantTopics {
    let recent_start = now - Duration::days(STAGNATION_WINDOW_DAYS);
    let previous_start = now - Duration::days(STAGNATION_WINDOW_DAYS * 2);

    let mut groups: BTreeMap<(&str, &str), (Vec<&PracticeAttempt>, Vec<&PracticeAttempt>)> =
        BTreeMap::new();
    for attempt in attempts {
        if attempt.answered_at > now || attempt.answered_at <= previous_start {
            continue;
        }
        let entry = groups
            .entry((attempt.subject.as_str(), attempt.topic.as_str()))
            .or_default();
        if attempt.answered_at > recent_start {
            entry.0.push(attempt);
        } else {
            entry.1.push(attempt);
        }
    }

    if groups.is_empty() {
        return StagnantTopics {
            count: 0,
            level: StagnationLevel::NoData,
            badge: StagnationLevel::NoData.badge(),
            topics: Vec::new(),
        };
    }

    let topics: Vec<StagnantTopic> = groups
        .into_iter()
        .filter_map(|((subject, topic), (recent, previous))| {
            let recent_accuracy = accuracy_of(recent)?;
            let previous_accuracy = accuracy_of(previous)?;
            let mastered = MasteryLevel::from_accuracy(Some(recent_accuracy)) == MasteryLevel::Mastered;
            (!mastered && recent_accuracy <= previous_accuracy).then(|| StagnantTopic {
                subject: subject.to_string(),
                topic: topic.to_string(),
                previous_accuracy: round1(previous_accuracy),
                recent_accuracy: round1(recent_accuracy),
            })
        })
        .collect();

    let count = topics.len() as u32;
    let level = StagnationLevel::from_count(Some(count));
    StagnantTopics {
        count,
        level,
        badge: level.badge(),
        topics,
    }
}

pub fn learning_health(attempts: &[PracticeAttempt], window: &Window) -> LearningHealth {
    let current = in_window(attempts, window);
    let rush_factor = rush_factor(&current);
    let fatigue = fatigue(&current);
    let stagnant_topics = stagnant_topics(attempts, window.now);
    let overall = RiskLevel::worst([
        rush_factor.level,
        fatigue.level,
        stagnant_topics.level.as_risk(),
    ]);

    LearningHealth {
        rush_factor,
        fatigue,
        stagnant_topics,
        overall,
        overall_badge: overall.badge(),
    }
}

/// Share of the cohort strictly below `value`, counting ties as half.
pub fn percentile(value: f64, cohort: &[f64]) -> u32 {
    if cohort.is_empty() {
        return 0;
    }
    let below = cohort.iter().filter(|v| **v < value).count() as f64;
    let equal = cohort.iter().filter(|v| **v == value).count() as f64;
    ((below + equal / 2.0) / cohort.len() as f64 * 100.0).round() as u32
}

pub fn benchmark_unlocked(subscription: &Subscription) -> bool {
    subscription.tier == BENCHMARK_TIER && subscription.is_current()
}

pub fn benchmark(child_id: Uuid, rows: &[CohortRow], subscription: &Subscription) -> BenchmarkData {
    if !benchmark_unlocked(subscription) {
        return BenchmarkData::Locked {
            required_tier: BENCHMARK_TIER,
        };
    }

    let mut overall: HashMap<Uuid, (i64, i64)> = HashMap::new();
    let mut by_subject: BTreeMap<&str, HashMap<Uuid, f64>> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.total > 0) {
        let entry = overall.entry(row.child_id).or_insert((0, 0));
        entry.0 += row.correct;
        entry.1 += row.total;
        by_subject
            .entry(row.subject.as_str())
            .or_default()
            .insert(row.child_id, row.correct as f64 / row.total as f64 * 100.0);
    }

    let own = overall
        .get(&child_id)
        .map(|(correct, total)| *correct as f64 / *total as f64 * 100.0);
    let peers: Vec<f64> = overall
        .iter()
        .filter(|(id, _)| **id != child_id)
        .map(|(_, (correct, total))| *correct as f64 / *total as f64 * 100.0)
        .collect();
    let cohort_size = peers.len() as u32;

    let Some(own) = own.filter(|_| cohort_size >= MIN_BENCHMARK_COHORT) else {
        return BenchmarkData::InsufficientData {
            cohort_size,
            minimum: MIN_BENCHMARK_COHORT,
        };
    };

    let subjects = by_subject
        .into_iter()
        .filter_map(|(subject, scores)| {
            let own = *scores.get(&child_id)?;
            let peers: Vec<f64> = scores
                .iter()
                .filter(|(id, _)| **id != child_id)
                .map(|(_, v)| *v)
                .collect();
            (peers.len() as u32 >= MIN_BENCHMARK_COHORT).then(|| SubjectPercentile {
                subject: subject.to_string(),
                percentile: percentile(own, &peers),
                cohort_size: peers.len() as u32,
            })
        })
        .collect();

    BenchmarkData::Available {
        overall_percentile: percentile(own, &peers),
        cohort_size,
        subjects,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::SubscriptionStatus;
    use chrono::TimeZone;

    pub(crate) fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 15, 18, 0, 0).unwrap()
    }

    pub(crate) fn attempt(
        subject: &str,
        topic: &str,
        is_correct: bool,
        hours_ago: i64,
    ) -> PracticeAttempt {
        PracticeAttempt {
            session_id: Uuid::nil(),
            subject: subject.to_string(),
            topic: topic.to_string(),
            is_correct,
            response_time_ms: 30_000,
            difficulty: 2,
            answered_at: fixed_now() - Duration::hours(hours_ago),
        }
    }

    fn batch(subject: &str, topic: &str, correct: usize, wrong: usize, hours_ago: i64) -> Vec<PracticeAttempt> {
        let mut out = Vec::new();
        for _ in 0..correct {
            out.push(attempt(subject, topic, true, hours_ago));
        }
        for _ in 0..wrong {
            out.push(attempt(subject, topic, false, hours_ago));
        }
        out
    }

    fn summit() -> Subscription {
        Subscription {
            tier: SubscriptionTier::Summit,
            status: SubscriptionStatus::Active,
            ..Subscription::free()
        }
    }

    #[test]
    fn window_bounds() {
        let window = Window::new(fixed_now(), 7);
        assert!(window.contains(fixed_now()));
        assert!(!window.contains(window.start()));
        assert!(window.in_prior(window.start()));
        assert_eq!(window.fetch_since(), fixed_now() - Duration::days(28));
        assert_eq!(Window::new(fixed_now(), 0).days, 1);
    }

    #[test]
    fn streak_counts_back_from_yesterday() {
        let today = fixed_now().date_naive();
        let days: BTreeSet<NaiveDate> = [1, 2, 3, 5]
            .iter()
            .map(|d| today - Duration::days(*d))
            .collect();
        assert_eq!(current_streak(&days, today), 3);
        assert_eq!(current_streak(&BTreeSet::new(), today), 0);
    }

    #[test]
    fn comprehensive_summarises_window() {
        let mut attempts = batch("mathematics", "Fractions", 3, 1, 2);
        attempts.extend(batch("english", "Synonyms", 1, 1, 30));
        attempts.extend(batch("english", "Synonyms", 5, 0, 24 * 40));

        let summary = comprehensive(&attempts, &Window::new(fixed_now(), 7), &practice_days(&attempts));
        assert_eq!(summary.total_attempts, 6);
        assert_eq!(summary.correct_attempts, 4);
        assert!((summary.accuracy - 66.7).abs() < 1e-9);
        assert_eq!(summary.active_days, 2);
        assert_eq!(summary.streak_days, 2);
        assert_eq!(summary.subjects.len(), 2);
        assert_eq!(summary.subjects[0].subject, "english");
        assert!((summary.average_response_seconds - 30.0).abs() < 1e-9);
    }

    #[test]
    fn comprehensive_without_attempts_is_zeroed() {
        let summary = comprehensive(&[], &Window::new(fixed_now(), 30), &BTreeSet::new());
        assert_eq!(summary, ComprehensiveSummary::default());
    }

    #[test]
    fn heatmap_cells_classify_and_trend() {
        let mut attempts = batch("mathematics", "Fractions", 2, 3, 24 * 10);
        attempts.extend(batch("mathematics", "Fractions", 4, 1, 24));
        attempts.extend(batch("english", "Synonyms", 9, 1, 5));

        let map = heatmap(&attempts, &Window::new(fixed_now(), 30));
        assert_eq!(map.subjects, vec!["english", "mathematics"]);
        let fractions = map.cells.iter().find(|c| c.topic == "Fractions").unwrap();
        assert_eq!(fractions.attempts, 10);
        assert!((fractions.accuracy - 60.0).abs() < 1e-9);
        assert_eq!(fractions.mastery_level, MasteryLevel::NeedsPractice);
        assert!(fractions.needs_focus);
        assert_eq!(fractions.trend, TrendDirection::Up);

        let synonyms = map.cells.iter().find(|c| c.topic == "Synonyms").unwrap();
        assert_eq!(synonyms.mastery_level, MasteryLevel::Mastered);
        assert!(!synonyms.needs_focus);
        assert_eq!(synonyms.trend, TrendDirection::Stable);
    }

    #[test]
    fn heatmap_focus_threshold_is_strict() {
        let attempts = batch("english", "Antonyms", 7, 3, 3);
        let map = heatmap(&attempts, &Window::new(fixed_now(), 30));
        assert!(!map.cells[0].needs_focus);
        assert_eq!(map.cells[0].mastery_level, MasteryLevel::Developing);
    }

    #[test]
    fn heatmap_buckets_the_accuracy_it_reports() {
        // 89/137 is 64.96% and 142/203 is 69.95%; both round up onto a boundary.
        let mut attempts = batch("mathematics", "Ratio", 89, 48, 3);
        attempts.extend(batch("english", "Cloze", 142, 61, 3));
        let map = heatmap(&attempts, &Window::new(fixed_now(), 30));

        let ratio = map.cells.iter().find(|c| c.topic == "Ratio").unwrap();
        assert!((ratio.accuracy - 65.0).abs() < 1e-9);
        assert_eq!(ratio.mastery_level, MasteryLevel::Developing);
        assert_eq!(ratio.mastery_badge.color, "amber");
        assert!(ratio.needs_focus);

        let cloze = map.cells.iter().find(|c| c.topic == "Cloze").unwrap();
        assert!((cloze.accuracy - 70.0).abs() < 1e-9);
        assert!(!cloze.needs_focus);

        let flagged: Vec<&str> = map
            .cells
            .iter()
            .filter(|c| c.needs_focus)
            .map(|c| c.topic.as_str())
            .collect();
        let recommended: Vec<String> = crate::recommend::synthesize(&map.cells, 5, 60.0)
            .into_iter()
            .filter_map(|r| r.topic)
            .collect();
        assert_eq!(flagged, vec!["Ratio"]);
        assert_eq!(recommended, vec!["Ratio".to_string()]);
    }

    #[test]
    fn streak_ignores_the_reporting_window() {
        let attempts: Vec<PracticeAttempt> = (0..40)
            .map(|day| attempt("mathematics", "Fractions", true, 1 + 24 * day))
            .collect();
        let history = practice_days(&attempts);
        let in_week: Vec<PracticeAttempt> = attempts
            .iter()
            .filter(|a| Window::new(fixed_now(), 7).contains(a.answered_at))
            .cloned()
            .collect();

        let week = comprehensive(&in_week, &Window::new(fixed_now(), 7), &history);
        let quarter = comprehensive(&attempts, &Window::new(fixed_now(), 90), &history);
        assert_eq!(week.streak_days, 40);
        assert_eq!(quarter.streak_days, 40);
        assert_eq!(week.total_attempts, 7);
    }

    #[test]
    fn readiness_with_zero_attempts_is_explicit_empty_state() {
        let data = readiness(&[], &Window::new(fixed_now(), 30), 12);
        assert!(!data.has_data);
        assert_eq!(data.tier, ReadinessTier::NoData);
        assert_eq!(data.overall_score, 0);
        assert!(data.trend.is_none());
        assert_eq!(data.components.accuracy.max, 35.0);
    }

    #[test]
    fn readiness_components_respect_their_maxima() {
        let mut attempts = Vec::new();
        for day in 0..30 {
            attempts.extend(batch("mathematics", &format!("Topic {}", day % 10), 5, 0, day * 24 + 1));
        }
        let data = readiness(&attempts, &Window::new(fixed_now(), 30), 10);
        assert!(data.has_data);
        let c = &data.components;
        assert_eq!(c.accuracy.score, 35.0);
        assert_eq!(c.coverage.score, 20.0);
        assert_eq!(c.consistency.score, 15.0);
        assert_eq!(c.difficulty.score, 15.0);
        assert_eq!(c.improvement.score, 7.5);
        assert_eq!(data.overall_score, 93);
        assert_eq!(data.tier, ReadinessTier::Excellent);
        assert_eq!(data.confidence, Confidence::High);
        assert!(data.trend.is_none());
    }

    #[test]
    fn readiness_trend_against_prior_window() {
        let mut attempts = batch("mathematics", "Ratio", 2, 8, 24 * 10);
        attempts.extend(batch("mathematics", "Ratio", 9, 1, 24));
        let data = readiness(&attempts, &Window::new(fixed_now(), 7), 4);
        let trend = data.trend.expect("prior window has attempts");
        assert_eq!(trend.direction, TrendDirection::Up);
        assert!(trend.delta >= 2);
        assert_eq!(data.components.improvement.score, 15.0);
    }

    #[test]
    fn rush_and_fatigue_measurements() {
        let session = Uuid::new_v4();
        let mut attempts = Vec::new();
        for i in 0..8 {
            let mut a = attempt("english", "Cloze", i < 4, 8 - i);
            a.session_id = session;
            a.response_time_ms = if i < 2 { 2_000 } else { 20_000 };
            attempts.push(a);
        }
        let health = learning_health(&attempts, &Window::new(fixed_now(), 30));
        assert_eq!(health.rush_factor.percentage, 25.0);
        assert_eq!(health.rush_factor.level, RiskLevel::ActionNeeded);
        assert_eq!(health.fatigue.sessions_measured, 1);
        assert_eq!(health.fatigue.drop_points, 100.0);
        assert_eq!(health.fatigue.level, RiskLevel::ActionNeeded);
        assert_eq!(health.overall, RiskLevel::ActionNeeded);
    }

    #[test]
    fn learning_health_without_practice_is_no_data() {
        let health = learning_health(&[], &Window::new(fixed_now(), 30));
        assert_eq!(health.rush_factor.level, RiskLevel::NoData);
        assert_eq!(health.fatigue.level, RiskLevel::NoData);
        assert_eq!(health.stagnant_topics.level, StagnationLevel::NoData);
        assert_eq!(health.overall, RiskLevel::NoData);
    }

    #[test]
    fn stagnant_topics_need_both_halves_without_improvement() {
        let mut attempts = batch("mathematics", "Algebra", 3, 2, 24 * 20);
        attempts.extend(batch("mathematics", "Algebra", 2, 3, 24 * 3));
        attempts.extend(batch("mathematics", "Area", 1, 4, 24 * 20));
        attempts.extend(batch("mathematics", "Area", 4, 1, 24 * 3));
        attempts.extend(batch("english", "Spelling", 1, 1, 24 * 3));

        let health = learning_health(&attempts, &Window::new(fixed_now(), 30));
        assert_eq!(health.stagnant_topics.count, 1);
        assert_eq!(health.stagnant_topics.topics[0].topic, "Algebra");
        assert_eq!(health.stagnant_topics.level, StagnationLevel::Warning);
    }

    #[test]
    fn percentile_counts_ties_as_half() {
        assert_eq!(percentile(50.0, &[10.0, 20.0, 50.0, 90.0]), 63);
        assert_eq!(percentile(100.0, &[10.0, 20.0]), 100);
        assert_eq!(percentile(0.0, &[]), 0);
    }

    fn cohort(child: Uuid, peers: usize) -> Vec<CohortRow> {
        let mut rows = vec![CohortRow {
            child_id: child,
            subject: "mathematics".into(),
            correct: 8,
            total: 10,
        }];
        for i in 0..peers {
            rows.push(CohortRow {
                child_id: Uuid::new_v4(),
                subject: "mathematics".into(),
                correct: i as i64,
                total: 10,
            });
        }
        rows
    }

    #[test]
    fn benchmark_is_gated_by_tier_and_status() {
        let child = Uuid::new_v4();
        let rows = cohort(child, 6);
        assert_eq!(
            benchmark(child, &rows, &Subscription::free()),
            BenchmarkData::Locked {
                required_tier: SubscriptionTier::Summit
            }
        );
        let lapsed = Subscription {
            status: SubscriptionStatus::PastDue,
            ..summit()
        };
        assert!(matches!(benchmark(child, &rows, &lapsed), BenchmarkData::Locked { .. }));
    }

    #[test]
    fn benchmark_needs_a_minimum_cohort() {
        let child = Uuid::new_v4();
        assert_eq!(
            benchmark(child, &cohort(child, 4), &summit()),
            BenchmarkData::InsufficientData {
                cohort_size: 4,
                minimum: 5
            }
        );
    }

    #[test]
    fn benchmark_ranks_against_peers() {
        let child = Uuid::new_v4();
        match benchmark(child, &cohort(child, 10), &summit()) {
            BenchmarkData::Available {
                overall_percentile,
                cohort_size,
                subjects,
            } => {
                assert_eq!(cohort_size, 10);
                assert_eq!(overall_percentile, 85);
                assert_eq!(subjects.len(), 1);
                assert_eq!(subjects[0].percentile, 85);
            }
            other => panic!("unexpected benchmark {other:?}"),
        }
    }
}
