//! Dashboard client: fetches the five analytics slices for one child in parallel
//! and merges whatever comes back into a single view.
//!
//! A failed or locked slice never blocks the others. [`DashboardLoader`] keeps at
//! most one fetch cycle alive; starting a new one or closing the loader aborts
//! the cycle in flight, and an aborted cycle never publishes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{BenchmarkData, ComprehensiveSummary, Heatmap, LearningHealth, ReadinessScoreData};
use crate::recommend::{self, FocusArea, Recommendation};

pub const DEFAULT_DAYS: i64 = 30;
pub const MAX_DAYS: i64 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Slice {
    Comprehensive,
    Readiness,
    Heatmap,
    Benchmark,
    LearningHealth,
}

impl Slice {
    pub const ALL: [Slice; 5] = [
        Slice::Comprehensive,
        Slice::Readiness,
        Slice::Heatmap,
        Slice::Benchmark,
        Slice::LearningHealth,
    ];

    /// Path segment under `/api/analytics/`.
    pub fn path(&self) -> &'static str {
        match self {
            Slice::Comprehensive => "comprehensive",
            Slice::Readiness => "readiness",
            Slice::Heatmap => "heatmap",
            Slice::Benchmark => "benchmark",
            Slice::LearningHealth => "learning-health",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Range {
    Week,
    #[default]
    Month,
    Quarter,
    All,
}

impl Range {
    pub fn days(&self) -> i64 {
        match self {
            Range::Week => 7,
            Range::Month => DEFAULT_DAYS,
            Range::Quarter => 90,
            Range::All => MAX_DAYS,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Range::Week => "7d",
            Range::Month => "30d",
            Range::Quarter => "90d",
            Range::All => "all",
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Range {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "7d" => Ok(Range::Week),
            "30d" => Ok(Range::Month),
            "90d" => Ok(Range::Quarter),
            "all" => Ok(Range::All),
            other => Err(anyhow!("unknown range {other:?}, expected 7d, 30d, 90d or all")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DashboardParams {
    pub child_id: Uuid,
    pub range: Range,
    /// Explicit day count; wins over `range` when set.
    pub days: Option<i64>,
}

impl DashboardParams {
    pub fn new(child_id: Uuid) -> Self {
        Self {
            child_id,
            range: Range::default(),
            days: None,
        }
    }

    pub fn effective_days(&self) -> i64 {
        self.days.unwrap_or_else(|| self.range.days()).clamp(1, MAX_DAYS)
    }

    fn query_string(&self) -> String {
        let mut query = format!("childId={}&range={}", self.child_id, self.range);
        if let Some(days) = self.days {
            query.push_str(&format!("&days={days}"));
        }
        query
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SliceError {
    #[error("requires a higher subscription tier")]
    Locked,
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SliceData {
    Comprehensive(ComprehensiveSummary),
    Readiness(ReadinessScoreData),
    Heatmap(Heatmap),
    Benchmark(BenchmarkData),
    LearningHealth(LearningHealth),
}

/// Where one slice of analytics comes from.
#[async_trait]
pub trait AnalyticsSource: Send + Sync {
    async fn fetch(&self, slice: Slice, params: &DashboardParams) -> Result<SliceData, SliceError>;
}

pub struct HttpAnalyticsSource {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpAnalyticsSource {
    pub fn new(base_url: &str, token: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }
}

/// Missing `data` or missing fields inside it fall back to defaults.
fn decode_or_default<T: DeserializeOwned + Default>(data: Option<Value>) -> Result<T, SliceError> {
    match data {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => {
            serde_json::from_value(value).map_err(|e| SliceError::Failed(format!("malformed payload: {e}")))
        }
    }
}

fn decode_slice(slice: Slice, data: Option<Value>) -> Result<SliceData, SliceError> {
    Ok(match slice {
        Slice::Comprehensive => SliceData::Comprehensive(decode_or_default(data)?),
        Slice::Readiness => SliceData::Readiness(decode_or_default(data)?),
        Slice::Heatmap => SliceData::Heatmap(decode_or_default(data)?),
        Slice::LearningHealth => SliceData::LearningHealth(decode_or_default(data)?),
        Slice::Benchmark => {
            let value = data.ok_or_else(|| SliceError::Failed("benchmark payload missing".into()))?;
            match serde_json::from_value(value) {
                Ok(BenchmarkData::Locked { .. }) => return Err(SliceError::Locked),
                Ok(benchmark) => SliceData::Benchmark(benchmark),
                Err(e) => return Err(SliceError::Failed(format!("malformed payload: {e}"))),
            }
        }
    })
}

#[async_trait]
impl AnalyticsSource for HttpAnalyticsSource {
    async fn fetch(&self, slice: Slice, params: &DashboardParams) -> Result<SliceData, SliceError> {
        let url = format!(
            "{}/api/analytics/{}?{}",
            self.base_url,
            slice.path(),
            params.query_string()
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| SliceError::Failed(e.to_string()))?;

        let status = response.status();
        if slice == Slice::Benchmark
            && (status == StatusCode::PAYMENT_REQUIRED || status == StatusCode::FORBIDDEN)
        {
            return Err(SliceError::Locked);
        }
        if !status.is_success() {
            return Err(SliceError::Failed(format!("{} returned {status}", slice.path())));
        }

        let mut body: Value = response
            .json()
            .await
            .map_err(|e| SliceError::Failed(e.to_string()))?;
        decode_slice(slice, body.get_mut("data").map(Value::take))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceStatus {
    Loaded,
    Locked,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardView {
    pub params: DashboardParams,
    pub comprehensive: Option<ComprehensiveSummary>,
    pub readiness: Option<ReadinessScoreData>,
    pub heatmap: Option<Heatmap>,
    pub benchmark: Option<BenchmarkData>,
    pub learning_health: Option<LearningHealth>,
    pub status: BTreeMap<Slice, SliceStatus>,
}

impl DashboardView {
    fn empty(params: DashboardParams) -> Self {
        Self {
            params,
            comprehensive: None,
            readiness: None,
            heatmap: None,
            benchmark: None,
            learning_health: None,
            status: BTreeMap::new(),
        }
    }

    /// Slices populate disjoint fields, so merge order does not matter.
    fn merge(&mut self, slice: Slice, result: Result<SliceData, SliceError>) {
        let status = match result {
            Ok(data) => match (slice, data) {
                (Slice::Comprehensive, SliceData::Comprehensive(d)) => {
                    self.comprehensive = Some(d);
                    SliceStatus::Loaded
                }
                (Slice::Readiness, SliceData::Readiness(d)) => {
                    self.readiness = Some(d);
                    SliceStatus::Loaded
                }
                (Slice::Heatmap, SliceData::Heatmap(d)) => {
                    self.heatmap = Some(d);
                    SliceStatus::Loaded
                }
                (Slice::Benchmark, SliceData::Benchmark(d)) => {
                    self.benchmark = Some(d);
                    SliceStatus::Loaded
                }
                (Slice::LearningHealth, SliceData::LearningHealth(d)) => {
                    self.learning_health = Some(d);
                    SliceStatus::Loaded
                }
                (slice, _) => SliceStatus::Failed(format!("{} returned the wrong slice", slice.path())),
            },
            Err(SliceError::Locked) => SliceStatus::Locked,
            Err(SliceError::Failed(reason)) => {
                warn!(slice = slice.path(), %reason, "analytics slice failed");
                SliceStatus::Failed(reason)
            }
        };
        self.status.insert(slice, status);
    }

    pub fn status_of(&self, slice: Slice) -> Option<&SliceStatus> {
        self.status.get(&slice)
    }

    pub fn recommendations(&self) -> Vec<Recommendation> {
        let cells = self.heatmap.as_ref().map(|h| h.cells.as_slice()).unwrap_or(&[]);
        let (streak, accuracy) = self
            .comprehensive
            .as_ref()
            .map(|c| (c.streak_days, c.accuracy))
            .unwrap_or((0, 0.0));
        recommend::synthesize(cells, streak, accuracy)
    }

    pub fn focus_areas(&self) -> Vec<FocusArea> {
        self.heatmap
            .as_ref()
            .map(|h| recommend::focus_areas(&h.cells))
            .unwrap_or_default()
    }
}

/// Fetches every slice concurrently; never fails as a whole.
pub async fn fetch_dashboard(source: &dyn AnalyticsSource, params: &DashboardParams) -> DashboardView {
    let (comprehensive, readiness, heatmap, benchmark, learning_health) = tokio::join!(
        source.fetch(Slice::Comprehensive, params),
        source.fetch(Slice::Readiness, params),
        source.fetch(Slice::Heatmap, params),
        source.fetch(Slice::Benchmark, params),
        source.fetch(Slice::LearningHealth, params),
    );

    let mut view = DashboardView::empty(*params);
    view.merge(Slice::Comprehensive, comprehensive);
    view.merge(Slice::Readiness, readiness);
    view.merge(Slice::Heatmap, heatmap);
    view.merge(Slice::Benchmark, benchmark);
    view.merge(Slice::LearningHealth, learning_health);
    view
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashboardState {
    pub generation: u64,
    pub loading: bool,
    pub view: Option<DashboardView>,
}

pub struct DashboardLoader {
    source: Arc<dyn AnalyticsSource>,
    state: watch::Sender<DashboardState>,
    current: Option<JoinHandle<()>>,
}

impl DashboardLoader {
    pub fn new(source: Arc<dyn AnalyticsSource>) -> Self {
        let (state, _) = watch::channel(DashboardState::default());
        Self {
            source,
            state,
            current: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardState> {
        self.state.subscribe()
    }

    /// Starts a fetch cycle for `params`, abandoning any cycle still running.
    pub fn load(&mut self, params: DashboardParams) {
        self.abort_current();
        let mut generation = 0;
        self.state.send_modify(|state| {
            state.generation += 1;
            state.loading = true;
            state.view = None;
            generation = state.generation;
        });
        debug!(child = %params.child_id, generation, "dashboard fetch cycle started");

        let source = self.source.clone();
        let state = self.state.clone();
        self.current = Some(tokio::spawn(async move {
            let view = fetch_dashboard(source.as_ref(), &params).await;
            // The generation check runs under the channel lock, so a superseded cycle cannot publish.
            state.send_if_modified(|current| {
                if current.generation != generation {
                    return false;
                }
                current.loading = false;
                current.view = Some(view);
                true
            });
        }));
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().loading
    }

    /// Abandons the cycle in flight, if any.
    pub fn close(&mut self) {
        self.abort_current();
        self.state.send_modify(|state| {
            state.generation += 1;
            state.loading = false;
        });
    }

    fn abort_current(&mut self) {
        if let Some(handle) = self.current.take() {
            handle.abort();
        }
    }
}

impl Drop for DashboardLoader {
    fn drop(&mut self) {
        self.abort_current();
    }
}

/// Loads one dashboard over HTTP; used by the `dashboard` command.
pub async fn load_once(base_url: &str, token: &str, params: DashboardParams) -> anyhow::Result<DashboardView> {
    let source: Arc<dyn AnalyticsSource> = Arc::new(HttpAnalyticsSource::new(base_url, token)?);
    let mut loader = DashboardLoader::new(source);
    let mut updates = loader.subscribe();
    loader.load(params);
    loop {
        updates.changed().await.context("dashboard loader stopped")?;
        if loader.is_loading() {
            continue;
        }
        let view = updates.borrow_and_update().view.clone();
        loader.close();
        return view.context("dashboard fetch cycle was abandoned");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::models::{HeatmapCell, SubscriptionTier};
    use crate::recommend::RecommendationKind;

    struct StubSource {
        failing: Vec<Slice>,
        locked: bool,
        stall_for: Option<Uuid>,
        completed: AtomicUsize,
    }

    impl StubSource {
        fn healthy() -> Self {
            Self {
                failing: Vec::new(),
                locked: false,
                stall_for: None,
                completed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AnalyticsSource for StubSource {
        async fn fetch(&self, slice: Slice, params: &DashboardParams) -> Result<SliceData, SliceError> {
            if self.stall_for == Some(params.child_id) {
                std::future::pending::<()>().await;
            }
            self.completed.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(&slice) {
                return Err(SliceError::Failed("connection reset".into()));
            }
            Ok(match slice {
                Slice::Comprehensive => SliceData::Comprehensive(ComprehensiveSummary {
                    total_attempts: 40,
                    accuracy: 82.0,
                    streak_days: 1,
                    ..ComprehensiveSummary::default()
                }),
                Slice::Readiness => SliceData::Readiness(ReadinessScoreData::default()),
                Slice::Heatmap => SliceData::Heatmap(Heatmap {
                    cells: vec![HeatmapCell {
                        subject: "mathematics".into(),
                        topic: "Fractions".into(),
                        accuracy: 42.0,
                        ..HeatmapCell::default()
                    }],
                    subjects: vec!["mathematics".into()],
                }),
                Slice::Benchmark if self.locked => return Err(SliceError::Locked),
                Slice::Benchmark => SliceData::Benchmark(BenchmarkData::InsufficientData {
                    cohort_size: 2,
                    minimum: 5,
                }),
                Slice::LearningHealth => SliceData::LearningHealth(LearningHealth::default()),
            })
        }
    }

    #[tokio::test]
    async fn one_failed_slice_leaves_the_rest_populated() {
        let source = StubSource {
            failing: vec![Slice::Readiness],
            ..StubSource::healthy()
        };
        let view = fetch_dashboard(&source, &DashboardParams::new(Uuid::new_v4())).await;

        assert!(view.readiness.is_none());
        assert!(matches!(view.status_of(Slice::Readiness), Some(SliceStatus::Failed(_))));
        assert!(view.comprehensive.is_some());
        assert!(view.heatmap.is_some());
        assert!(view.benchmark.is_some());
        assert!(view.learning_health.is_some());
        assert_eq!(view.status.len(), 5);
    }

    #[tokio::test]
    async fn locked_benchmark_degrades_without_blocking() {
        let source = StubSource {
            locked: true,
            ..StubSource::healthy()
        };
        let view = fetch_dashboard(&source, &DashboardParams::new(Uuid::new_v4())).await;
        assert_eq!(view.status_of(Slice::Benchmark), Some(&SliceStatus::Locked));
        assert!(view.benchmark.is_none());
        assert_eq!(view.status_of(Slice::Heatmap), Some(&SliceStatus::Loaded));
    }

    #[tokio::test]
    async fn view_recommendations_use_fetched_slices() {
        let view = fetch_dashboard(&StubSource::healthy(), &DashboardParams::new(Uuid::new_v4())).await;
        let kinds: Vec<_> = view.recommendations().iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RecommendationKind::WeakTopic,
                RecommendationKind::Consistency,
                RecommendationKind::Challenge
            ]
        );
    }

    #[tokio::test]
    async fn focus_areas_follow_the_heatmap_slice() {
        let params = DashboardParams::new(Uuid::new_v4());
        let view = fetch_dashboard(&StubSource::healthy(), &params).await;
        let areas = view.focus_areas();
        assert_eq!(areas.len(), 1);
        assert_eq!(areas[0].topic, "Fractions");
        assert_eq!(areas[0].priority, recommend::Priority::High);

        let source = StubSource {
            failing: vec![Slice::Heatmap],
            ..StubSource::healthy()
        };
        let view = fetch_dashboard(&source, &params).await;
        assert!(view.focus_areas().is_empty());
        assert!(matches!(view.status_of(Slice::Heatmap), Some(SliceStatus::Failed(_))));
    }

    #[test]
    fn tier_badges_decode_alongside_levels() {
        let decoded = decode_slice(
            Slice::Readiness,
            Some(serde_json::json!({
                "hasData": true,
                "overallScore": 72,
                "tier": "good",
                "tierBadge": {"label": "Good", "color": "blue"}
            })),
        )
        .unwrap();
        match decoded {
            SliceData::Readiness(readiness) => {
                assert_eq!(readiness.tier_badge, readiness.tier.badge());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn reload_abandons_the_previous_cycle() {
        let stalled = Uuid::new_v4();
        let wanted = Uuid::new_v4();
        let source = Arc::new(StubSource {
            stall_for: Some(stalled),
            ..StubSource::healthy()
        });
        let mut loader = DashboardLoader::new(source.clone());
        let mut updates = loader.subscribe();

        loader.load(DashboardParams::new(stalled));
        assert!(loader.is_loading());
        loader.load(DashboardParams::new(wanted));

        let view = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                updates.changed().await.unwrap();
                if let Some(view) = updates.borrow_and_update().view.clone() {
                    break view;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(view.params.child_id, wanted);
        assert!(!loader.is_loading());
        assert_eq!(source.completed.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn close_stops_publishing() {
        let stalled = Uuid::new_v4();
        let mut loader = DashboardLoader::new(Arc::new(StubSource {
            stall_for: Some(stalled),
            ..StubSource::healthy()
        }));
        let updates = loader.subscribe();
        loader.load(DashboardParams::new(stalled));
        loader.close();

        let state = updates.borrow().clone();
        assert!(!state.loading);
        assert!(state.view.is_none());
        assert_eq!(state.generation, 2);
    }

    #[test]
    fn locked_benchmark_payload_maps_to_locked() {
        let payload = serde_json::to_value(BenchmarkData::Locked {
            required_tier: SubscriptionTier::Summit,
        })
        .unwrap();
        assert_eq!(
            decode_slice(Slice::Benchmark, Some(payload)),
            Err(SliceError::Locked)
        );
    }

    #[test]
    fn missing_fields_default_instead_of_failing() {
        let decoded = decode_slice(Slice::Comprehensive, Some(serde_json::json!({"accuracy": 71.5}))).unwrap();
        match decoded {
            SliceData::Comprehensive(summary) => {
                assert_eq!(summary.accuracy, 71.5);
                assert_eq!(summary.total_attempts, 0);
                assert!(summary.subjects.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            decode_slice(Slice::Heatmap, None).unwrap(),
            SliceData::Heatmap(Heatmap::default())
        );
    }

    #[test]
    fn explicit_days_override_range() {
        let mut params = DashboardParams::new(Uuid::nil());
        assert_eq!(params.effective_days(), 30);
        params.range = "all".parse().unwrap();
        assert_eq!(params.effective_days(), 365);
        params.days = Some(14);
        assert_eq!(params.effective_days(), 14);
        assert!(params.query_string().ends_with("range=all&days=14"));
        assert!("12d".parse::<Range>().is_err());
    }
}
