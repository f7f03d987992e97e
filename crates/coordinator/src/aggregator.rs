//! Collects per-engine results for one logical task and scores them
//! against each other.
//!
//! A comparison group is opened with
//! [`register_expectation`](ResultAggregator::register_expectation), fed by
//! [`record`](ResultAggregator::record) and
//! [`record_failure`](ResultAggregator::record_failure), and frozen into a
//! [`ComparisonResult`] the first time a waiter sees every engine report or
//! its timeout elapse. Reports arriving after that are ignored.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lingosub_core::capability::EngineCapability;
use lingosub_core::error::ErrorCode;
use lingosub_core::similarity::{score, ScoreInput, ScoringPolicy};
use lingosub_core::types::TaskId;
use lingosub_events::{CoordinatorEvent, EventBus};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregatorError {
    #[error("no comparison registered for task {0}")]
    UnknownGroup(TaskId),

    #[error("comparison for task {0} is already registered")]
    AlreadyRegistered(TaskId),

    #[error("a comparison needs at least one engine")]
    NoEngines,
}

impl AggregatorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AggregatorError::UnknownGroup(_) => ErrorCode::TaskNotFound,
            AggregatorError::AlreadyRegistered(_) | AggregatorError::NoEngines => {
                ErrorCode::InvalidParams
            }
        }
    }
}

/// One engine's transcription as reported by its worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineResult {
    pub text: String,
    pub confidence: Option<f64>,
    /// The full result object as the engine sent it.
    pub raw: Value,
}

impl EngineResult {
    /// Extract `text` and `confidence` from an engine's result object.
    /// Returns `None` when there is no `text` string.
    pub fn from_value(raw: Value) -> Option<Self> {
        let text = raw.get("text")?.as_str()?.to_string();
        let confidence = raw.get("confidence").and_then(Value::as_f64);
        Some(Self {
            text,
            confidence,
            raw,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonStatus {
    /// Every expected engine produced a result.
    Complete,
    /// At least one engine failed or did not report in time.
    Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredResult {
    pub engine: EngineCapability,
    pub result: EngineResult,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairSimilarity {
    pub a: EngineCapability,
    pub b: EngineCapability,
    pub similarity: f64,
}

/// Scored comparison of the engines that reported for one logical task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonResult {
    pub task_id: TaskId,
    pub status: ComparisonStatus,
    /// In arrival order.
    pub results: Vec<ScoredResult>,
    pub pairwise: Vec<PairSimilarity>,
    pub recommended: Option<EngineCapability>,
    pub failed: Vec<EngineCapability>,
    /// Expected engines that neither succeeded nor failed in time.
    pub missing: Vec<EngineCapability>,
}

impl ComparisonResult {
    pub fn is_partial(&self) -> bool {
        self.status == ComparisonStatus::Partial
    }
}

struct Group {
    expected: Vec<EngineCapability>,
    results: Vec<(EngineCapability, EngineResult)>,
    failed: Vec<EngineCapability>,
    artifact: Option<ComparisonResult>,
    ready: watch::Sender<bool>,
}

impl Group {
    fn has_reported(&self, engine: EngineCapability) -> bool {
        self.failed.contains(&engine) || self.results.iter().any(|(e, _)| *e == engine)
    }

    fn all_reported(&self) -> bool {
        self.expected.iter().all(|e| self.has_reported(*e))
    }
}

pub const DEFAULT_RETAINED_COMPARISONS: usize = 1_000;

pub struct ResultAggregator {
    groups: Mutex<HashMap<TaskId, Group>>,
    /// Frozen groups, oldest first. Only these are ever evicted.
    frozen: Mutex<VecDeque<TaskId>>,
    retained: usize,
    policy: ScoringPolicy,
    events: Arc<EventBus>,
}

impl ResultAggregator {
    pub fn new(policy: ScoringPolicy, events: Arc<EventBus>) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            frozen: Mutex::new(VecDeque::new()),
            retained: DEFAULT_RETAINED_COMPARISONS,
            policy,
            events,
        }
    }

    /// Keep at most `retained` frozen comparisons; older ones are forgotten.
    pub fn with_retention(mut self, retained: usize) -> Self {
        self.retained = retained.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, Group>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a comparison expecting one report from each of `engines`.
    pub fn register_expectation(
        &self,
        task_id: TaskId,
        engines: &[EngineCapability],
    ) -> Result<(), AggregatorError> {
        if engines.is_empty() {
            return Err(AggregatorError::NoEngines);
        }
        let mut groups = self.lock();
        if groups.contains_key(&task_id) {
            return Err(AggregatorError::AlreadyRegistered(task_id));
        }
        let mut expected: Vec<EngineCapability> = Vec::with_capacity(engines.len());
        for engine in engines {
            if !expected.contains(engine) {
                expected.push(*engine);
            }
        }
        let (ready, _) = watch::channel(false);
        groups.insert(
            task_id,
            Group {
                expected,
                results: Vec::new(),
                failed: Vec::new(),
                artifact: None,
                ready,
            },
        );
        tracing::debug!(task_id = %task_id, engines = ?engines, "Comparison registered");
        Ok(())
    }

    /// Store one engine's result.
    pub fn record(
        &self,
        task_id: TaskId,
        engine: EngineCapability,
        result: EngineResult,
    ) -> Result<(), AggregatorError> {
        self.report(task_id, engine, Some(result))
    }

    /// Note that an engine will not produce a result.
    pub fn record_failure(
        &self,
        task_id: TaskId,
        engine: EngineCapability,
    ) -> Result<(), AggregatorError> {
        self.report(task_id, engine, None)
    }

    fn report(
        &self,
        task_id: TaskId,
        engine: EngineCapability,
        result: Option<EngineResult>,
    ) -> Result<(), AggregatorError> {
        let mut groups = self.lock();
        let group = groups
            .get_mut(&task_id)
            .ok_or(AggregatorError::UnknownGroup(task_id))?;

        if group.artifact.is_some() {
            tracing::debug!(task_id = %task_id, engine = %engine, "Late report after comparison was finalized");
            return Ok(());
        }
        if !group.expected.contains(&engine) {
            tracing::warn!(task_id = %task_id, engine = %engine, "Report from an engine the comparison does not expect");
            return Ok(());
        }
        if group.has_reported(engine) {
            tracing::warn!(task_id = %task_id, engine = %engine, "Duplicate report ignored");
            return Ok(());
        }

        match result {
            Some(result) => group.results.push((engine, result)),
            None => group.failed.push(engine),
        }
        if group.all_reported() {
            group.ready.send_replace(true);
        }
        Ok(())
    }

    /// Wait until every expected engine reported or `timeout` elapsed, then
    /// return the (frozen) comparison.
    pub async fn await_comparison(
        &self,
        task_id: TaskId,
        timeout: Duration,
    ) -> Result<ComparisonResult, AggregatorError> {
        let deadline = Instant::now() + timeout;
        let mut ready = {
            let groups = self.lock();
            let group = groups
                .get(&task_id)
                .ok_or(AggregatorError::UnknownGroup(task_id))?;
            if let Some(artifact) = &group.artifact {
                return Ok(artifact.clone());
            }
            group.ready.subscribe()
        };

        if tokio::time::timeout_at(deadline, ready.wait_for(|done| *done))
            .await
            .is_err()
        {
            tracing::info!(task_id = %task_id, timeout_ms = timeout.as_millis() as u64, "Comparison wait timed out");
        }

        self.finalize(task_id)
    }

    /// The frozen comparison, if it has been produced.
    pub fn comparison(&self, task_id: TaskId) -> Option<ComparisonResult> {
        self.lock().get(&task_id).and_then(|g| g.artifact.clone())
    }

    /// Whether the group is still known, open or frozen.
    pub fn is_registered(&self, task_id: TaskId) -> bool {
        self.lock().contains_key(&task_id)
    }

    fn finalize(&self, task_id: TaskId) -> Result<ComparisonResult, AggregatorError> {
        let mut groups = self.lock();
        let group = groups
            .get_mut(&task_id)
            .ok_or(AggregatorError::UnknownGroup(task_id))?;
        if let Some(artifact) = &group.artifact {
            return Ok(artifact.clone());
        }

        let artifact = build(task_id, group, &self.policy);
        group.artifact = Some(artifact.clone());
        group.ready.send_replace(true);

        let mut frozen = self.frozen.lock().unwrap_or_else(PoisonError::into_inner);
        frozen.push_back(task_id);
        while frozen.len() > self.retained {
            let Some(old) = frozen.pop_front() else {
                break;
            };
            groups.remove(&old);
            tracing::debug!(task_id = %old, "Comparison evicted");
        }
        drop(frozen);
        drop(groups);

        tracing::info!(
            task_id = %task_id,
            status = ?artifact.status,
            recommended = ?artifact.recommended,
            results = artifact.results.len(),
            "Comparison ready",
        );
        self.events.publish(CoordinatorEvent::ComparisonReady {
            task_id,
            partial: artifact.is_partial(),
        });
        Ok(artifact)
    }
}

fn build(task_id: TaskId, group: &Group, policy: &ScoringPolicy) -> ComparisonResult {
    let inputs: Vec<ScoreInput<'_>> = group
        .results
        .iter()
        .map(|(_, r)| ScoreInput {
            text: &r.text,
            confidence: r.confidence,
        })
        .collect();
    let card = score(&inputs, policy);

    let engine_at = |i: usize| group.results[i].0;
    let pairwise = card
        .pairwise
        .iter()
        .map(|&(i, j, similarity)| PairSimilarity {
            a: engine_at(i),
            b: engine_at(j),
            similarity,
        })
        .collect();
    let results = group
        .results
        .iter()
        .zip(&card.scores)
        .map(|((engine, result), score)| ScoredResult {
            engine: *engine,
            result: result.clone(),
            score: *score,
        })
        .collect();
    let missing: Vec<EngineCapability> = group
        .expected
        .iter()
        .copied()
        .filter(|e| !group.has_reported(*e))
        .collect();
    let status = if group.results.len() == group.expected.len() {
        ComparisonStatus::Complete
    } else {
        ComparisonStatus::Partial
    };

    ComparisonResult {
        task_id,
        status,
        results,
        pairwise,
        recommended: card.best.map(engine_at),
        failed: group.failed.clone(),
        missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(text: &str, confidence: f64) -> EngineResult {
        EngineResult::from_value(json!({"text": text, "confidence": confidence})).unwrap()
    }

    fn aggregator() -> (ResultAggregator, tokio::sync::broadcast::Receiver<lingosub_events::EventEnvelope>) {
        let bus = Arc::new(EventBus::default());
        let rx = bus.subscribe();
        (ResultAggregator::new(ScoringPolicy::default(), bus), rx)
    }

    #[test]
    fn engine_result_requires_text() {
        assert!(EngineResult::from_value(json!({"confidence": 0.3})).is_none());
        let r = EngineResult::from_value(json!({"text": "hi", "segments": []})).unwrap();
        assert_eq!(r.confidence, None);
        assert_eq!(r.raw["segments"], json!([]));
    }

    #[tokio::test]
    async fn complete_when_every_engine_reports() {
        let (agg, mut events) = aggregator();
        let id = TaskId::from_raw(1);
        let engines = [EngineCapability::Whisper, EngineCapability::FunAsr, EngineCapability::SenseVoice];
        agg.register_expectation(id, &engines).unwrap();

        agg.record(id, EngineCapability::FunAsr, result("the cat sat", 0.5)).unwrap();
        agg.record(id, EngineCapability::Whisper, result("the cat sat", 0.9)).unwrap();
        agg.record(id, EngineCapability::SenseVoice, result("a dog ran", 0.99)).unwrap();

        let cmp = agg.await_comparison(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(cmp.status, ComparisonStatus::Complete);
        assert_eq!(cmp.results.len(), 3);
        assert_eq!(cmp.results[0].engine, EngineCapability::FunAsr);
        assert_eq!(cmp.pairwise.len(), 3);
        assert_eq!(cmp.recommended, Some(EngineCapability::Whisper));
        assert!(cmp.missing.is_empty());

        let event = events.try_recv().unwrap().event;
        assert!(matches!(event, CoordinatorEvent::ComparisonReady { partial: false, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_yields_partial_with_arrived_results_only() {
        let (agg, _events) = aggregator();
        let id = TaskId::from_raw(2);
        agg.register_expectation(id, &[EngineCapability::Whisper, EngineCapability::FunAsr])
            .unwrap();
        agg.record(id, EngineCapability::Whisper, result("hello", 0.8)).unwrap();

        let cmp = agg.await_comparison(id, Duration::from_secs(30)).await.unwrap();
        assert!(cmp.is_partial());
        assert_eq!(cmp.results.len(), 1);
        assert_eq!(cmp.missing, vec![EngineCapability::FunAsr]);
        assert_eq!(cmp.recommended, Some(EngineCapability::Whisper));

        // Frozen: a late report changes nothing.
        agg.record(id, EngineCapability::FunAsr, result("hello", 1.0)).unwrap();
        assert_eq!(agg.comparison(id), Some(cmp));
    }

    #[tokio::test]
    async fn failure_counts_as_reported_but_partial() {
        let (agg, _events) = aggregator();
        let id = TaskId::from_raw(3);
        agg.register_expectation(id, &[EngineCapability::Whisper, EngineCapability::FunAsr])
            .unwrap();
        agg.record_failure(id, EngineCapability::FunAsr).unwrap();
        agg.record(id, EngineCapability::Whisper, result("x", 0.1)).unwrap();

        let cmp = agg.await_comparison(id, Duration::from_secs(60)).await.unwrap();
        assert_eq!(cmp.status, ComparisonStatus::Partial);
        assert_eq!(cmp.failed, vec![EngineCapability::FunAsr]);
        assert!(cmp.missing.is_empty());
    }

    #[tokio::test]
    async fn waiter_wakes_when_last_engine_reports() {
        let (agg, _events) = aggregator();
        let agg = Arc::new(agg);
        let id = TaskId::from_raw(4);
        agg.register_expectation(id, &[EngineCapability::Whisper]).unwrap();

        let waiter = {
            let agg = Arc::clone(&agg);
            tokio::spawn(async move { agg.await_comparison(id, Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        agg.record(id, EngineCapability::Whisper, result("done", 0.7)).unwrap();

        let cmp = waiter.await.unwrap().unwrap();
        assert_eq!(cmp.status, ComparisonStatus::Complete);
    }

    #[tokio::test]
    async fn oldest_frozen_comparisons_are_evicted() {
        let bus = Arc::new(EventBus::default());
        let agg = ResultAggregator::new(ScoringPolicy::default(), bus).with_retention(1);
        let first = TaskId::from_raw(10);
        let second = TaskId::from_raw(11);
        let open = TaskId::from_raw(12);
        for id in [first, second, open] {
            agg.register_expectation(id, &[EngineCapability::Test]).unwrap();
        }

        agg.record(first, EngineCapability::Test, result("one", 0.5)).unwrap();
        agg.await_comparison(first, Duration::from_secs(5)).await.unwrap();
        assert!(agg.is_registered(first));

        agg.record(second, EngineCapability::Test, result("two", 0.5)).unwrap();
        agg.await_comparison(second, Duration::from_secs(5)).await.unwrap();

        assert!(!agg.is_registered(first));
        assert_eq!(agg.comparison(first), None);
        assert!(agg.comparison(second).is_some());
        // Groups still collecting results are never evicted.
        assert!(agg.is_registered(open));
        assert_eq!(
            agg.await_comparison(first, Duration::from_secs(5)).await.unwrap_err(),
            AggregatorError::UnknownGroup(first)
        );
    }

    #[test]
    fn registration_errors() {
        let (agg, _events) = aggregator();
        let id = TaskId::from_raw(5);
        assert_eq!(agg.register_expectation(id, &[]), Err(AggregatorError::NoEngines));
        agg.register_expectation(id, &[EngineCapability::Test]).unwrap();
        let err = agg.register_expectation(id, &[EngineCapability::Test]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParams);

        let unknown = agg
            .record(TaskId::from_raw(99), EngineCapability::Test, result("a", 0.1))
            .unwrap_err();
        assert_eq!(unknown.code(), ErrorCode::TaskNotFound);
    }
}
