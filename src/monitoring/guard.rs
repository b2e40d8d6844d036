//! Telemetry guard
//!
//! Feeds a rolling window of telemetry to an external anomaly-scoring oracle and
//! acts on its verdicts: a confined process whose score crosses the kill threshold
//! is killed, significant changes in the verdict are reported, and a final
//! verdict is reported when the execution ends. The scoring model itself lives
//! behind [`AnomalyOracle`].

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::execution::launcher::kill_process_group;
use crate::monitoring::fd::DescriptorSource;
use crate::monitoring::tailer::{TelemetryBatch, TelemetrySample};

/// Who is being scored
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    pub run_id: String,
    pub pid: u32,
    pub command: Vec<String>,
    pub jail_root: Option<PathBuf>,
}

/// Payload sent to the oracle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringRequest {
    pub samples: Vec<TelemetrySample>,
    pub run_context: RunContext,
}

/// Model output; fields beyond score and label are kept opaque
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub anomaly_score: f64,
    pub label: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Oracle response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assessment {
    pub analysis_id: String,
    pub analysis: Analysis,
    #[serde(default)]
    pub snapshot: serde_json::Value,
    #[serde(default)]
    pub source: String,
}

/// Anomaly-scoring collaborator
pub trait AnomalyOracle: Send + Sync {
    fn score(&self, request: &ScoringRequest) -> Result<Assessment>;
}

/// Thresholds for scoring and acting
#[derive(Debug, Clone, PartialEq)]
pub struct GuardPolicy {
    /// Samples required before the oracle is consulted
    pub min_samples: usize,
    /// Score at or above which the process is killed
    pub kill_threshold: f64,
    /// Label a verdict must carry to kill; any label qualifies when unset
    pub kill_label: Option<String>,
    /// Largest number of samples sent per scoring request
    pub window: usize,
    /// Score movement that triggers an update report
    pub report_delta: f64,
}

impl GuardPolicy {
    /// Whether a verdict is severe enough to kill
    pub fn demands_kill(&self, analysis: &Analysis) -> bool {
        let label_matches = match &self.kill_label {
            Some(label) => analysis.label == *label,
            None => true,
        };
        analysis.anomaly_score >= self.kill_threshold && label_matches
    }
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            min_samples: 8,
            kill_threshold: 0.85,
            kill_label: Some("malicious".to_string()),
            window: 240,
            report_delta: 0.2,
        }
    }
}

/// What the guard did about a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GuardAction {
    Update,
    Terminated,
    SkipTermination,
    Exit,
}

/// Published as an `anomaly` event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyReport {
    pub action: GuardAction,
    pub pid: u32,
    pub analysis_id: String,
    pub anomaly_score: f64,
    pub label: String,
    pub source: String,
    pub sample_count: usize,
}

/// The process a guard may act on
pub trait GuardTarget: Send {
    /// Whether the process currently runs inside its jail
    fn is_confined(&self) -> bool;
    fn terminate(&self) -> Result<()>;
}

/// Targets the execution's process group; confinement is judged by its working directory
pub struct ProcessGroupTarget {
    pid: u32,
    jail_root: Option<PathBuf>,
    source: Arc<dyn DescriptorSource>,
}

impl ProcessGroupTarget {
    pub fn new(pid: u32, jail_root: Option<PathBuf>, source: Arc<dyn DescriptorSource>) -> Self {
        Self {
            pid,
            jail_root,
            source,
        }
    }
}

impl GuardTarget for ProcessGroupTarget {
    fn is_confined(&self) -> bool {
        let Some(root) = &self.jail_root else {
            return false;
        };
        self.source
            .process_cwd(self.pid)
            .is_some_and(|cwd| cwd.starts_with(root))
    }

    fn terminate(&self) -> Result<()> {
        kill_process_group(self.pid)
    }
}

/// Per-execution guard state
pub struct TelemetryGuard {
    policy: GuardPolicy,
    oracle: Arc<dyn AnomalyOracle>,
    target: Box<dyn GuardTarget>,
    context: RunContext,
    window: VecDeque<TelemetrySample>,
    last_reported: Option<(String, f64)>,
    last_assessment: Option<Assessment>,
    terminated: bool,
    finished: bool,
}

impl TelemetryGuard {
    pub fn new(
        policy: GuardPolicy,
        oracle: Arc<dyn AnomalyOracle>,
        target: Box<dyn GuardTarget>,
        context: RunContext,
    ) -> Self {
        Self {
            policy,
            oracle,
            target,
            context,
            window: VecDeque::new(),
            last_reported: None,
            last_assessment: None,
            terminated: false,
            finished: false,
        }
    }

    /// Add a batch to the window and score it; returns a report when one is due
    pub fn observe(&mut self, batch: &TelemetryBatch) -> Option<AnomalyReport> {
        if self.finished {
            return None;
        }

        self.window.extend(batch.samples.iter().cloned());
        while self.window.len() > self.policy.window.max(1) {
            self.window.pop_front();
        }
        if self.window.len() < self.policy.min_samples {
            return None;
        }

        let request = ScoringRequest {
            samples: self.window.iter().cloned().collect(),
            run_context: self.context.clone(),
        };
        let assessment = match self.oracle.score(&request) {
            Ok(assessment) => assessment,
            Err(e) => {
                warn!("Anomaly oracle failed for {}: {}", self.context.run_id, e);
                return None;
            }
        };
        debug!(
            "Oracle verdict for {}: {} ({:.2})",
            self.context.run_id, assessment.analysis.label, assessment.analysis.anomaly_score
        );

        let score = assessment.analysis.anomaly_score;
        let report = if self.policy.demands_kill(&assessment.analysis) {
            self.finished = true;
            if self.target.is_confined() {
                match self.target.terminate() {
                    Ok(()) => info!(
                        "Terminated pid {} with anomaly score {:.2}",
                        self.context.pid, score
                    ),
                    Err(e) => warn!("Failed to terminate pid {}: {}", self.context.pid, e),
                }
                self.terminated = true;
                Some(self.report(GuardAction::Terminated, &assessment))
            } else {
                warn!(
                    "Anomaly score {:.2} for pid {} but it is not confined; not terminating",
                    score, self.context.pid
                );
                Some(self.report(GuardAction::SkipTermination, &assessment))
            }
        } else if self.is_significant_change(&assessment) {
            self.last_reported = Some((assessment.analysis.label.clone(), score));
            Some(self.report(GuardAction::Update, &assessment))
        } else {
            None
        };

        self.last_assessment = Some(assessment);
        report
    }

    /// Final verdict when the execution ends, unless the guard already killed it
    pub fn finish(&mut self) -> Option<AnomalyReport> {
        if self.terminated {
            return None;
        }
        self.finished = true;
        let assessment = self.last_assessment.take()?;
        Some(self.report(GuardAction::Exit, &assessment))
    }

    fn is_significant_change(&self, assessment: &Assessment) -> bool {
        match &self.last_reported {
            None => true,
            Some((label, score)) => {
                *label != assessment.analysis.label
                    || (assessment.analysis.anomaly_score - score).abs() >= self.policy.report_delta
            }
        }
    }

    fn report(&self, action: GuardAction, assessment: &Assessment) -> AnomalyReport {
        AnomalyReport {
            action,
            pid: self.context.pid,
            analysis_id: assessment.analysis_id.clone(),
            anomaly_score: assessment.analysis.anomaly_score,
            label: assessment.analysis.label.clone(),
            source: assessment.source.clone(),
            sample_count: self.window.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::JailwatchError;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedOracle {
        scores: Mutex<VecDeque<Result<(f64, &'static str)>>>,
        calls: AtomicUsize,
        last_len: AtomicUsize,
    }

    impl ScriptedOracle {
        fn new(scores: Vec<Result<(f64, &'static str)>>) -> Arc<Self> {
            Arc::new(Self {
                scores: Mutex::new(scores.into()),
                calls: AtomicUsize::new(0),
                last_len: AtomicUsize::new(0),
            })
        }
    }

    impl AnomalyOracle for ScriptedOracle {
        fn score(&self, request: &ScoringRequest) -> Result<Assessment> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_len.store(request.samples.len(), Ordering::SeqCst);
            let (score, label) = self
                .scores
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok((0.0, "benign")))?;
            Ok(Assessment {
                analysis_id: format!("a-{}", n),
                analysis: Analysis {
                    anomaly_score: score,
                    label: label.to_string(),
                    extra: Default::default(),
                },
                snapshot: serde_json::Value::Null,
                source: "test".to_string(),
            })
        }
    }

    struct FakeTarget {
        confined: bool,
        killed: Arc<AtomicBool>,
    }

    impl GuardTarget for FakeTarget {
        fn is_confined(&self) -> bool {
            self.confined
        }
        fn terminate(&self) -> Result<()> {
            self.killed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn batch(n: usize) -> TelemetryBatch {
        TelemetryBatch {
            samples: (0..n)
                .map(|i| TelemetrySample {
                    timestamp: Utc::now(),
                    cpu_percent: i as f64,
                    rss_bytes: 0,
                    vms_bytes: 0,
                    threads: 1,
                    fds_open: 3,
                    read_bytes: 0,
                    write_bytes: 0,
                })
                .collect(),
        }
    }

    fn guard(oracle: Arc<ScriptedOracle>, confined: bool) -> (TelemetryGuard, Arc<AtomicBool>) {
        guard_with(oracle, confined, GuardPolicy::default())
    }

    fn guard_with(
        oracle: Arc<ScriptedOracle>,
        confined: bool,
        policy: GuardPolicy,
    ) -> (TelemetryGuard, Arc<AtomicBool>) {
        let killed = Arc::new(AtomicBool::new(false));
        let target = FakeTarget {
            confined,
            killed: Arc::clone(&killed),
        };
        let context = RunContext {
            run_id: "run".to_string(),
            pid: 99,
            command: vec!["prog".to_string()],
            jail_root: Some(PathBuf::from("/srv/jail")),
        };
        (
            TelemetryGuard::new(policy, oracle, Box::new(target), context),
            killed,
        )
    }

    #[test]
    fn waits_for_minimum_samples() {
        let oracle = ScriptedOracle::new(vec![]);
        let (mut guard, _) = guard(Arc::clone(&oracle), true);

        assert!(guard.observe(&batch(7)).is_none());
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);

        let report = guard.observe(&batch(1)).unwrap();
        assert_eq!(report.action, GuardAction::Update);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn window_is_bounded() {
        let oracle = ScriptedOracle::new(vec![]);
        let (mut guard, _) = guard(Arc::clone(&oracle), true);
        guard.observe(&batch(300));
        assert_eq!(oracle.last_len.load(Ordering::SeqCst), 240);
    }

    #[test]
    fn updates_only_on_significant_change() {
        let oracle = ScriptedOracle::new(vec![
            Ok((0.1, "benign")),
            Ok((0.2, "benign")),
            Ok((0.45, "benign")),
            Ok((0.5, "suspicious")),
        ]);
        let (mut guard, _) = guard(oracle, true);

        let actions: Vec<Option<GuardAction>> = (0..4)
            .map(|_| guard.observe(&batch(8)).map(|r| r.action))
            .collect();
        assert_eq!(
            actions,
            vec![
                Some(GuardAction::Update),
                None,
                Some(GuardAction::Update),
                Some(GuardAction::Update)
            ]
        );
    }

    #[test]
    fn terminates_confined_process_and_stops_scoring() {
        let oracle = ScriptedOracle::new(vec![Ok((0.9, "malicious"))]);
        let (mut guard, killed) = guard(Arc::clone(&oracle), true);

        let report = guard.observe(&batch(8)).unwrap();
        assert_eq!(report.action, GuardAction::Terminated);
        assert!(killed.load(Ordering::SeqCst));

        assert!(guard.observe(&batch(8)).is_none());
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
        assert!(guard.finish().is_none());
    }

    #[test]
    fn high_score_with_other_label_does_not_kill() {
        let oracle = ScriptedOracle::new(vec![Ok((0.97, "benign"))]);
        let (mut guard, killed) = guard(Arc::clone(&oracle), true);

        let report = guard.observe(&batch(8)).unwrap();
        assert_eq!(report.action, GuardAction::Update);
        assert!(!killed.load(Ordering::SeqCst));

        // Scoring goes on
        guard.observe(&batch(1));
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unset_kill_label_kills_on_score_alone() {
        let policy = GuardPolicy {
            kill_label: None,
            ..Default::default()
        };
        let oracle = ScriptedOracle::new(vec![Ok((0.9, "cryptominer"))]);
        let (mut guard, killed) = guard_with(oracle, true, policy);

        assert_eq!(guard.observe(&batch(8)).unwrap().action, GuardAction::Terminated);
        assert!(killed.load(Ordering::SeqCst));
    }

    #[test]
    fn skips_termination_when_not_confined() {
        let oracle = ScriptedOracle::new(vec![Ok((0.95, "malicious"))]);
        let (mut guard, killed) = guard(oracle, false);

        let report = guard.observe(&batch(8)).unwrap();
        assert_eq!(report.action, GuardAction::SkipTermination);
        assert!(!killed.load(Ordering::SeqCst));

        let last = guard.finish().unwrap();
        assert_eq!(last.action, GuardAction::Exit);
    }

    #[test]
    fn oracle_errors_are_ignored() {
        let oracle = ScriptedOracle::new(vec![
            Err(JailwatchError::Oracle("unreachable".into())),
            Ok((0.3, "benign")),
        ]);
        let (mut guard, _) = guard(oracle, true);

        assert!(guard.observe(&batch(8)).is_none());
        assert_eq!(guard.observe(&batch(1)).unwrap().action, GuardAction::Update);
    }

    #[test]
    fn finish_without_verdict_is_silent() {
        let (mut guard, _) = guard(ScriptedOracle::new(vec![]), true);
        assert!(guard.finish().is_none());
    }

    #[test]
    fn assessment_parses_camel_case_and_keeps_extras() {
        let assessment: Assessment = serde_json::from_str(
            r#"{"analysisId":"x1","analysis":{"anomalyScore":0.4,"label":"benign","topFeatures":["cpu"]},"source":"lstm"}"#,
        )
        .unwrap();
        assert_eq!(assessment.analysis.anomaly_score, 0.4);
        assert!(assessment.analysis.extra.contains_key("topFeatures"));
        assert!(assessment.snapshot.is_null());
    }

    #[test]
    fn report_serializes_kebab_case_action() {
        let report = AnomalyReport {
            action: GuardAction::SkipTermination,
            pid: 1,
            analysis_id: "a".into(),
            anomaly_score: 0.9,
            label: "malicious".into(),
            source: "s".into(),
            sample_count: 8,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["action"], "skip-termination");
        assert_eq!(json["anomalyScore"], 0.9);
    }
}
