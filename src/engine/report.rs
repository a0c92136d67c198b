use crate::analysis::heuristics::ObfuscationSummary;
use crate::transform::{Category, SkippedMethod};
use crate::verifier::VerificationStatus;
use serde::Serialize;

/// Where a run is in its life cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum RunState {
    Idle,
    Loading,
    Running { transformer: usize, of: usize },
    Verifying,
    Done,
    Aborted { reason: AbortReason },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbortReason {
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "kebab-case")]
pub enum LoadStatus {
    Loaded,
    MalformedClass(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "kebab-case")]
pub enum Outcome {
    Unchanged,
    Changed,
    Failed(String),
}

/// What happened to a class entry when the archive was written
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "kebab-case")]
pub enum WriteStatus {
    /// Original bytes, since nothing changed
    Original,

    /// Exported from the transformed class
    Rewritten,

    /// Transformed, but the original bytes were written instead
    Reverted(String),
}

/// One transformer applied to one class
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransformResult {
    pub transformer: String,
    pub category: Category,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub log: Vec<String>,

    /// Methods the transformer could not analyze
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedMethod>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassReport {
    /// Entry name in the input archive
    pub entry: String,

    /// Class name at the end of the run (absent for malformed classes)
    pub class: Option<String>,
    pub load: LoadStatus,
    pub initial_verification: Option<VerificationStatus>,
    pub final_verification: Option<VerificationStatus>,
    pub results: Vec<TransformResult>,
    pub heuristics: Option<ObfuscationSummary>,
    pub written: WriteStatus,
}

impl ClassReport {
    pub(crate) fn malformed(entry: &str, reason: String) -> ClassReport {
        ClassReport {
            entry: entry.to_owned(),
            class: None,
            load: LoadStatus::MalformedClass(reason),
            initial_verification: None,
            final_verification: None,
            results: vec![],
            heuristics: None,
            written: WriteStatus::Original,
        }
    }

    pub fn is_changed(&self) -> bool {
        self.results
            .iter()
            .any(|result| result.outcome == Outcome::Changed)
    }

    pub fn has_failures(&self) -> bool {
        self.results
            .iter()
            .any(|result| matches!(result.outcome, Outcome::Failed(_)))
    }

    /// Result of the named transformer, if it ran on this class
    pub fn result(&self, transformer: &str) -> Option<&TransformResult> {
        self.results
            .iter()
            .find(|result| result.transformer == transformer)
    }

    /// Every method some transformer skipped, with the transformer name
    pub fn skipped_methods(&self) -> impl Iterator<Item = (&str, &SkippedMethod)> + '_ {
        self.results.iter().flat_map(|result| {
            result
                .skipped
                .iter()
                .map(move |skipped| (result.transformer.as_str(), skipped))
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub loaded: usize,
    pub malformed: usize,
    pub changed: usize,
    pub failed: usize,
    pub valid: usize,
    pub invalid: usize,
    pub reverted: usize,
    pub resources: usize,
}

/// Structured record of a pipeline run
///
/// This is the only thing a front end should need: it names classes, transformers, and outcomes
/// with plain strings and never exposes the class model.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub state: RunState,

    /// Transformers in the order they ran
    pub transformers: Vec<String>,
    pub classes: Vec<ClassReport>,
    pub summary: Summary,
}

impl ExecutionReport {
    pub(crate) fn new(transformers: Vec<String>) -> ExecutionReport {
        ExecutionReport {
            state: RunState::Idle,
            transformers,
            classes: vec![],
            summary: Summary::default(),
        }
    }

    pub(crate) fn enter(&mut self, state: RunState) {
        log::debug!("run state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Report for the class read from this archive entry
    pub fn class_entry(&self, entry: &str) -> Option<&ClassReport> {
        self.classes.iter().find(|class| class.entry == entry)
    }

    /// Report for the class with this (final) name
    pub fn class(&self, name: &str) -> Option<&ClassReport> {
        self.classes
            .iter()
            .find(|class| class.class.as_deref() == Some(name))
    }

    pub(crate) fn summarize(&mut self, resources: usize) {
        let mut summary = Summary {
            resources,
            ..Summary::default()
        };
        for class in &self.classes {
            match class.load {
                LoadStatus::Loaded => summary.loaded += 1,
                LoadStatus::MalformedClass(_) => summary.malformed += 1,
            }
            if class.is_changed() {
                summary.changed += 1;
            }
            if class.has_failures() {
                summary.failed += 1;
            }
            match &class.final_verification {
                Some(VerificationStatus::Valid) => summary.valid += 1,
                Some(VerificationStatus::Invalid(_)) => summary.invalid += 1,
                None => (),
            }
            if matches!(class.written, WriteStatus::Reverted(_)) {
                summary.reverted += 1;
            }
        }
        self.summary = summary;
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
