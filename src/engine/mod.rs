//! Running a pipeline of transformers over an archive
//!
//! A run goes through `Idle -> Loading -> Running -> Verifying -> Done`, or ends `Aborted` when it
//! is cancelled. Failures of individual classes never end a run: a class which fails to load is
//! passed through untouched, and a transformer which fails (or panics) on a class leaves that
//! class as it was before the transformer ran. Only a bad configuration or archive I/O is fatal,
//! and configuration is checked before anything is loaded.
//!
//! Before every transformer, the engine snapshots the class set into a [`ClassIndex`]. That
//! snapshot is the read-only view every class sees for the length of the transformer, so
//! class-scoped transformers can run on the `rayon` thread pool.

mod class_set;
mod config;
mod report;

pub use class_set::*;
pub use config::*;
pub use report::*;

use crate::analysis::heuristics;
use crate::analysis::ClassHierarchy;
use crate::archive::{Archive, ArchiveError, Entry};
use crate::jvm::model::ClassModel;
use crate::transform::{
    Catalog, ClassIndex, Scope, SkippedMethod, TransformContext, TransformError, Transformer,
};
use crate::verifier::{verify, VerificationStatus};
use rayon::prelude::*;
use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors which end a run
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown transformer or category {0:?}")]
    UnknownTransformer(String),

    #[error("archive I/O failure: {0}")]
    ArchiveIo(#[from] ArchiveError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Handle for cancelling a run from another thread
///
/// Cancellation is checked between transformers, so the class set is always left in a consistent
/// state.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Transformed archive, along with the report of what was done to it
#[derive(Debug)]
pub struct RunOutput {
    pub archive: Archive,
    pub report: ExecutionReport,
}

pub struct Engine<'c> {
    catalog: &'c Catalog,
    config: PipelineConfig,
    cancellation: CancellationToken,
}

/// Result of one transformer on one class, before it goes into the report
struct ClassOutcome {
    outcome: Outcome,
    transformed: Option<ClassModel>,
    log: Vec<String>,
    skipped: Vec<SkippedMethod>,
}

impl<'c> Engine<'c> {
    pub fn new(catalog: &'c Catalog, config: PipelineConfig) -> Engine<'c> {
        Engine {
            catalog,
            config,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Engine<'c> {
        self.cancellation = cancellation;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Read `input`, run the pipeline, and write the result to `output`
    ///
    /// Nothing is written when the configuration is invalid.
    pub fn run_file(&self, input: &Path, output: &Path) -> Result<ExecutionReport, EngineError> {
        self.config.resolve(self.catalog)?;
        let archive = Archive::read(input)?;
        let RunOutput { archive, report } = self.run(archive)?;
        archive.write(output)?;
        Ok(report)
    }

    /// Run the pipeline over an archive held in memory
    pub fn run(&self, mut archive: Archive) -> Result<RunOutput, EngineError> {
        let transformers = self.config.resolve(self.catalog)?;
        let mut report = ExecutionReport::new(
            transformers
                .iter()
                .map(|transformer| transformer.name().to_owned())
                .collect(),
        );

        report.enter(RunState::Loading);
        if self.config.strip_signatures {
            archive.strip_signatures();
        }
        let mut set = load(&archive, &mut report);
        log::info!(
            "Loaded {} classes from {} entries",
            set.len(),
            archive.entries.len()
        );
        let original_bytes: Vec<Option<Vec<u8>>> = archive
            .entries
            .iter()
            .map(|entry| entry.looks_like_class().then(|| entry.data.clone()))
            .collect();

        if self.config.verify {
            let hierarchy = set.hierarchy();
            for loaded in &set.classes {
                report.classes[loaded.report].initial_verification =
                    Some(verify(&loaded.class, &hierarchy).into());
            }
        }

        let count = transformers.len();
        for (position, transformer) in transformers.iter().enumerate() {
            if self.cancellation.is_cancelled() {
                log::warn!("Run cancelled before {}", transformer.name());
                report.enter(RunState::Aborted {
                    reason: AbortReason::Cancelled,
                });
                break;
            }
            report.enter(RunState::Running {
                transformer: position,
                of: count,
            });
            log::info!("Running {} ({}/{})", transformer.name(), position + 1, count);
            self.apply(*transformer, &mut set, &mut report);
        }

        if !matches!(report.state, RunState::Aborted { .. }) {
            report.enter(RunState::Verifying);
            if self.config.verify {
                let hierarchy = set.hierarchy();
                for loaded in &set.classes {
                    report.classes[loaded.report].final_verification =
                        Some(verify(&loaded.class, &hierarchy).into());
                }
            }
        }

        self.write_classes(&set, &original_bytes, &mut archive, &mut report);
        let resources = archive.entries.len() - report.classes.len();
        report.summarize(resources);
        if !matches!(report.state, RunState::Aborted { .. }) {
            report.enter(RunState::Done);
        }
        log::info!("{:?}", report.summary);
        Ok(RunOutput { archive, report })
    }

    /// Run one transformer over the class set, recording the outcome for every class
    fn apply(&self, transformer: &dyn Transformer, set: &mut ClassSet, report: &mut ExecutionReport) {
        let index = set.index();
        let hierarchy = set.hierarchy();
        let outcomes = match transformer.scope() {
            Scope::Class => self.apply_to_classes(transformer, set, &index, &hierarchy),
            Scope::ClassSet => self.apply_to_class_set(transformer, set, &index, &hierarchy),
        };

        for (position, outcome) in outcomes.into_iter().enumerate() {
            let loaded = &set.classes[position];
            if let Outcome::Failed(reason) = &outcome.outcome {
                log::warn!("{} failed on {}: {}", transformer.name(), loaded.class.name, reason);
            }
            report.classes[loaded.report].results.push(TransformResult {
                transformer: transformer.name().to_owned(),
                category: transformer.category(),
                outcome: outcome.outcome,
                log: outcome.log,
                skipped: outcome.skipped,
            });
            if let Some(class) = outcome.transformed {
                set.replace(position, class);
            }
        }
        for loaded in &set.classes {
            report.classes[loaded.report].class = Some(loaded.class.name.clone());
        }
    }

    /// Transform each class on its own clone, possibly in parallel
    fn apply_to_classes(
        &self,
        transformer: &dyn Transformer,
        set: &ClassSet,
        index: &ClassIndex,
        hierarchy: &ClassHierarchy,
    ) -> Vec<ClassOutcome> {
        let settings = &self.config.settings;
        let transform = |class: &Arc<ClassModel>| -> ClassOutcome {
            let mut ctx = TransformContext::new(index, hierarchy, settings)
                .with_reserved_names(&set.reserved_names);
            let mut working = ClassModel::clone(class);
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                transformer.transform_class(&mut working, &mut ctx)
            }));
            let (outcome, transformed) = match result {
                Ok(Ok(true)) => (Outcome::Changed, Some(working)),
                Ok(Ok(false)) => (Outcome::Unchanged, None),
                Ok(Err(err)) => (Outcome::Failed(err.to_string()), None),
                Err(payload) => (Outcome::Failed(panic_reason(payload)), None),
            };
            ClassOutcome {
                outcome,
                transformed,
                log: ctx.take_log(&class.name),
                skipped: ctx.take_skipped(&class.name),
            }
        };

        if self.config.parallel {
            set.classes
                .par_iter()
                .map(|loaded| transform(&loaded.class))
                .collect()
        } else {
            set.classes
                .iter()
                .map(|loaded| transform(&loaded.class))
                .collect()
        }
    }

    /// Transform all classes together; any failure discards the whole pass
    fn apply_to_class_set(
        &self,
        transformer: &dyn Transformer,
        set: &ClassSet,
        index: &ClassIndex,
        hierarchy: &ClassHierarchy,
    ) -> Vec<ClassOutcome> {
        let mut ctx = TransformContext::new(index, hierarchy, &self.config.settings)
            .with_reserved_names(&set.reserved_names);
        let mut working: Vec<ClassModel> = set
            .classes
            .iter()
            .map(|loaded| ClassModel::clone(&loaded.class))
            .collect();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            transformer.transform_class_set(&mut working, &mut ctx)
        }));
        let failure = match result {
            Ok(Ok(changed)) if changed.len() == working.len() => {
                return set
                    .classes
                    .iter()
                    .zip(working)
                    .zip(changed)
                    .map(|((loaded, class), changed)| ClassOutcome {
                        outcome: if changed {
                            Outcome::Changed
                        } else {
                            Outcome::Unchanged
                        },
                        transformed: changed.then(|| class),
                        log: ctx.take_log(&loaded.class.name),
                        skipped: ctx.take_skipped(&loaded.class.name),
                    })
                    .collect();
            }
            Ok(Ok(changed)) => TransformError::TransformFailure(format!(
                "reported {} results for {} classes",
                changed.len(),
                working.len()
            ))
            .to_string(),
            Ok(Err(err)) => err.to_string(),
            Err(payload) => panic_reason(payload),
        };
        set.classes
            .iter()
            .map(|loaded| ClassOutcome {
                outcome: Outcome::Failed(failure.clone()),
                transformed: None,
                log: ctx.take_log(&loaded.class.name),
                skipped: ctx.take_skipped(&loaded.class.name),
            })
            .collect()
    }

    /// Put the classes back into the archive
    ///
    /// Unchanged classes keep their original bytes. Changed classes are exported, unless the export
    /// fails or they are invalid and the configuration asks for those to be discarded.
    fn write_classes(
        &self,
        set: &ClassSet,
        original_bytes: &[Option<Vec<u8>>],
        archive: &mut Archive,
        report: &mut ExecutionReport,
    ) {
        for loaded in &set.classes {
            if !loaded.changed {
                continue;
            }
            let class_report = &mut report.classes[loaded.report];
            let invalid = matches!(
                class_report.final_verification,
                Some(VerificationStatus::Invalid(_))
            );
            let entry = &mut archive.entries[loaded.entry];
            if invalid && self.config.discard_invalid {
                log::warn!("Discarding changes to invalid class {}", loaded.class.name);
                class_report.written =
                    WriteStatus::Reverted(String::from("final verification failed"));
                class_report.class = Some(loaded.original_name.clone());
                continue;
            }
            match loaded.class.export() {
                Ok(bytes) => {
                    entry.name = ClassSet::entry_name(&entry.name, loaded);
                    entry.data = bytes;
                    class_report.written = WriteStatus::Rewritten;
                }
                Err(err) => {
                    log::warn!("Could not export {}: {}", loaded.class.name, err);
                    if let Some(bytes) = &original_bytes[loaded.entry] {
                        entry.data = bytes.clone();
                    }
                    class_report.written = WriteStatus::Reverted(format!("export failed: {}", err));
                    class_report.class = Some(loaded.original_name.clone());
                }
            }
        }
    }
}

/// Build a model for every class entry, reporting the ones which fail
///
/// A class with the same name as one already loaded counts as malformed, since the class set is
/// keyed by name.
fn load(archive: &Archive, report: &mut ExecutionReport) -> ClassSet {
    let mut set = ClassSet::default();
    let mut names = HashSet::new();
    for (position, entry) in archive.entries.iter().enumerate() {
        set.reserve_entry(&entry.name);
        if !entry.looks_like_class() {
            continue;
        }
        let loaded = load_entry(entry).and_then(|class| {
            if names.insert(class.name.clone()) {
                Ok(class)
            } else {
                Err(format!("duplicate class {}", class.name))
            }
        });
        match loaded {
            Ok(class) => {
                report.classes.push(ClassReport {
                    entry: entry.name.clone(),
                    class: Some(class.name.clone()),
                    load: LoadStatus::Loaded,
                    initial_verification: None,
                    final_verification: None,
                    results: vec![],
                    heuristics: Some(heuristics::summarize(&class)),
                    written: WriteStatus::Original,
                });
                set.classes.push(LoadedClass {
                    entry: position,
                    report: report.classes.len() - 1,
                    original_name: class.name.clone(),
                    class: Arc::new(class),
                    changed: false,
                });
            }
            Err(reason) => {
                log::warn!("Malformed class {}: {}", entry.name, reason);
                report
                    .classes
                    .push(ClassReport::malformed(&entry.name, reason));
            }
        }
    }
    set
}

fn load_entry(entry: &Entry) -> Result<ClassModel, String> {
    match panic::catch_unwind(|| ClassModel::build(&entry.data)) {
        Ok(Ok(class)) => Ok(class),
        Ok(Err(err)) => Err(err.to_string()),
        Err(payload) => Err(panic_reason(payload)),
    }
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("unknown panic"));
    TransformError::TransformFailure(format!("panicked: {}", message)).to_string()
}
