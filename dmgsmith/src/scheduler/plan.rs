//! Task/phase bookkeeping and weighted progress.
//!
//! A build is a queue of [`Task`]s, each holding ordered [`Phase`]s with a
//! byte weight. Overall progress is `accumulated + weight * percent / 100`
//! for the current phase, where `accumulated` is the sum of every phase
//! already consumed.

use std::collections::VecDeque;

use dmgsmith_shared::errors::BuildError;

use super::observer::BuildObserver;
use crate::constants::weights;
use crate::package::Package;
use crate::source::SourceKind;

/// Where a build is.
///
/// ```text
/// Idle → Preparing → Installing → [Finalizing] → Finishing → Succeeded
///                                                           ↘ Failed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildStatus {
    Idle,
    Preparing,
    Installing,
    Finalizing,
    Finishing,
    Succeeded,
    Failed,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Succeeded | BuildStatus::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    Prepare,
    Install,
    Finalize,
    Finish,
}

impl TaskKind {
    pub fn title(&self) -> &'static str {
        match self {
            TaskKind::Prepare => "Prepare",
            TaskKind::Install => "Install",
            TaskKind::Finalize => "Finalize",
            TaskKind::Finish => "Finish",
        }
    }

    pub fn status(&self) -> BuildStatus {
        match self {
            TaskKind::Prepare => BuildStatus::Preparing,
            TaskKind::Install => BuildStatus::Installing,
            TaskKind::Finalize => BuildStatus::Finalizing,
            TaskKind::Finish => BuildStatus::Finishing,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Phase {
    pub title: String,
    pub weight: u64,
    /// May be left unconsumed when the task ends.
    pub optional: bool,
}

impl Phase {
    pub fn new(title: impl Into<String>, weight: u64) -> Self {
        Self {
            title: title.into(),
            weight,
            optional: false,
        }
    }

    pub fn optional(title: impl Into<String>, weight: u64) -> Self {
        Self {
            optional: true,
            ..Self::new(title, weight)
        }
    }
}

#[derive(Clone, Debug)]
pub struct Task {
    pub kind: TaskKind,
    pub phases: VecDeque<Phase>,
}

impl Task {
    pub fn new(kind: TaskKind, phases: impl IntoIterator<Item = Phase>) -> Self {
        Self {
            kind,
            phases: phases.into_iter().collect(),
        }
    }

    pub fn weight(&self) -> u64 {
        self.phases.iter().map(|p| p.weight).sum()
    }
}

/// A task or phase queue was left in an impossible state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inconsistency {
    pub message: &'static str,
    pub details: String,
}

impl std::fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.message, self.details)
    }
}

impl From<Inconsistency> for BuildError {
    fn from(e: Inconsistency) -> Self {
        BuildError::Scheduler(e.to_string())
    }
}

/// What goes into a build's task list.
#[derive(Clone, Debug)]
pub struct PlanInputs<'a> {
    pub source_kind: SourceKind,
    /// Packages installed on top of the OS, in order.
    pub packages: &'a [Package],
    pub finalize_scan: bool,
}

/// The full task list, fixed before any work starts.
pub fn build_tasks(inputs: &PlanInputs<'_>) -> Vec<Task> {
    let mut install = vec![
        Phase::new("Starting install", weights::STARTING_INSTALL),
        Phase::new("Creating disk image", weights::CREATING_IMAGE),
    ];
    if inputs.source_kind == SourceKind::InstallEsd {
        install.push(Phase::new("Installing OS", weights::INSTALLING_OS));
    }
    for package in inputs.packages {
        install.push(Phase::new(
            format!("Installing {}", package.name()),
            package.size_bytes() + weights::PACKAGE_OVERHEAD,
        ));
    }
    install.push(Phase::new("Converting disk image", weights::CONVERTING_IMAGE));

    let mut tasks = vec![
        Task::new(TaskKind::Prepare, [Phase::new("Preparing", weights::PREPARE)]),
        Task::new(TaskKind::Install, install),
    ];

    if inputs.finalize_scan {
        let passes = weights::SCAN_PASSES.len();
        tasks.push(Task::new(
            TaskKind::Finalize,
            weights::SCAN_PASSES.iter().enumerate().map(|(i, &weight)| {
                if i + 1 == passes {
                    Phase::optional("Scanning disk image", weight)
                } else {
                    Phase::new("Scanning disk image", weight)
                }
            }),
        ));
    }

    tasks.push(Task::new(TaskKind::Finish, [Phase::new("Finishing", weights::FINISH)]));
    tasks
}

// ============================================================================
// SCHEDULE
// ============================================================================

/// Consumes tasks and phases and reports weighted progress.
///
/// Reported progress never decreases, and [`finish`](Self::finish) reports
/// exactly the total weight.
#[derive(Debug)]
pub struct Schedule {
    queue: VecDeque<Task>,
    current: Option<Task>,
    phase: Option<Phase>,
    accumulated: u64,
    total_weight: u64,
    last_reported: Option<f64>,
}

impl Schedule {
    pub fn new(tasks: Vec<Task>) -> Self {
        let total_weight = tasks.iter().map(Task::weight).sum();
        Self {
            queue: tasks.into(),
            current: None,
            phase: None,
            accumulated: 0,
            total_weight,
            last_reported: None,
        }
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn current_task(&self) -> Option<TaskKind> {
        self.current.as_ref().map(|t| t.kind)
    }

    pub fn current_phase(&self) -> Option<&str> {
        self.phase.as_ref().map(|p| p.title.as_str())
    }

    /// Leave the current task and start the next one with its first phase.
    ///
    /// Returns `None` when the queue is empty. Fails when the task being left
    /// still holds a mandatory phase.
    pub fn next_task(
        &mut self,
        observer: &dyn BuildObserver,
    ) -> Result<Option<TaskKind>, Inconsistency> {
        if let Some(task) = self.current.take() {
            if task.phases.iter().any(|p| !p.optional) {
                let remaining = task
                    .phases
                    .iter()
                    .map(|p| p.title.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(Inconsistency {
                    message: "Task finished prematurely",
                    details: format!("Phases remaining: {}", remaining),
                });
            }
            // Optional leftovers still count towards the total.
            if let Some(phase) = self.phase.take() {
                self.accumulated += phase.weight;
            }
            self.accumulated += task.weight();
        }

        let Some(task) = self.queue.pop_front() else {
            return Ok(None);
        };
        let kind = task.kind;
        tracing::info!(task = kind.title(), "Starting task");
        self.current = Some(task);
        self.phase = None;
        self.next_phase(observer)?;
        Ok(Some(kind))
    }

    /// Consume the current phase and start the next one in the current task.
    pub fn next_phase(&mut self, observer: &dyn BuildObserver) -> Result<(), Inconsistency> {
        let task = self.current.as_mut().ok_or_else(|| Inconsistency {
            message: "No task running",
            details: "A phase was selected outside of any task".to_string(),
        })?;
        let Some(phase) = task.phases.pop_front() else {
            return Err(Inconsistency {
                message: "No phase left in task",
                details: format!("{} has no phases left", task.kind.title()),
            });
        };

        if let Some(done) = self.phase.replace(phase) {
            self.accumulated += done.weight;
        }
        if let Some(phase) = &self.phase {
            tracing::debug!(phase = %phase.title, weight = phase.weight, "Starting phase");
            observer.set_phase(&phase.title);
        }
        self.report(self.accumulated as f64, observer);
        Ok(())
    }

    /// Progress within the current phase.
    pub fn update_progress(&mut self, percent: f64, observer: &dyn BuildObserver) {
        let percent = if percent.is_nan() { 0.0 } else { percent.clamp(0.0, 100.0) };
        let weight = self.phase.as_ref().map_or(0, |p| p.weight);
        let progress = self.accumulated as f64 + weight as f64 * percent / 100.0;
        self.report(progress, observer);
    }

    /// Report completion of the whole build.
    pub fn finish(&mut self, observer: &dyn BuildObserver) {
        self.report(self.total_weight as f64, observer);
    }

    fn report(&mut self, progress: f64, observer: &dyn BuildObserver) {
        if self.last_reported.is_some_and(|last| progress < last) {
            return;
        }
        self.last_reported = Some(progress);
        observer.set_progress(progress);
    }
}
