use crate::constraints::{ProblemInstance, build_problem};
use crate::data::{
    AllocationMetrics, AllocationRequest, AllocationResult, AllocationRow, NO_PREFERENCE, NO_TUTOR,
    PreferenceValue, RowValue, Strategy,
};
use crate::error::EngineError;
use crate::genetic::{GeneticConfig, GeneticOutcome};
use crate::{exact, genetic};
use log::{info, warn};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::oneshot;

/// Lifecycle of one run. `Completed`, `Cancelled` and `Failed` are terminal
/// and written exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunPhase {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            RunPhase::Completed | RunPhase::Cancelled | RunPhase::Failed
        )
    }
}

#[derive(Debug)]
struct RunEntry {
    cancel: AtomicBool,
    phase: Mutex<RunPhase>,
}

impl RunEntry {
    fn new() -> Self {
        Self {
            cancel: AtomicBool::new(false),
            phase: Mutex::new(RunPhase::Pending),
        }
    }

    fn phase(&self) -> MutexGuard<'_, RunPhase> {
        self.phase.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Attempts the transition into a terminal phase. Exactly one caller
    /// wins; everyone else sees `false`.
    fn try_finish(&self, terminal: RunPhase) -> bool {
        let mut phase = self.phase();
        if phase.is_terminal() {
            return false;
        }
        *phase = terminal;
        true
    }
}

/// Final report of a run, delivered exactly once through the ticket.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(AllocationResult),
    Cancelled,
    Failed(String),
}

/// Handle returned by [`Orchestrator::start`]: the run id for later
/// cancellation and the channel the single outcome arrives on.
#[derive(Debug)]
pub struct RunTicket {
    pub run_id: String,
    pub outcome: oneshot::Receiver<RunOutcome>,
}

/// The only stateful component: maps run identifiers to in-flight workers
/// and turns raw solver assignments into the reportable result shape.
/// Cheap to clone; all clones share the same run table.
#[derive(Debug, Clone, Default)]
pub struct Orchestrator {
    runs: Arc<Mutex<HashMap<String, Arc<RunEntry>>>>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, Arc<RunEntry>>> {
        self.runs.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Validates the request, registers the run and spawns its worker
    /// thread. Invalid input is rejected before any worker exists. Each run
    /// gets its own worker, so concurrent runs never share solver state.
    pub fn start(&self, request: AllocationRequest) -> Result<RunTicket, EngineError> {
        request.validate()?;
        let run_id = request.run_id.clone();

        let entry = Arc::new(RunEntry::new());
        {
            let mut runs = self.runs();
            if runs.contains_key(&run_id) {
                return Err(EngineError::InvalidInput(format!(
                    "run '{run_id}' is already in flight"
                )));
            }
            runs.insert(run_id.clone(), Arc::clone(&entry));
        }

        info!(
            "run {}: starting {} over {} courses / {} tutor records",
            run_id,
            request.strategy,
            request.courses.len(),
            request.tutors.len()
        );

        let (sender, receiver) = oneshot::channel();
        let runs = Arc::clone(&self.runs);
        let worker_run_id = run_id.clone();
        std::thread::spawn(move || {
            let outcome = execute(&request, &entry);
            runs.lock()
                .unwrap_or_else(|poison| poison.into_inner())
                .remove(&worker_run_id);
            // the caller may have dropped the receiver; nothing to do then
            let _ = sender.send(outcome);
        });

        Ok(RunTicket {
            run_id,
            outcome: receiver,
        })
    }

    /// Requests cooperative cancellation of an in-flight run. Returns
    /// `false` for unknown or already-finished runs; cancelling after
    /// completion is a harmless no-op.
    pub fn cancel(&self, run_id: &str) -> bool {
        let entry = match self.runs().get(run_id) {
            Some(entry) => Arc::clone(entry),
            None => return false,
        };
        entry.cancel.store(true, Ordering::Relaxed);
        let cancelled = entry.try_finish(RunPhase::Cancelled);
        if cancelled {
            info!("run {run_id}: cancellation requested");
        }
        cancelled
    }

    /// Number of runs currently registered.
    pub fn in_flight(&self) -> usize {
        self.runs().len()
    }
}

/// Worker body: dispatch, terminal-state arbitration and result assembly.
/// A panicking solver fails only its own run.
fn execute(request: &AllocationRequest, entry: &RunEntry) -> RunOutcome {
    {
        let mut phase = entry.phase();
        if phase.is_terminal() {
            // cancelled between registration and worker startup
            return RunOutcome::Cancelled;
        }
        *phase = RunPhase::Running;
    }

    let started = Instant::now();
    let problem = build_problem(request);
    let solved = catch_unwind(AssertUnwindSafe(|| dispatch(request, &problem, entry)));

    match solved {
        Ok(Ok((assignment, heuristic))) => {
            if entry.try_finish(RunPhase::Completed) {
                let result = assemble(
                    &problem,
                    &assignment,
                    started.elapsed().as_secs_f64(),
                    heuristic.as_ref(),
                );
                info!(
                    "run {}: completed, {}/{} classes allocated",
                    request.run_id,
                    result.metrics.number_classes_allocated,
                    result.metrics.total_classes
                );
                RunOutcome::Completed(result)
            } else {
                // cancellation won the race; the late result is discarded
                info!("run {}: finished after cancellation, result dropped", request.run_id);
                RunOutcome::Cancelled
            }
        }
        Ok(Err(EngineError::Cancelled)) => {
            entry.try_finish(RunPhase::Cancelled);
            RunOutcome::Cancelled
        }
        Ok(Err(error)) => {
            entry.try_finish(RunPhase::Failed);
            warn!("run {}: {error}", request.run_id);
            RunOutcome::Failed(error.to_string())
        }
        Err(_) => {
            entry.try_finish(RunPhase::Failed);
            warn!("run {}: worker panicked", request.run_id);
            RunOutcome::Failed("worker panicked".to_string())
        }
    }
}

fn dispatch(
    request: &AllocationRequest,
    problem: &ProblemInstance,
    entry: &RunEntry,
) -> Result<(Vec<Option<usize>>, Option<GeneticOutcome>), EngineError> {
    match request.strategy {
        Strategy::IntegerProgramming => {
            let assignment = exact::solve(problem, &entry.cancel)?;
            Ok((assignment, None))
        }
        Strategy::Genetic => {
            let config = GeneticConfig {
                // validated as present for the genetic strategy
                generations: request.parameters.generation_number.unwrap_or(1),
                population_size: request.parameters.population_size.unwrap_or(1),
                seed: request.parameters.seed,
            };
            let outcome = genetic::solve(problem, &config, &entry.cancel)?;
            Ok((outcome.assignment.clone(), Some(outcome)))
        }
    }
}

/// Builds the reportable rows and metrics: exactly one row per declared
/// slot, sentinel strings for unallocated ones.
fn assemble(
    problem: &ProblemInstance,
    assignment: &[Option<usize>],
    execution_time: f64,
    heuristic: Option<&GeneticOutcome>,
) -> AllocationResult {
    let mut rows = Vec::with_capacity(problem.slots.len());
    let mut allocated = 0u32;
    let mut grade_sum = 0.0;

    for (slot_index, slot) in problem.slots.iter().enumerate() {
        let row = match assignment[slot_index] {
            Some(tutor_index) => {
                let tutor = &problem.tutors[tutor_index];
                let grade = problem.candidates[slot_index]
                    .iter()
                    .find(|c| c.tutor == tutor_index)
                    .map(|c| c.grade)
                    .unwrap_or_default();
                allocated += 1;
                grade_sum += grade;
                AllocationRow {
                    class: slot.label.clone(),
                    student: tutor.student_id.clone(),
                    grade: RowValue::Number(grade),
                    preference: PreferenceValue::Vector(tutor.grade_vector()),
                }
            }
            None => AllocationRow {
                class: slot.label.clone(),
                student: NO_TUTOR.to_string(),
                grade: RowValue::Text(NO_PREFERENCE.to_string()),
                preference: PreferenceValue::Text(NO_PREFERENCE.to_string()),
            },
        };
        rows.push(row);
    }

    let best_individual = heuristic.map(|outcome| {
        outcome
            .assignment
            .iter()
            .map(|gene| match gene {
                Some(tutor_index) => problem.tutors[*tutor_index].student_id.clone(),
                None => "0".to_string(),
            })
            .collect()
    });

    AllocationResult {
        metrics: AllocationMetrics {
            number_classes_allocated: allocated,
            total_classes: problem.slots.len() as u32,
            execution_time,
            average_grade: if allocated > 0 {
                grade_sum / f64::from(allocated)
            } else {
                0.0
            },
            best_individual,
            satisfaction: heuristic.map(|outcome| outcome.satisfaction),
        },
        results: rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{AllocationParameters, Course, TutorRecord};
    use itertools::Itertools;

    fn record(id: &str, course: &str, grade: f64, preference: u32) -> TutorRecord {
        TutorRecord {
            student_id: id.to_string(),
            course: course.to_string(),
            grade,
            preference,
        }
    }

    fn scenario_request(run_id: &str, strategy: Strategy) -> AllocationRequest {
        AllocationRequest {
            run_id: run_id.to_string(),
            strategy,
            courses: vec![Course {
                name: "A".to_string(),
                classes: 2,
            }],
            tutors: vec![record("T1", "A", 9.0, 1), record("T2", "A", 8.0, 2)],
            parameters: AllocationParameters {
                min_grade: 7.0,
                use_preference: 1,
                generation_number: Some(40),
                population_size: Some(30),
                seed: Some(11),
            },
        }
    }

    #[tokio::test]
    async fn exact_scenario_allocates_both_classes() {
        let orchestrator = Orchestrator::new();
        let ticket = orchestrator
            .start(scenario_request("run-exact", Strategy::IntegerProgramming))
            .unwrap();
        let outcome = ticket.outcome.await.unwrap();
        let result = match outcome {
            RunOutcome::Completed(result) => result,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(result.metrics.number_classes_allocated, 2);
        assert_eq!(result.metrics.total_classes, 2);
        assert!(result.metrics.execution_time >= 0.0);
        assert!(result.metrics.best_individual.is_none());
        let students: Vec<&str> = result
            .results
            .iter()
            .map(|row| row.student.as_str())
            .sorted()
            .collect();
        assert_eq!(students, vec!["T1", "T2"]);
        assert!((result.metrics.average_grade - 8.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn genetic_scenario_reports_heuristic_metrics() {
        let orchestrator = Orchestrator::new();
        let ticket = orchestrator
            .start(scenario_request("run-ga", Strategy::Genetic))
            .unwrap();
        let outcome = ticket.outcome.await.unwrap();
        let result = match outcome {
            RunOutcome::Completed(result) => result,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(result.metrics.number_classes_allocated, 2);
        let encoding = result.metrics.best_individual.unwrap();
        assert_eq!(encoding.len(), 2);
        let satisfaction = result.metrics.satisfaction.unwrap();
        assert!((0.0..=1.0).contains(&satisfaction));
        // no double-booking in the reported rows
        let assigned: Vec<&str> = result
            .results
            .iter()
            .filter(|row| row.is_allocated())
            .map(|row| row.student.as_str())
            .collect();
        assert_eq!(assigned.iter().duplicates().count(), 0);
    }

    #[tokio::test]
    async fn unallocated_slots_are_reported_with_sentinels() {
        let mut request = scenario_request("run-gaps", Strategy::IntegerProgramming);
        request.courses[0].classes = 3;
        let orchestrator = Orchestrator::new();
        let ticket = orchestrator.start(request).unwrap();
        let result = match ticket.outcome.await.unwrap() {
            RunOutcome::Completed(result) => result,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(result.results.len(), 3);
        assert_eq!(result.metrics.number_classes_allocated, 2);
        let gap = result
            .results
            .iter()
            .find(|row| !row.is_allocated())
            .unwrap();
        assert_eq!(gap.student, NO_TUTOR);
        assert_eq!(gap.grade, RowValue::Text(NO_PREFERENCE.to_string()));
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_any_worker() {
        let mut request = scenario_request("run-bad", Strategy::IntegerProgramming);
        request.courses[0].classes = 0;
        let orchestrator = Orchestrator::new();
        assert!(matches!(
            orchestrator.start(request),
            Err(EngineError::InvalidInput(_))
        ));
        assert_eq!(orchestrator.in_flight(), 0);
    }

    #[tokio::test]
    async fn duplicate_in_flight_run_id_is_rejected() {
        let orchestrator = Orchestrator::new();
        let mut long_run = scenario_request("run-dup", Strategy::Genetic);
        long_run.parameters.generation_number = Some(2_000_000);
        let ticket = orchestrator.start(long_run).unwrap();

        let second = orchestrator.start(scenario_request("run-dup", Strategy::Genetic));
        assert!(matches!(second, Err(EngineError::InvalidInput(_))));

        assert!(orchestrator.cancel("run-dup"));
        assert!(matches!(
            ticket.outcome.await.unwrap(),
            RunOutcome::Cancelled
        ));
    }

    #[tokio::test]
    async fn cancelling_a_long_heuristic_run_yields_cancelled() {
        let orchestrator = Orchestrator::new();
        let mut request = scenario_request("run-cancel", Strategy::Genetic);
        request.parameters.generation_number = Some(50_000_000);
        request.parameters.population_size = Some(50);
        let ticket = orchestrator.start(request).unwrap();

        // give the worker a moment to enter the generation loop
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(orchestrator.cancel("run-cancel"));

        match ticket.outcome.await.unwrap() {
            RunOutcome::Cancelled => {}
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(orchestrator.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancel_after_completion_returns_false() {
        let orchestrator = Orchestrator::new();
        let ticket = orchestrator
            .start(scenario_request("run-late", Strategy::IntegerProgramming))
            .unwrap();
        let outcome = ticket.outcome.await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed(_)));
        assert!(!orchestrator.cancel("run-late"));
        assert!(!orchestrator.cancel("never-started"));
    }

    #[tokio::test]
    async fn concurrent_runs_do_not_interfere() {
        let orchestrator = Orchestrator::new();
        let first = orchestrator
            .start(scenario_request("run-a", Strategy::IntegerProgramming))
            .unwrap();
        let second = orchestrator
            .start(scenario_request("run-b", Strategy::Genetic))
            .unwrap();
        assert!(matches!(
            first.outcome.await.unwrap(),
            RunOutcome::Completed(_)
        ));
        assert!(matches!(
            second.outcome.await.unwrap(),
            RunOutcome::Completed(_)
        ));
        assert_eq!(orchestrator.in_flight(), 0);
    }
}
