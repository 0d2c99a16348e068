use crate::constraints::ProblemInstance;
use crate::error::EngineError;
use good_lp::variable;
use good_lp::{Expression, SolverModel, constraint, default_solver};
use good_lp::{ProblemVariables, Solution};
use itertools::Itertools;
use log::{info, trace};
use std::sync::atomic::{AtomicBool, Ordering};

/// Solves the assignment problem to optimality with the HiGHS ILP solver.
///
/// Decision variables are one binary per eligible (slot, tutor) pair;
/// the objective maximises total score subject to at most one tutor per
/// slot and at most one slot per tutor. Zero eligible pairs is a valid
/// instance and yields the empty assignment without invoking the solver.
///
/// Cancellation is honoured before dispatch only; the matching itself is
/// treated as non-interruptible at the problem sizes this engine targets.
pub fn solve(
    problem: &ProblemInstance,
    cancel: &AtomicBool,
) -> Result<Vec<Option<usize>>, EngineError> {
    if cancel.load(Ordering::Relaxed) {
        return Err(EngineError::Cancelled);
    }

    let slot_count = problem.slots.len();

    // x_st = 1 if slot s is covered by tutor t, 0 otherwise.
    let pairs: Vec<(usize, usize, f64)> = problem
        .candidates
        .iter()
        .enumerate()
        .flat_map(|(slot_index, candidates)| {
            candidates
                .iter()
                .map(move |candidate| (slot_index, candidate.tutor, candidate.score))
        })
        .collect();

    if pairs.is_empty() {
        info!("no eligible pairs; returning the empty assignment");
        return Ok(vec![None; slot_count]);
    }

    info!(
        "Setting up ILP model with {} slots, {} tutors and {} assignment variables...",
        slot_count,
        problem.tutors.len(),
        pairs.len()
    );
    let mut variables = ProblemVariables::new();
    let pair_vars = variables.add_vector(variable().binary(), pairs.len());

    let objective: Expression = pairs
        .iter()
        .zip(&pair_vars)
        .map(|(pair, var)| pair.2 * *var)
        .sum();

    let mut model = variables
        .maximise(objective)
        .using(default_solver)
        .set_option("threads", 1) // limit to 1 thread for reproducibility
        .set_option("random_seed", 1234) // fixed seed for reproducibility
        .set_option("log_to_console", "false");

    // at most one tutor per slot
    for slot_index in 0..slot_count {
        let covered: Expression = pairs
            .iter()
            .zip(&pair_vars)
            .filter(|((s, _, _), _)| *s == slot_index)
            .map(|(_, var)| *var)
            .sum();
        model.add_constraint(constraint!(covered <= 1));
    }

    // each tutor covers at most one slot globally
    for tutor_index in pairs.iter().map(|(_, t, _)| *t).unique() {
        let booked: Expression = pairs
            .iter()
            .zip(&pair_vars)
            .filter(|((_, t, _), _)| *t == tutor_index)
            .map(|(_, var)| *var)
            .sum();
        model.add_constraint(constraint!(booked <= 1));
    }

    let solution = model
        .solve()
        .map_err(|e| EngineError::SolverFault(format!("ILP backend failed: {e}")))?;

    let mut assignment = vec![None; slot_count];
    for ((slot_index, tutor_index, _), var) in pairs.iter().zip(&pair_vars) {
        if solution.value(*var) > 0.9 {
            assignment[*slot_index] = Some(*tutor_index);
        }
    }
    trace!(
        "ILP assignment covers {}/{} slots",
        assignment.iter().filter(|t| t.is_some()).count(),
        slot_count
    );

    Ok(assignment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::{assignment_score, build_problem, is_feasible};
    use crate::data::{AllocationParameters, AllocationRequest, Course, Strategy, TutorRecord};
    use itertools::Itertools;
    use std::sync::atomic::AtomicBool;

    fn record(id: &str, course: &str, grade: f64, preference: u32) -> TutorRecord {
        TutorRecord {
            student_id: id.to_string(),
            course: course.to_string(),
            grade,
            preference,
        }
    }

    fn request(
        courses: Vec<Course>,
        tutors: Vec<TutorRecord>,
        min_grade: f64,
        use_preference: u8,
    ) -> AllocationRequest {
        AllocationRequest {
            run_id: "exact-test".to_string(),
            strategy: Strategy::IntegerProgramming,
            courses,
            tutors,
            parameters: AllocationParameters {
                min_grade,
                use_preference,
                generation_number: None,
                population_size: None,
                seed: None,
            },
        }
    }

    /// Enumerates every feasible assignment and returns the best score.
    fn brute_force_best(problem: &crate::constraints::ProblemInstance) -> f64 {
        fn recurse(
            problem: &crate::constraints::ProblemInstance,
            slot: usize,
            used: &mut Vec<usize>,
            current: f64,
            best: &mut f64,
        ) {
            if slot == problem.slots.len() {
                if current > *best {
                    *best = current;
                }
                return;
            }
            recurse(problem, slot + 1, used, current, best);
            for candidate in &problem.candidates[slot] {
                if used.contains(&candidate.tutor) {
                    continue;
                }
                used.push(candidate.tutor);
                recurse(problem, slot + 1, used, current + candidate.score, best);
                used.pop();
            }
        }
        let mut best = f64::NEG_INFINITY;
        recurse(problem, 0, &mut Vec::new(), 0.0, &mut best);
        best
    }

    #[test]
    fn matches_brute_force_on_small_instance() {
        let req = request(
            vec![
                Course {
                    name: "A".to_string(),
                    classes: 1,
                },
                Course {
                    name: "B".to_string(),
                    classes: 1,
                },
            ],
            vec![
                record("1", "A", 9.0, 1),
                record("1", "B", 8.5, 2),
                record("2", "A", 7.0, 1),
                record("3", "B", 8.0, 1),
            ],
            5.0,
            1,
        );
        let problem = build_problem(&req);
        let assignment = solve(&problem, &AtomicBool::new(false)).unwrap();
        assert!(is_feasible(&problem, &assignment));
        let expected = brute_force_best(&problem);
        assert!(
            (assignment_score(&problem, &assignment) - expected).abs() < 1e-6,
            "solver score {} != brute force {}",
            assignment_score(&problem, &assignment),
            expected
        );
    }

    #[test]
    fn never_double_books_a_tutor() {
        // One tutor eligible for both classes of the same course.
        let req = request(
            vec![Course {
                name: "A".to_string(),
                classes: 2,
            }],
            vec![record("1", "A", 9.0, 1)],
            0.0,
            0,
        );
        let problem = build_problem(&req);
        let assignment = solve(&problem, &AtomicBool::new(false)).unwrap();
        let assigned: Vec<usize> = assignment.iter().filter_map(|t| *t).collect();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned.iter().duplicates().count(), 0);
    }

    #[test]
    fn two_tutors_two_classes_scenario() {
        let req = request(
            vec![Course {
                name: "A".to_string(),
                classes: 2,
            }],
            vec![record("T1", "A", 9.0, 1), record("T2", "A", 8.0, 2)],
            7.0,
            1,
        );
        let problem = build_problem(&req);
        let assignment = solve(&problem, &AtomicBool::new(false)).unwrap();
        let assigned: Vec<usize> = assignment.iter().filter_map(|t| *t).sorted().collect();
        assert_eq!(assigned, vec![0, 1], "both tutors assigned exactly once");
    }

    #[test]
    fn zero_eligible_pairs_yields_empty_assignment() {
        let req = request(
            vec![Course {
                name: "A".to_string(),
                classes: 2,
            }],
            vec![record("1", "A", 3.0, 1)],
            7.0,
            0,
        );
        let problem = build_problem(&req);
        let assignment = solve(&problem, &AtomicBool::new(false)).unwrap();
        assert_eq!(assignment, vec![None, None]);
    }

    #[test]
    fn identical_input_produces_identical_output() {
        let req = request(
            vec![
                Course {
                    name: "A".to_string(),
                    classes: 2,
                },
                Course {
                    name: "B".to_string(),
                    classes: 1,
                },
            ],
            vec![
                record("1", "A", 9.0, 1),
                record("2", "A", 9.0, 1),
                record("3", "A", 8.0, 2),
                record("3", "B", 8.0, 1),
            ],
            0.0,
            1,
        );
        let problem = build_problem(&req);
        let first = solve(&problem, &AtomicBool::new(false)).unwrap();
        let second = solve(&problem, &AtomicBool::new(false)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn cancelled_before_dispatch() {
        let req = request(
            vec![Course {
                name: "A".to_string(),
                classes: 1,
            }],
            vec![record("1", "A", 9.0, 1)],
            0.0,
            0,
        );
        let problem = build_problem(&req);
        let cancel = AtomicBool::new(true);
        assert!(matches!(
            solve(&problem, &cancel),
            Err(EngineError::Cancelled)
        ));
    }
}
