use crate::data::AllocationRequest;
use itertools::Itertools;
use log::debug;
use std::collections::{BTreeMap, HashMap};

/// Upper bound of the preference penalty, kept well below typical grade
/// differences so rank only breaks near-ties.
pub const PREFERENCE_PENALTY_SCALE: f64 = 1.0;
/// Decay of the penalty curve over preference ranks.
pub const PREFERENCE_PENALTY_DECAY: f64 = 0.4;

/// Penalty subtracted from a candidate's score when preference weighting is
/// on. Zero at rank 1 and strictly increasing, saturating at
/// [`PREFERENCE_PENALTY_SCALE`].
pub fn preference_penalty(rank: u32) -> f64 {
    let steps = rank.saturating_sub(1) as f64;
    PREFERENCE_PENALTY_SCALE * (1.0 - (-PREFERENCE_PENALTY_DECAY * steps).exp())
}

/// One allocatable class of a course.
#[derive(Debug, Clone)]
pub struct Slot {
    /// Display label, `"{course} - Class {index}"`.
    pub label: String,
    pub course_index: usize,
    /// 1-based class index within the course.
    pub class_index: u32,
}

/// A tutor with all their per-course candidacies, keyed by course name.
#[derive(Debug, Clone)]
pub struct TutorProfile {
    pub student_id: String,
    /// course -> (grade, preference rank)
    pub records: BTreeMap<String, (f64, u32)>,
}

impl TutorProfile {
    /// The tutor's course-to-grade vector as reported in result rows.
    pub fn grade_vector(&self) -> BTreeMap<String, f64> {
        self.records
            .iter()
            .map(|(course, (grade, _))| (course.clone(), *grade))
            .collect()
    }
}

/// An eligible (tutor, slot) pairing with its objective contribution.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    /// Index into [`ProblemInstance::tutors`].
    pub tutor: usize,
    pub grade: f64,
    pub score: f64,
}

/// The bipartite eligibility structure both solvers consume. Candidate
/// lists are ordered by descending score, ties by ascending tutor id, which
/// is the deterministic order used everywhere downstream.
#[derive(Debug, Clone)]
pub struct ProblemInstance {
    pub slots: Vec<Slot>,
    pub tutors: Vec<TutorProfile>,
    /// Per-slot eligible candidates, indexed like `slots`.
    pub candidates: Vec<Vec<Candidate>>,
    /// Sum over slots of the best candidate score, ignoring the one-slot-
    /// per-tutor constraint. Denominator of the satisfaction metric.
    pub theoretical_max: f64,
}

impl ProblemInstance {
    /// True when no tutor is eligible for any slot. Such an instance has
    /// exactly one valid result: every slot unallocated.
    pub fn is_degenerate(&self) -> bool {
        self.candidates.iter().all(|c| c.is_empty())
    }

    pub fn total_candidates(&self) -> usize {
        self.candidates.iter().map(|c| c.len()).sum()
    }
}

/// Translates a validated request into the eligibility structure.
///
/// A tutor eligible for a course is a candidate for every class slot of
/// that course, but remains one shared resource across the whole request.
pub fn build_problem(request: &AllocationRequest) -> ProblemInstance {
    let min_grade = request.parameters.min_grade;
    let use_preference = request.parameters.prefers();

    let course_indices: HashMap<&str, usize> = request
        .courses
        .iter()
        .enumerate()
        .map(|(index, course)| (course.name.as_str(), index))
        .collect();

    // Tutor profiles in first-appearance order; records naming unknown
    // courses are dropped here.
    let mut tutor_indices: HashMap<&str, usize> = HashMap::new();
    let mut tutors: Vec<TutorProfile> = Vec::new();
    for record in &request.tutors {
        if !course_indices.contains_key(record.course.as_str()) {
            continue;
        }
        let index = *tutor_indices
            .entry(record.student_id.as_str())
            .or_insert_with(|| {
                tutors.push(TutorProfile {
                    student_id: record.student_id.clone(),
                    records: BTreeMap::new(),
                });
                tutors.len() - 1
            });
        tutors[index]
            .records
            .insert(record.course.clone(), (record.grade, record.preference));
    }

    // Eligible candidates per course, shared by all of its class slots.
    let mut course_candidates: Vec<Vec<Candidate>> = vec![Vec::new(); request.courses.len()];
    for (tutor_index, profile) in tutors.iter().enumerate() {
        for (course, (grade, rank)) in &profile.records {
            if *grade < min_grade {
                continue;
            }
            let score = if use_preference {
                grade - preference_penalty(*rank)
            } else {
                *grade
            };
            course_candidates[course_indices[course.as_str()]].push(Candidate {
                tutor: tutor_index,
                grade: *grade,
                score,
            });
        }
    }
    for candidates in &mut course_candidates {
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| tutors[a.tutor].student_id.cmp(&tutors[b.tutor].student_id))
        });
    }

    let slots: Vec<Slot> = request
        .courses
        .iter()
        .enumerate()
        .flat_map(|(course_index, course)| {
            (1..=course.classes).map(move |class_index| Slot {
                label: format!("{} - Class {}", course.name, class_index),
                course_index,
                class_index,
            })
        })
        .collect();

    let candidates: Vec<Vec<Candidate>> = slots
        .iter()
        .map(|slot| course_candidates[slot.course_index].clone())
        .collect();

    let theoretical_max: f64 = candidates
        .iter()
        .filter_map(|c| c.first())
        .map(|best| best.score)
        .sum();

    debug!(
        "built problem: {} slots, {} tutors, {} eligible pairs",
        slots.len(),
        tutors.len(),
        candidates.iter().map(|c| c.len()).sum::<usize>()
    );

    ProblemInstance {
        slots,
        tutors,
        candidates,
        theoretical_max,
    }
}

/// Total score of an assignment under this problem's candidate lists.
/// Slots assigned to a non-candidate contribute nothing.
pub fn assignment_score(problem: &ProblemInstance, assignment: &[Option<usize>]) -> f64 {
    assignment
        .iter()
        .enumerate()
        .filter_map(|(slot, tutor)| {
            tutor.and_then(|t| {
                problem.candidates[slot]
                    .iter()
                    .find(|c| c.tutor == t)
                    .map(|c| c.score)
            })
        })
        .sum()
}

/// True when no tutor occupies more than one slot and every assignment is
/// to an eligible candidate.
pub fn is_feasible(problem: &ProblemInstance, assignment: &[Option<usize>]) -> bool {
    if assignment.len() != problem.slots.len() {
        return false;
    }
    let assigned: Vec<usize> = assignment.iter().filter_map(|t| *t).collect();
    if assigned.iter().duplicates().next().is_some() {
        return false;
    }
    assignment.iter().enumerate().all(|(slot, tutor)| match tutor {
        Some(t) => problem.candidates[slot].iter().any(|c| c.tutor == *t),
        None => true,
    })
}
