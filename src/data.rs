use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Literal sentinel the result consumer pattern-matches on for an
/// unallocated slot.
pub const NO_TUTOR: &str = "No tutor";
/// Literal sentinel used for the grade/preference fields of an
/// unallocated slot.
pub const NO_PREFERENCE: &str = "No preference";

/// A course offering one or more classes. Every class is a distinct
/// allocation slot.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub name: String,
    pub classes: u32,
}

/// One tutor candidacy: a tutor's grade and preference rank for a single
/// course. At most one record per `(student_id, course)` pair.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TutorRecord {
    pub student_id: String,
    pub course: String,
    /// Grade in [0, 10].
    pub grade: f64,
    /// Preference rank, 1 = most preferred.
    pub preference: u32,
}

/// Solver strategy selected by the caller. The engine never auto-switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Exact ILP formulation. `"linear"` is the legacy wire name.
    #[serde(alias = "linear")]
    IntegerProgramming,
    /// Heuristic genetic algorithm.
    Genetic,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::IntegerProgramming => write!(f, "integer_programming"),
            Strategy::Genetic => write!(f, "genetic"),
        }
    }
}

/// Run parameters shared by both solvers, plus the heuristic-only knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationParameters {
    /// Tutors with a grade below this threshold are excluded from candidacy.
    pub min_grade: f64,
    /// 0 or 1: whether preference rank perturbs the score.
    pub use_preference: u8,
    /// Generation budget, genetic strategy only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_number: Option<u32>,
    /// Population size, genetic strategy only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub population_size: Option<u32>,
    /// Fixed RNG seed for reproducible heuristic runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl AllocationParameters {
    pub fn prefers(&self) -> bool {
        self.use_preference != 0
    }
}

/// A complete problem instance, immutable once dispatched to a solver.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRequest {
    /// Caller-supplied token correlating this request with a later
    /// cancellation.
    pub run_id: String,
    #[serde(rename = "algorithm")]
    pub strategy: Strategy,
    pub courses: Vec<Course>,
    pub tutors: Vec<TutorRecord>,
    #[serde(flatten)]
    pub parameters: AllocationParameters,
}

impl AllocationRequest {
    /// Fail-fast contract check, run before any worker is spawned.
    ///
    /// Tutor records naming a course that is not offered are not an error;
    /// they are simply never eligible for any slot.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.run_id.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "run identifier must not be empty".to_string(),
            ));
        }
        if self.courses.is_empty() {
            return Err(EngineError::InvalidInput(
                "at least one course is required".to_string(),
            ));
        }

        let mut seen_courses = HashSet::new();
        for course in &self.courses {
            if course.classes == 0 {
                return Err(EngineError::InvalidInput(format!(
                    "course '{}' must offer at least one class",
                    course.name
                )));
            }
            if !seen_courses.insert(course.name.to_lowercase()) {
                return Err(EngineError::InvalidInput(format!(
                    "duplicate course '{}'",
                    course.name
                )));
            }
        }

        let mut seen_records = HashSet::new();
        for record in &self.tutors {
            if !(0.0..=10.0).contains(&record.grade) {
                return Err(EngineError::InvalidInput(format!(
                    "grade {} of tutor '{}' is outside [0, 10]",
                    record.grade, record.student_id
                )));
            }
            if record.preference == 0 {
                return Err(EngineError::InvalidInput(format!(
                    "preference rank of tutor '{}' for '{}' must be positive",
                    record.student_id, record.course
                )));
            }
            if !seen_records.insert((record.student_id.as_str(), record.course.as_str())) {
                return Err(EngineError::InvalidInput(format!(
                    "duplicate record for tutor '{}' and course '{}'",
                    record.student_id, record.course
                )));
            }
        }

        if !(0.0..=10.0).contains(&self.parameters.min_grade) {
            return Err(EngineError::InvalidInput(format!(
                "minimum grade {} is outside [0, 10]",
                self.parameters.min_grade
            )));
        }
        if self.parameters.use_preference > 1 {
            return Err(EngineError::InvalidInput(
                "usePreference must be 0 or 1".to_string(),
            ));
        }
        if self.strategy == Strategy::Genetic {
            match (
                self.parameters.generation_number,
                self.parameters.population_size,
            ) {
                (Some(generations), Some(population)) if generations > 0 && population > 0 => {}
                _ => {
                    return Err(EngineError::InvalidInput(
                        "genetic strategy requires positive generationNumber and populationSize"
                            .to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn total_classes(&self) -> u32 {
        self.courses.iter().map(|c| c.classes).sum()
    }
}

/// A number for an assigned row, or a literal sentinel string for an
/// unallocated one. The consumer relies on the sentinel being a string.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RowValue {
    Number(f64),
    Text(String),
}

/// The assigned tutor's course-to-grade vector, or the "No preference"
/// sentinel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PreferenceValue {
    Vector(BTreeMap<String, f64>),
    Text(String),
}

/// One result row per class slot. Field names are part of the consumer
/// contract and must not change.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationRow {
    pub class: String,
    pub student: String,
    pub grade: RowValue,
    pub preference: PreferenceValue,
}

impl AllocationRow {
    pub fn is_allocated(&self) -> bool {
        self.student != NO_TUTOR
    }
}

/// Summary metrics of a finished run. The two optional fields are reported
/// by the genetic solver only.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationMetrics {
    pub number_classes_allocated: u32,
    pub total_classes: u32,
    /// Wall-clock solve time in seconds.
    pub execution_time: f64,
    /// Mean grade over allocated slots, 0 when nothing was allocated.
    pub average_grade: f64,
    /// Raw best-individual encoding, one tutor id per slot with "0" for an
    /// unassigned slot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_individual: Option<Vec<String>>,
    /// Best fitness normalized against the unconstrained per-slot maximum,
    /// in [0, 1].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub satisfaction: Option<f64>,
}

/// Result of one allocation run, produced exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationResult {
    pub metrics: AllocationMetrics,
    pub results: Vec<AllocationRow>,
}

/// Wire envelope the caller unpacks: `{ "data": { "metrics": ..., "results": ... } }`.
#[derive(Debug, Clone, Serialize)]
pub struct ResultEnvelope {
    pub data: AllocationResult,
}
