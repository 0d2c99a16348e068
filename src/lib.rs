//! Tutor-to-class allocation engine.
//!
//! Courses declare class slots, tutors hold graded per-course candidacies,
//! and the engine assigns at most one tutor per slot (and at most one slot
//! per tutor) maximising a grade-plus-preference score. Two interchangeable
//! strategies are exposed: an exact ILP formulation and a seedable genetic
//! algorithm. The [`orchestrator::Orchestrator`] owns run lifecycles and
//! per-run cooperative cancellation; [`server`] exposes the HTTP contract.

pub mod constraints;
pub mod data;
pub mod error;
pub mod exact;
pub mod genetic;
pub mod orchestrator;
pub mod server;

pub use data::{
    AllocationMetrics, AllocationParameters, AllocationRequest, AllocationResult, AllocationRow,
    Course, ResultEnvelope, Strategy, TutorRecord,
};
pub use error::EngineError;
pub use orchestrator::{Orchestrator, RunOutcome, RunTicket};
