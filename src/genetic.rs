use crate::constraints::ProblemInstance;
use crate::error::EngineError;
use log::{info, trace};
use rand::prelude::*;
use rand::rngs::SmallRng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

/// Share of newly bred children that skip crossover and clone a parent.
const CROSSOVER_RATE: f64 = 0.85;
/// Per-slot probability of a random reassignment during mutation.
const MUTATION_RATE: f64 = 0.2;
/// Tournament size for parent selection.
const TOURNAMENT_SIZE: usize = 3;

/// Knobs of one heuristic run. Generation and population budgets come from
/// the caller; a fixed seed makes the run reproducible bit-for-bit.
#[derive(Debug, Clone)]
pub struct GeneticConfig {
    pub generations: u32,
    pub population_size: u32,
    pub seed: Option<u64>,
}

/// Outcome of a heuristic run. `assignment` is the best feasible
/// individual seen across all generations.
#[derive(Debug, Clone)]
pub struct GeneticOutcome {
    pub assignment: Vec<Option<usize>>,
    pub best_fitness: f64,
    /// Best fitness normalized against the unconstrained maximum, in [0, 1].
    pub satisfaction: f64,
    pub generations_run: u32,
}

/// An assignment encoded as one optional tutor index per slot.
type Individual = Vec<Option<usize>>;

/// Approximates the maximum-score assignment with a generational genetic
/// algorithm: tournament selection (size 3), uniform crossover, per-slot
/// mutation, repair after every variation step and unconditional survival
/// of the best individual. Repair keeps every individual feasible, so the
/// reported best can never double-book a tutor.
///
/// The cancel flag is checked once per generation.
pub fn solve(
    problem: &ProblemInstance,
    config: &GeneticConfig,
    cancel: &AtomicBool,
) -> Result<GeneticOutcome, EngineError> {
    let slot_count = problem.slots.len();
    if problem.is_degenerate() {
        info!("no eligible pairs; returning the empty assignment");
        return Ok(GeneticOutcome {
            assignment: vec![None; slot_count],
            best_fitness: 0.0,
            satisfaction: 0.0,
            generations_run: 0,
        });
    }

    let mut rng = match config.seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_entropy(),
    };
    // score lookup per slot, keyed by tutor index
    let scores: Vec<HashMap<usize, f64>> = problem
        .candidates
        .iter()
        .map(|candidates| candidates.iter().map(|c| (c.tutor, c.score)).collect())
        .collect();

    let population_size = (config.population_size as usize).max(1);
    info!(
        "starting genetic search: {} generations, population {}, {} slots",
        config.generations, population_size, slot_count
    );

    let mut population: Vec<Individual> = (0..population_size)
        .map(|_| random_individual(problem, &mut rng))
        .collect();
    let mut fitnesses: Vec<f64> = population.iter().map(|i| fitness(i, &scores)).collect();

    let mut best_index = argmax(&fitnesses);
    let mut best = population[best_index].clone();
    let mut best_fitness = fitnesses[best_index];
    let mut generations_run = 0;

    for generation in 0..config.generations {
        if cancel.load(Ordering::Relaxed) {
            info!("genetic search cancelled at generation {generation}");
            return Err(EngineError::Cancelled);
        }

        let mut next: Vec<Individual> = Vec::with_capacity(population_size);
        // elitism: the best individual seen so far survives unconditionally
        next.push(best.clone());

        while next.len() < population_size {
            let parent_a = tournament(&population, &fitnesses, &mut rng);
            let parent_b = tournament(&population, &fitnesses, &mut rng);
            let mut child = if rng.gen_bool(CROSSOVER_RATE) {
                crossover(parent_a, parent_b, &mut rng)
            } else {
                parent_a.clone()
            };
            mutate(&mut child, problem, &mut rng);
            repair(&mut child, problem);
            next.push(child);
        }

        population = next;
        fitnesses = population.iter().map(|i| fitness(i, &scores)).collect();
        best_index = argmax(&fitnesses);
        if fitnesses[best_index] > best_fitness {
            best = population[best_index].clone();
            best_fitness = fitnesses[best_index];
        }
        generations_run = generation + 1;
        trace!("generation {generation}: best fitness {best_fitness:.4}");
    }

    if !crate::constraints::is_feasible(problem, &best) {
        return Err(EngineError::SolverFault(
            "best individual violates feasibility after repair".to_string(),
        ));
    }

    let satisfaction = if problem.theoretical_max > f64::EPSILON {
        (best_fitness / problem.theoretical_max).clamp(0.0, 1.0)
    } else {
        0.0
    };
    info!(
        "genetic search finished after {generations_run} generations, best fitness {best_fitness:.4}, satisfaction {satisfaction:.4}"
    );

    Ok(GeneticOutcome {
        assignment: best,
        best_fitness,
        satisfaction,
        generations_run,
    })
}

/// Visits slots in random order and assigns a random still-unused eligible
/// candidate to each, leaving uncoverable slots empty.
fn random_individual(problem: &ProblemInstance, rng: &mut SmallRng) -> Individual {
    let mut individual = vec![None; problem.slots.len()];
    let mut order: Vec<usize> = (0..problem.slots.len()).collect();
    order.shuffle(rng);
    let mut used: HashSet<usize> = HashSet::new();
    for slot in order {
        let free: Vec<usize> = problem.candidates[slot]
            .iter()
            .map(|c| c.tutor)
            .filter(|t| !used.contains(t))
            .collect();
        if let Some(tutor) = free.choose(rng) {
            used.insert(*tutor);
            individual[slot] = Some(*tutor);
        }
    }
    individual
}

fn fitness(individual: &Individual, scores: &[HashMap<usize, f64>]) -> f64 {
    individual
        .iter()
        .enumerate()
        .filter_map(|(slot, tutor)| tutor.and_then(|t| scores[slot].get(&t)))
        .sum()
}

fn argmax(fitnesses: &[f64]) -> usize {
    let mut best = 0;
    for (index, value) in fitnesses.iter().enumerate() {
        if *value > fitnesses[best] {
            best = index;
        }
    }
    best
}

fn tournament<'a>(
    population: &'a [Individual],
    fitnesses: &[f64],
    rng: &mut SmallRng,
) -> &'a Individual {
    let mut winner = rng.gen_range(0..population.len());
    for _ in 1..TOURNAMENT_SIZE {
        let challenger = rng.gen_range(0..population.len());
        if fitnesses[challenger] > fitnesses[winner] {
            winner = challenger;
        }
    }
    &population[winner]
}

/// Uniform crossover: each slot inherits from either parent with equal
/// probability. The result may double-book and is repaired by the caller.
fn crossover(a: &Individual, b: &Individual, rng: &mut SmallRng) -> Individual {
    a.iter()
        .zip(b)
        .map(|(x, y)| if rng.gen_bool(0.5) { *x } else { *y })
        .collect()
}

/// Reassigns each slot with small probability to a random candidate for
/// that slot, occasionally clearing it to explore partial coverage.
fn mutate(individual: &mut Individual, problem: &ProblemInstance, rng: &mut SmallRng) {
    for (slot, gene) in individual.iter_mut().enumerate() {
        if !rng.gen_bool(MUTATION_RATE) {
            continue;
        }
        let candidates = &problem.candidates[slot];
        if candidates.is_empty() || rng.gen_range(0..=candidates.len()) == candidates.len() {
            *gene = None;
        } else if let Some(candidate) = candidates.choose(rng) {
            *gene = Some(candidate.tutor);
        }
    }
}

/// Restores feasibility: clears duplicate or ineligible assignments in slot
/// order, then greedily refills empty slots with the best unused candidate.
fn repair(individual: &mut Individual, problem: &ProblemInstance) {
    let mut used: HashSet<usize> = HashSet::new();
    for (slot, gene) in individual.iter_mut().enumerate() {
        if let Some(tutor) = *gene {
            let eligible = problem.candidates[slot].iter().any(|c| c.tutor == tutor);
            if !eligible || !used.insert(tutor) {
                *gene = None;
            }
        }
    }
    for (slot, gene) in individual.iter_mut().enumerate() {
        if gene.is_some() {
            continue;
        }
        // candidate lists are sorted best-first
        if let Some(candidate) = problem.candidates[slot]
            .iter()
            .find(|c| !used.contains(&c.tutor))
        {
            used.insert(candidate.tutor);
            *gene = Some(candidate.tutor);
        }
    }
}
