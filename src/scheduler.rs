//! The seed queue and its energy schedule.
//!
//! Seeds carry an energy score reflecting execution speed, coverage richness
//! and how often they have already been fuzzed. Under the energy strategy the
//! queue is a max-heap over that score; popping a seed bumps its use count,
//! rescored and reinserts it, so repeated selection decays its priority and
//! nothing starves. The FIFO strategy simply cycles through insertion order.

use std::collections::BinaryHeap;

use crate::config::SortStrategy;

/// Speed bands, AFL++ `calculate_score` style: ratio of the seed's exec time
/// to the queue average, mapped to a base score. Slower-than-average entries
/// first (largest ratio wins), faster-than-average after.
const SPEED_SLOW: &[(f64, f64)] = &[(10.0, 10.0), (4.0, 25.0), (2.0, 50.0), (4.0 / 3.0, 75.0)];
const SPEED_FAST: &[(f64, f64)] = &[(0.25, 300.0), (1.0 / 3.0, 200.0), (0.5, 150.0)];

/// Coverage bands: ratio of the seed's bitmap bits to the queue average,
/// mapped to a multiplier.
const COV_HIGH: &[(f64, f64)] = &[(10.0 / 3.0, 3.0), (2.0, 2.0), (4.0 / 3.0, 1.5)];
const COV_LOW: &[(f64, f64)] = &[(1.0 / 3.0, 0.25), (0.5, 0.5), (2.0 / 3.0, 0.75)];

const ENERGY_MIN: f64 = 1.0;
const ENERGY_MAX: f64 = 10000.0;

/// One queue entry.
#[derive(Debug, Clone)]
pub struct Seed {
    pub data: Vec<u8>,
    /// How many times this seed has been handed out for mutation.
    pub exec_count: u64,
    /// Set bits in the trace this seed produced when it was discovered.
    pub coverage_bits: u64,
    /// Wall time of its discovery execution, seconds.
    pub exec_time: f64,
    pub energy: f64,
    /// Insertion index, the deterministic tiebreak.
    order: u64,
}

impl PartialEq for Seed {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order
    }
}

impl Eq for Seed {}

impl PartialOrd for Seed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Seed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap on energy; earlier insertion wins ties.
        self.energy
            .total_cmp(&other.energy)
            .then_with(|| other.order.cmp(&self.order))
    }
}

enum SeedStore {
    Energy(BinaryHeap<Seed>),
    Fifo { seeds: Vec<Seed>, next: usize },
}

/// Aggregate view for telemetry and reports.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerStats {
    pub total_seeds: usize,
    pub avg_energy: f64,
    pub total_memory: usize,
}

pub struct SeedScheduler {
    strategy: SortStrategy,
    store: SeedStore,
    total_exec_time: f64,
    total_coverage: u64,
    total_memory: usize,
    max_seeds: usize,
    max_memory: usize,
    insertions: u64,
}

impl SeedScheduler {
    #[must_use]
    pub fn new(strategy: SortStrategy, max_seeds: usize, max_memory: usize) -> Self {
        let store = match strategy {
            SortStrategy::Energy => SeedStore::Energy(BinaryHeap::new()),
            SortStrategy::Fifo => SeedStore::Fifo {
                seeds: Vec::new(),
                next: 0,
            },
        };
        Self {
            strategy,
            store,
            total_exec_time: 0.0,
            total_coverage: 0,
            total_memory: 0,
            max_seeds,
            max_memory,
            insertions: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match &self.store {
            SeedStore::Energy(heap) => heap.len(),
            SeedStore::Fifo { seeds, .. } => seeds.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn strategy(&self) -> SortStrategy {
        self.strategy
    }

    #[must_use]
    pub fn total_exec_time(&self) -> f64 {
        self.total_exec_time
    }

    #[must_use]
    pub fn total_coverage(&self) -> u64 {
        self.total_coverage
    }

    #[must_use]
    pub fn total_memory(&self) -> usize {
        self.total_memory
    }

    /// Position of the FIFO cursor; always 0 under the energy strategy.
    #[must_use]
    pub fn fifo_index(&self) -> usize {
        match &self.store {
            SeedStore::Energy(_) => 0,
            SeedStore::Fifo { next, .. } => *next,
        }
    }

    pub fn set_fifo_index(&mut self, index: usize) {
        if let SeedStore::Fifo { seeds, next } = &mut self.store {
            *next = if seeds.is_empty() {
                0
            } else {
                index % seeds.len()
            };
        }
    }

    /// Adds a freshly discovered input.
    pub fn push(&mut self, data: Vec<u8>, coverage_bits: u64, exec_time: f64) {
        self.insert(Seed {
            data,
            exec_count: 0,
            coverage_bits,
            exec_time,
            energy: 0.0,
            order: 0,
        });
    }

    /// Re-adds a seed restored from a checkpoint, keeping its use count.
    pub fn restore(&mut self, data: Vec<u8>, exec_count: u64, coverage_bits: u64, exec_time: f64) {
        self.insert(Seed {
            data,
            exec_count,
            coverage_bits,
            exec_time,
            energy: 0.0,
            order: 0,
        });
    }

    fn insert(&mut self, mut seed: Seed) {
        self.total_exec_time += seed.exec_time;
        self.total_coverage += seed.coverage_bits;
        self.total_memory += seed.data.len();
        seed.order = self.insertions;
        self.insertions += 1;
        seed.energy = self.score(&seed);

        match &mut self.store {
            SeedStore::Energy(heap) => heap.push(seed),
            SeedStore::Fifo { seeds, .. } => seeds.push(seed),
        }
        self.enforce_capacity();
    }

    /// Hands out the next seed to mutate. Under the energy strategy the
    /// popped maximum is rescored with its bumped use count and reinserted,
    /// so the heap stays the single source of truth for priorities.
    pub fn pop(&mut self) -> Option<Seed> {
        if let SeedStore::Fifo { seeds, next } = &mut self.store {
            if seeds.is_empty() {
                return None;
            }
            if *next >= seeds.len() {
                *next = 0;
            }
            let seed = &mut seeds[*next];
            seed.exec_count += 1;
            let out = seed.clone();
            *next = (*next + 1) % seeds.len();
            return Some(out);
        }

        let mut seed = match &mut self.store {
            SeedStore::Energy(heap) => heap.pop()?,
            SeedStore::Fifo { .. } => return None,
        };
        seed.exec_count += 1;
        seed.energy = self.score(&seed);
        let out = seed.clone();
        if let SeedStore::Energy(heap) = &mut self.store {
            heap.push(seed);
        }
        Some(out)
    }

    fn score(&self, seed: &Seed) -> f64 {
        score_seed(
            seed,
            self.len() as f64,
            self.total_exec_time,
            self.total_coverage as f64,
        )
    }

    /// Drops seeds until both the count and memory bounds hold again. The
    /// lowest-energy seed goes first under the energy strategy, the oldest
    /// under FIFO. The last remaining seed is never evicted.
    fn enforce_capacity(&mut self) {
        while self.len() > 1 && (self.len() > self.max_seeds || self.total_memory > self.max_memory)
        {
            let victim = match &mut self.store {
                SeedStore::Energy(heap) => {
                    let mut seeds = std::mem::take(heap).into_vec();
                    let min_idx = seeds
                        .iter()
                        .enumerate()
                        .min_by(|(_, a), (_, b)| a.cmp(b))
                        .map(|(i, _)| i)
                        .expect("capacity loop requires a non-empty store");
                    let victim = seeds.swap_remove(min_idx);
                    *heap = BinaryHeap::from(seeds);
                    victim
                }
                SeedStore::Fifo { seeds, next } => {
                    let oldest_idx = seeds
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, s)| s.order)
                        .map(|(i, _)| i)
                        .expect("capacity loop requires a non-empty store");
                    let victim = seeds.remove(oldest_idx);
                    if *next > oldest_idx {
                        *next -= 1;
                    }
                    if !seeds.is_empty() {
                        *next %= seeds.len();
                    } else {
                        *next = 0;
                    }
                    victim
                }
            };
            self.total_exec_time -= victim.exec_time;
            self.total_coverage -= victim.coverage_bits;
            self.total_memory -= victim.data.len();
            log::debug!(
                "evicted seed of {} bytes (energy {:.1}), {} left",
                victim.data.len(),
                victim.energy,
                self.len()
            );
        }
    }

    /// All current seeds, in no particular order.
    pub fn seeds(&self) -> Vec<&Seed> {
        match &self.store {
            SeedStore::Energy(heap) => heap.iter().collect(),
            SeedStore::Fifo { seeds, .. } => seeds.iter().collect(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let seeds = self.seeds();
        let avg_energy = if seeds.is_empty() {
            0.0
        } else {
            seeds.iter().map(|s| s.energy).sum::<f64>() / seeds.len() as f64
        };
        SchedulerStats {
            total_seeds: seeds.len(),
            avg_energy,
            total_memory: self.total_memory,
        }
    }
}

/// The energy function. Both bands are data so the schedule can be retuned
/// without touching control flow: base score from the speed band, multiplier
/// from the coverage band, then FAST-style decay by use count, clamped to
/// [1, 10000].
///
/// `stored` is the number of seeds currently in the queue not counting the
/// one being scored; the averages approximate including it.
fn score_seed(seed: &Seed, stored: f64, total_exec_time: f64, total_coverage: f64) -> f64 {
    let (avg_time, avg_cov) = if stored == 0.0 {
        (seed.exec_time, seed.coverage_bits as f64)
    } else {
        (
            total_exec_time / (stored + 1.0),
            total_coverage / (stored + 1.0),
        )
    };

    let mut score = 100.0;

    if avg_time > 0.0 {
        let ratio = seed.exec_time / avg_time;
        if let Some(&(_, banded)) = SPEED_SLOW.iter().find(|(t, _)| ratio >= *t) {
            score = banded;
        } else if let Some(&(_, banded)) = SPEED_FAST.iter().find(|(t, _)| ratio <= *t) {
            score = banded;
        }
    }

    if avg_cov > 0.0 {
        let ratio = seed.coverage_bits as f64 / avg_cov;
        if let Some(&(_, factor)) = COV_HIGH.iter().find(|(t, _)| ratio >= *t) {
            score *= factor;
        } else if let Some(&(_, factor)) = COV_LOW.iter().find(|(t, _)| ratio <= *t) {
            score *= factor;
        }
    }

    score /= 1.0 + 0.2 * seed.exec_count as f64;
    score.clamp(ENERGY_MIN, ENERGY_MAX)
}
