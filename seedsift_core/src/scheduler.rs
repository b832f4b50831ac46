use crate::frontier::FrontierSnapshot;
use crate::library::SymbolTable;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("symbol table is empty, cannot schedule a combination")]
    NoSymbols,
}

/// Picks which API symbols a generator is asked to combine next.
pub trait Scheduler: Send {
    fn next(
        &mut self,
        symbols: &SymbolTable,
        snapshot: &FrontierSnapshot,
    ) -> Result<Vec<String>, SchedulerError>;

    /// Tells the scheduler whether a candidate built from `combination` was
    /// admitted.
    fn report_feedback(&mut self, combination: &[String], admitted: bool);
}

/// Power schedule over symbols: a symbol's energy falls with the number of
/// admitted seeds already calling it and with how often it was scheduled
/// without payoff.
#[derive(Debug)]
pub struct CombinationScheduler {
    rng: ChaCha8Rng,
    size: usize,
    scheduled: BTreeMap<String, u64>,
}

impl CombinationScheduler {
    pub fn new(seed: u64, size: usize) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            size: size.max(1),
            scheduled: BTreeMap::new(),
        }
    }

    pub fn energy(&self, symbol: &str, snapshot: &FrontierSnapshot) -> f64 {
        let used = snapshot.call_frequency.get(symbol).copied().unwrap_or(0) as f64;
        let tried = self.scheduled.get(symbol).copied().unwrap_or(0) as f64;
        1.0 / ((1.0 + used) * (1.0 + tried.ln_1p()))
    }
}

impl Scheduler for CombinationScheduler {
    fn next(
        &mut self,
        symbols: &SymbolTable,
        snapshot: &FrontierSnapshot,
    ) -> Result<Vec<String>, SchedulerError> {
        if symbols.is_empty() {
            return Err(SchedulerError::NoSymbols);
        }
        let mut pool: Vec<(String, f64)> = symbols
            .symbols()
            .iter()
            .map(|s| (s.clone(), self.energy(s, snapshot)))
            .collect();

        let mut picked = Vec::with_capacity(self.size.min(pool.len()));
        while picked.len() < self.size && !pool.is_empty() {
            let total: f64 = pool.iter().map(|(_, e)| e).sum();
            let mut point = self.rng.random::<f64>() * total;
            let mut idx = pool.len() - 1;
            for (i, (_, energy)) in pool.iter().enumerate() {
                if point < *energy {
                    idx = i;
                    break;
                }
                point -= energy;
            }
            let (symbol, _) = pool.swap_remove(idx);
            picked.push(symbol);
        }
        for symbol in &picked {
            *self.scheduled.entry(symbol.clone()).or_insert(0) += 1;
        }
        Ok(picked)
    }

    fn report_feedback(&mut self, combination: &[String], admitted: bool) {
        if !admitted {
            return;
        }
        for symbol in combination {
            if let Some(count) = self.scheduled.get_mut(symbol) {
                *count /= 2;
            }
        }
    }
}
