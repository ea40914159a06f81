//! Ordered solver list used to pick a plan for a problem.

use std::fmt;

use crate::env;
use crate::error::{ConvError, ConvResult};
use crate::problem::{Direction, ProblemDescription};
use crate::solution::ConvSolution;
use crate::solver::{
    Applicable, ConvAsmImplicitGemmV4R1DynamicFwd, ConvAsmImplicitGemmV4R1DynamicWrw,
    ConvDirectNaive, Solver,
};

/// Solvers in priority order: specialized kernels first, portable fallbacks
/// last.
pub struct SolverRegistry {
    solvers: Vec<Box<dyn Solver>>,
}

impl SolverRegistry {
    pub fn new() -> Self {
        Self::empty()
            .with(ConvAsmImplicitGemmV4R1DynamicFwd)
            .with(ConvAsmImplicitGemmV4R1DynamicWrw)
            .with(ConvDirectNaive::new(Direction::Forward))
            .with(ConvDirectNaive::new(Direction::BackwardData))
            .with(ConvDirectNaive::new(Direction::BackwardWeights))
    }

    pub fn empty() -> Self {
        Self {
            solvers: Vec::new(),
        }
    }

    /// Default registry without the solvers listed in
    /// `CONVPLAN_DISABLE_SOLVERS`.
    pub fn from_env() -> Self {
        let mut registry = Self::new();
        let disabled = env::disabled_solvers();
        if !disabled.is_empty() {
            log::debug!("disabling solvers {disabled:?}");
            registry.disable(&disabled);
        }
        registry
    }

    /// Appends `solver` at the lowest priority.
    pub fn with(mut self, solver: impl Solver + 'static) -> Self {
        self.register(Box::new(solver));
        self
    }

    pub fn register(&mut self, solver: Box<dyn Solver>) {
        self.solvers.push(solver);
    }

    /// Removes every solver whose id is in `ids`.
    pub fn disable<S: AsRef<str>>(&mut self, ids: &[S]) {
        self.solvers
            .retain(|solver| !ids.iter().any(|id| id.as_ref() == solver.id()));
    }

    pub fn len(&self) -> usize {
        self.solvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.solvers.is_empty()
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.solvers.iter().map(|solver| solver.id()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Solver> + '_ {
        self.solvers.iter().map(|solver| solver.as_ref())
    }

    pub fn by_id(&self, id: &str) -> Option<&dyn Solver> {
        self.iter().find(|solver| solver.id() == id)
    }

    /// Tokens of every applicable solver, in priority order.
    pub fn applicable(&self, problem: &ProblemDescription) -> Vec<Applicable> {
        self.iter().filter_map(|solver| solver.check(problem)).collect()
    }

    pub fn find_first(&self, problem: &ProblemDescription) -> Option<(&dyn Solver, Applicable)> {
        self.iter()
            .find_map(|solver| solver.check(problem).map(|token| (solver, token)))
    }

    /// Solution of the highest-priority applicable solver.
    pub fn find_solution(&self, problem: &ProblemDescription) -> ConvResult<ConvSolution> {
        let (solver, token) = self.find_first(problem).ok_or_else(|| ConvError::NoSolution {
            problem: problem.to_string(),
        })?;
        log::info!("selected solver {} for {}", solver.id(), problem);
        solver.solution_for(problem, &token)
    }
}

impl Default for SolverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}
