//! Solver contract and the built-in solvers.
//!
//! A solver is a stateless strategy. [`Solver::find_config`] runs every
//! applicability predicate and the tiling search in one pass; the provided
//! methods layer the classic applicability / workspace / solution operations
//! on top of it so all three always agree.

mod direct_naive;
mod igemm_v4r1_dynamic_fwd;
mod igemm_v4r1_dynamic_wrw;

use crate::capability::SolverFamily;
use crate::error::{ConvError, ConvResult};
use crate::problem::ProblemDescription;
use crate::solution::ConvSolution;

pub use direct_naive::ConvDirectNaive;
pub use igemm_v4r1_dynamic_fwd::ConvAsmImplicitGemmV4R1DynamicFwd;
pub use igemm_v4r1_dynamic_wrw::{gemmk_groups, ConvAsmImplicitGemmV4R1DynamicWrw};

/// Launch configuration chosen by a solver's search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolverConfig {
    ImplicitGemmWrw {
        kernel_name: &'static str,
        block_size: usize,
        grid_size: usize,
        gemmk_groups: usize,
    },
    ImplicitGemmFwd {
        kernel_name: &'static str,
        block_size: usize,
        grid_size: usize,
    },
    DirectNaive {
        kernel_name: String,
        block_size: usize,
        grid_size: usize,
    },
}

impl SolverConfig {
    pub fn kernel_name(&self) -> &str {
        match self {
            SolverConfig::ImplicitGemmWrw { kernel_name, .. }
            | SolverConfig::ImplicitGemmFwd { kernel_name, .. } => kernel_name,
            SolverConfig::DirectNaive { kernel_name, .. } => kernel_name,
        }
    }

    /// Workgroups launched by the main kernel.
    pub fn grid_size(&self) -> usize {
        match self {
            SolverConfig::ImplicitGemmWrw { grid_size, .. }
            | SolverConfig::ImplicitGemmFwd { grid_size, .. }
            | SolverConfig::DirectNaive { grid_size, .. } => *grid_size,
        }
    }

    pub fn block_size(&self) -> usize {
        match self {
            SolverConfig::ImplicitGemmWrw { block_size, .. }
            | SolverConfig::ImplicitGemmFwd { block_size, .. }
            | SolverConfig::DirectNaive { block_size, .. } => *block_size,
        }
    }
}

/// Proof that a solver accepted a specific problem. Only [`Solver::check`]
/// mints one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applicable {
    solver: &'static str,
    fingerprint: u64,
    config: SolverConfig,
}

impl Applicable {
    pub fn solver_id(&self) -> &'static str {
        self.solver
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }
}

pub trait Solver: Send + Sync {
    /// Stable identifier, used as the kernel cache namespace.
    fn id(&self) -> &'static str;

    fn family(&self) -> SolverFamily;

    /// Runs all applicability predicates and the configuration search.
    /// `None` means not applicable. Must be pure.
    fn find_config(&self, problem: &ProblemDescription) -> Option<SolverConfig>;

    fn config_workspace_size(&self, problem: &ProblemDescription, config: &SolverConfig) -> usize;

    fn build(&self, problem: &ProblemDescription, config: &SolverConfig)
        -> ConvResult<ConvSolution>;

    fn check(&self, problem: &ProblemDescription) -> Option<Applicable> {
        self.find_config(problem).map(|config| Applicable {
            solver: self.id(),
            fingerprint: problem.fingerprint(),
            config,
        })
    }

    fn is_applicable(&self, problem: &ProblemDescription) -> bool {
        self.check(problem).is_some()
    }

    /// Scratch bytes the solution needs. Fails for inapplicable problems.
    fn workspace_size(&self, problem: &ProblemDescription) -> ConvResult<usize> {
        let token = require_applicable(self, problem)?;
        Ok(self.config_workspace_size(problem, &token.config))
    }

    fn solution(&self, problem: &ProblemDescription) -> ConvResult<ConvSolution> {
        let token = require_applicable(self, problem)?;
        self.build(problem, &token.config)
    }

    /// Builds from a token obtained from [`Solver::check`] on this solver and
    /// this exact problem.
    fn solution_for(
        &self,
        problem: &ProblemDescription,
        token: &Applicable,
    ) -> ConvResult<ConvSolution> {
        if token.solver != self.id() {
            return Err(ConvError::inconsistency(
                self.id(),
                format!("token was issued by {}", token.solver),
            ));
        }
        if token.fingerprint != problem.fingerprint() {
            return Err(ConvError::inconsistency(
                self.id(),
                "token was issued for a different problem",
            ));
        }
        self.build(problem, &token.config)
    }
}

fn require_applicable<S: Solver + ?Sized>(
    solver: &S,
    problem: &ProblemDescription,
) -> ConvResult<Applicable> {
    solver.check(problem).ok_or_else(|| {
        ConvError::inconsistency(
            solver.id(),
            format!("solver is not applicable to {problem}"),
        )
    })
}

pub(crate) fn config_mismatch(solver: &str, config: &SolverConfig) -> ConvError {
    ConvError::inconsistency(solver, format!("unexpected configuration {config:?}"))
}
