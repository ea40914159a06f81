//! Portable direct convolution, one solver per direction. Slow but accepts
//! any 2-D F32/F16 problem, grouped ones included.

use crate::capability::SolverFamily;
use crate::error::ConvResult;
use crate::invoker::{ConvShape, InvokerFactory};
use crate::problem::{DataType, Direction, ProblemDescription};
use crate::solution::{ConvSolution, KernelInfo};

use super::{config_mismatch, Solver, SolverConfig};

const KERNEL_FILE: &str = "naive_conv.cpp";
const BLOCK_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvDirectNaive {
    direction: Direction,
}

impl ConvDirectNaive {
    pub const fn new(direction: Direction) -> Self {
        Self { direction }
    }

    pub const fn forward() -> Self {
        Self::new(Direction::Forward)
    }

    pub const fn backward_data() -> Self {
        Self::new(Direction::BackwardData)
    }

    pub const fn backward_weights() -> Self {
        Self::new(Direction::BackwardWeights)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Workgroups: one per `(n, k)` output plane, one per `(n, c)` input
    /// plane, or one per `(k, c / group)` filter.
    fn grid_size(&self, problem: &ProblemDescription) -> usize {
        match self.direction {
            Direction::Forward => problem.n * problem.k,
            Direction::BackwardData => problem.n * problem.c,
            Direction::BackwardWeights => problem.k * (problem.c / problem.group_count),
        }
    }
}

fn type_define(dtype: DataType) -> &'static str {
    match dtype {
        DataType::F16 => "-DCONV_USE_FP16=1",
        _ => "-DCONV_USE_FP32=1",
    }
}

impl Solver for ConvDirectNaive {
    fn id(&self) -> &'static str {
        match self.direction {
            Direction::Forward => "ConvDirectNaiveFwd",
            Direction::BackwardData => "ConvDirectNaiveBwd",
            Direction::BackwardWeights => "ConvDirectNaiveWrw",
        }
    }

    fn family(&self) -> SolverFamily {
        SolverFamily::DirectNaive
    }

    fn find_config(&self, problem: &ProblemDescription) -> Option<SolverConfig> {
        if problem.direction != self.direction || !problem.is_2d() {
            return None;
        }
        if !matches!(problem.dtype, DataType::F32 | DataType::F16) {
            return None;
        }
        if problem.c % problem.group_count != 0 || problem.k % problem.group_count != 0 {
            return None;
        }
        Some(SolverConfig::DirectNaive {
            kernel_name: format!(
                "naive_conv_{}_nchw_{}",
                self.direction,
                problem.dtype.kernel_suffix()
            ),
            block_size: BLOCK_SIZE,
            grid_size: self.grid_size(problem),
        })
    }

    fn config_workspace_size(&self, _problem: &ProblemDescription, _config: &SolverConfig) -> usize {
        0
    }

    fn build(
        &self,
        problem: &ProblemDescription,
        config: &SolverConfig,
    ) -> ConvResult<ConvSolution> {
        let SolverConfig::DirectNaive {
            kernel_name,
            block_size,
            grid_size,
        } = config
        else {
            return Err(config_mismatch(self.id(), config));
        };
        log::debug!("{KERNEL_FILE}:{kernel_name}");
        Ok(ConvSolution {
            solver_id: self.id().to_string(),
            network_config: problem.network_config(),
            construction_params: vec![KernelInfo::linear(
                KERNEL_FILE,
                kernel_name.as_str(),
                type_define(problem.dtype),
                *grid_size,
                *block_size,
            )],
            workspace_size: 0,
            invoker_factory: InvokerFactory::DirectNaive {
                direction: self.direction,
                shape: ConvShape::from(problem),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceInfo;
    use crate::problem::ProblemBuilder;

    fn problem(direction: Direction, dtype: DataType) -> ProblemDescription {
        ProblemBuilder::new(direction)
            .device(DeviceInfo::new("gfx1030"))
            .dtype(dtype)
            .batch(2)
            .in_channels(6)
            .out_channels(4)
            .group_count(2)
            .input(5, 5)
            .window(3, 3)
            .build()
            .expect("problem")
    }

    #[test]
    fn kernel_names_and_grids_per_direction() {
        let cases = [
            (ConvDirectNaive::forward(), "naive_conv_fwd_nchw_float", 8),
            (ConvDirectNaive::backward_data(), "naive_conv_bwd_nchw_float", 12),
            (ConvDirectNaive::backward_weights(), "naive_conv_wrw_nchw_float", 12),
        ];
        for (solver, name, blocks) in cases {
            let problem = problem(solver.direction(), DataType::F32);
            let solution = solver.solution(&problem).expect("solution");
            let info = &solution.construction_params[0];
            assert_eq!(info.kernel_name, name);
            assert_eq!(info.grid_blocks(), blocks);
            assert_eq!(info.comp_options, "-DCONV_USE_FP32=1");
            assert_eq!(solution.workspace_size, 0);
        }
    }

    #[test]
    fn half_precision_is_supported_bf16_is_not() {
        let solver = ConvDirectNaive::forward();
        let half = problem(Direction::Forward, DataType::F16);
        let config = solver.find_config(&half).expect("f16");
        assert_eq!(config.kernel_name(), "naive_conv_fwd_nchw_half");
        assert!(!solver.is_applicable(&problem(Direction::Forward, DataType::BF16)));
    }

    #[test]
    fn each_solver_only_takes_its_direction() {
        let solver = ConvDirectNaive::backward_data();
        assert!(!solver.is_applicable(&problem(Direction::Forward, DataType::F32)));
        assert!(solver.is_applicable(&problem(Direction::BackwardData, DataType::F32)));
    }
}
