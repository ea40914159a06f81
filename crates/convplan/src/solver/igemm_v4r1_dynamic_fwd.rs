//! Forward convolution through the dynamic implicit-GEMM v4r1 assembly
//! kernels. GEMM view: `M = k`, `N = n * ho * wo`, `K = c * y * x`.

use crate::capability::{self, SolverFamily};
use crate::error::ConvResult;
use crate::invoker::{ConvShape, InvokerFactory};
use crate::problem::ProblemDescription;
use crate::solution::{ConvSolution, KernelInfo};

use super::{config_mismatch, Solver, SolverConfig};

const GEMM_M_PER_BLOCK: usize = 128;
const GEMM_N_PER_BLOCK: usize = 128;
const GEMM_K_PER_BLOCK: usize = 16;
const BLOCK_SIZE: usize = 256;

const KERNEL_FILE: &str = "igemm_v4r1_dynamic.s";
const KERNEL_1X1: &str = "igemm_v4r1_1x1_dynamic_128x128x16_8x8_4x4x4x4x4x4_16x1x16x1_16x1x16x1";
const KERNEL_GENERIC: &str = "igemm_v4r1_dynamic_128x128x16_8x8_4x4x4x4x4x4_16x1x16x1_16x1x16x1";

fn is_pointwise(problem: &ProblemDescription) -> bool {
    problem.y == 1
        && problem.x == 1
        && problem.stride_h == 1
        && problem.stride_w == 1
        && problem.dilation_h == 1
        && problem.dilation_w == 1
        && problem.pad_h == 0
        && problem.pad_w == 0
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConvAsmImplicitGemmV4R1DynamicFwd;

impl Solver for ConvAsmImplicitGemmV4R1DynamicFwd {
    fn id(&self) -> &'static str {
        "ConvAsmImplicitGemmV4R1DynamicFwd"
    }

    fn family(&self) -> SolverFamily {
        SolverFamily::ImplicitGemmAsmDynamic
    }

    fn find_config(&self, problem: &ProblemDescription) -> Option<SolverConfig> {
        if !capability::supports(&problem.device.name, self.family())
            || !problem.direction.is_forward()
            || !problem.is_2d()
            || !problem.is_fp32()
            || !problem.code_object.is_v3()
            || problem.group_count != 1
        {
            return None;
        }

        let gemm_m = problem.k;
        let gemm_n = problem.n * problem.ho * problem.wo;
        let gemm_k = problem.c * problem.y * problem.x;
        if gemm_m % GEMM_M_PER_BLOCK != 0
            || gemm_n % GEMM_N_PER_BLOCK != 0
            || gemm_k % GEMM_K_PER_BLOCK != 0
        {
            return None;
        }

        let kernel_name = if is_pointwise(problem) {
            KERNEL_1X1
        } else {
            KERNEL_GENERIC
        };
        Some(SolverConfig::ImplicitGemmFwd {
            kernel_name,
            block_size: BLOCK_SIZE,
            grid_size: (gemm_m / GEMM_M_PER_BLOCK) * (gemm_n / GEMM_N_PER_BLOCK),
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
        let SolverConfig::ImplicitGemmFwd {
            kernel_name,
            block_size,
            grid_size,
        } = config
        else {
            return Err(config_mismatch(self.id(), config));
        };

        let options = format!(
            "-Wa,-defsym,ROCM_METADATA_VERSION={}",
            problem.code_object.metadata_version()
        );
        log::debug!("{KERNEL_FILE}:{kernel_name}");
        Ok(ConvSolution {
            solver_id: self.id().to_string(),
            network_config: problem.network_config(),
            construction_params: vec![KernelInfo::linear(
                KERNEL_FILE,
                *kernel_name,
                options,
                *grid_size,
                *block_size,
            )],
            workspace_size: 0,
            invoker_factory: InvokerFactory::ImplicitGemmDynamicFwd {
                shape: ConvShape::from(problem),
            },
        })
    }
}
