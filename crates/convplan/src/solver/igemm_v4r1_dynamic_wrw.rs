//! Weight gradient through the dynamic implicit-GEMM v4r1 assembly kernels.
//!
//! The GEMM view is `M = k`, `N = c * y * x`, `K = n * ho * wo`. Large `K` is
//! split into `gemmk_groups` slices that each write a partial weight gradient
//! into the workspace; a reduction kernel then sums the slices into `dw`.

use crate::capability::{self, SolverFamily};
use crate::error::ConvResult;
use crate::invoker::{ConvShape, InvokerFactory};
use crate::problem::ProblemDescription;
use crate::solution::{ConvSolution, KernelInfo};

use super::{config_mismatch, Solver, SolverConfig};

const GEMM_N_REPEAT: usize = 2;
const GEMM_N_PER_THREAD_SUB_C: usize = 4;
const GEMM_N0_YX_PER_BLOCK: usize = 16;
const GEMM_M_PER_BLOCK: usize = 128;
const GEMM_K_PER_BLOCK: usize = 16;
const GEMM_N_PER_BLOCK: usize = GEMM_N_REPEAT * GEMM_N_PER_THREAD_SUB_C * GEMM_N0_YX_PER_BLOCK;
const BLOCK_SIZE: usize = 256;
/// Group counts tried are `1 << 0` through `1 << (MAX_GROUP_SHIFT - 1)`.
const MAX_GROUP_SHIFT: u32 = 6;

const KERNEL_FILE: &str = "igemm_v4r1_wrw_dynamic.s";
const KERNEL_4X64: &str = "igemm_v4r1_dynamic_wrw_128x128x16_8x8_4x4x4x4x4x4_16x1x16x1_4x64";
const KERNEL_16X16: &str = "igemm_v4r1_dynamic_wrw_128x128x16_8x8_4x4x4x4x4x4_16x1x16x1_16x16";

const REDUCTION_FILE: &str = "wrw_reduction_hip.cpp";
const REDUCTION_KERNEL: &str = "wrw_reduction_hip";
const REDUCTION_PER_THREAD: usize = 8;
const REDUCTION_BLOCK_SIZE: usize = 256;
const REDUCTION_OPTIONS: &str = "-Wno-old-style-cast -Wno-cast-align";

/// Number of slices the GEMM `K` dimension is split into: the largest power
/// of two below 64 such that it and every smaller power of two times the K
/// tile divide `n * ho * wo`. The search stops at the first failure.
pub fn gemmk_groups(problem: &ProblemDescription) -> usize {
    let gemm_k = problem.n * problem.ho * problem.wo;
    let mut groups = 1;
    for shift in 0..MAX_GROUP_SHIFT {
        let candidate = 1usize << shift;
        if gemm_k % (candidate * GEMM_K_PER_BLOCK) != 0 {
            break;
        }
        groups = candidate;
    }
    groups
}

fn find_kernel(problem: &ProblemDescription) -> Option<SolverConfig> {
    let gemm_m = problem.k;
    let gemm_n = problem.c * problem.y * problem.x;
    let gemm_k = problem.n * problem.ho * problem.wo;

    if problem.c % (GEMM_N_REPEAT * GEMM_N_PER_THREAD_SUB_C) != 0 {
        return None;
    }
    if gemm_n % GEMM_N_PER_BLOCK != 0 {
        return None;
    }
    if gemm_m % GEMM_M_PER_BLOCK != 0 {
        return None;
    }
    let groups = gemmk_groups(problem);
    if gemm_k % (groups * GEMM_K_PER_BLOCK) != 0 {
        return None;
    }

    let grid_size = (gemm_m / GEMM_M_PER_BLOCK) * (gemm_n / GEMM_N_PER_BLOCK) * groups;
    let kernel_name = if (problem.ho * problem.wo) % 4 == 0 {
        KERNEL_4X64
    } else {
        KERNEL_16X16
    };
    Some(SolverConfig::ImplicitGemmWrw {
        kernel_name,
        block_size: BLOCK_SIZE,
        grid_size,
        gemmk_groups: groups,
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConvAsmImplicitGemmV4R1DynamicWrw;

impl Solver for ConvAsmImplicitGemmV4R1DynamicWrw {
    fn id(&self) -> &'static str {
        "ConvAsmImplicitGemmV4R1DynamicWrw"
    }

    fn family(&self) -> SolverFamily {
        SolverFamily::ImplicitGemmAsmDynamic
    }

    fn find_config(&self, problem: &ProblemDescription) -> Option<SolverConfig> {
        if !capability::supports(&problem.device.name, self.family()) {
            return None;
        }
        if !problem.direction.is_backward_weights() {
            return None;
        }
        if !problem.is_2d() {
            return None;
        }
        if !problem.is_fp32() {
            return None;
        }
        if !problem.code_object.is_v3() {
            return None;
        }
        if problem.group_count != 1 {
            return None;
        }
        find_kernel(problem)
    }

    fn config_workspace_size(&self, problem: &ProblemDescription, config: &SolverConfig) -> usize {
        let groups = match config {
            SolverConfig::ImplicitGemmWrw { gemmk_groups, .. } => *gemmk_groups,
            _ => return 0,
        };
        if groups == 1 {
            return 0;
        }
        problem.k * problem.c * problem.y * problem.x * problem.elem_size() * groups
    }

    fn build(
        &self,
        problem: &ProblemDescription,
        config: &SolverConfig,
    ) -> ConvResult<ConvSolution> {
        let SolverConfig::ImplicitGemmWrw {
            kernel_name,
            block_size,
            grid_size,
            gemmk_groups,
        } = config
        else {
            return Err(config_mismatch(self.id(), config));
        };

        let options = format!(
            "-Wa,-defsym,ROCM_METADATA_VERSION={}",
            problem.code_object.metadata_version()
        );
        let mut construction_params = vec![KernelInfo::linear(
            KERNEL_FILE,
            *kernel_name,
            options,
            *grid_size,
            *block_size,
        )];
        log::debug!("{KERNEL_FILE}:{kernel_name}");

        if *gemmk_groups > 1 {
            let weights = problem.k * problem.c * problem.y * problem.x;
            construction_params.push(KernelInfo::linear(
                REDUCTION_FILE,
                REDUCTION_KERNEL,
                REDUCTION_OPTIONS,
                weights / (REDUCTION_PER_THREAD * REDUCTION_BLOCK_SIZE),
                REDUCTION_BLOCK_SIZE,
            ));
        }

        Ok(ConvSolution {
            solver_id: self.id().to_string(),
            network_config: problem.network_config(),
            construction_params,
            workspace_size: self.config_workspace_size(problem, config),
            invoker_factory: InvokerFactory::ImplicitGemmDynamicWrw {
                shape: ConvShape::from(problem),
                gemmk_groups: *gemmk_groups,
            },
        })
    }
}
