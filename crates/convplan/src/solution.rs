use serde::{Deserialize, Serialize};

use crate::error::{ConvError, ConvResult};
use crate::handle::{Handle, KernelRequest};
use crate::invoker::{Invoker, InvokerFactory};

/// One kernel of a solution: what to build and how to launch it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub kernel_file: String,
    pub kernel_name: String,
    pub comp_options: String,
    /// Global work size, in work items.
    pub g_wk: [usize; 3],
    /// Workgroup size, in work items.
    pub l_wk: [usize; 3],
}

impl KernelInfo {
    /// One-dimensional launch of `grid_blocks` workgroups of `block_size`.
    pub fn linear(
        kernel_file: impl Into<String>,
        kernel_name: impl Into<String>,
        comp_options: impl Into<String>,
        grid_blocks: usize,
        block_size: usize,
    ) -> Self {
        Self {
            kernel_file: kernel_file.into(),
            kernel_name: kernel_name.into(),
            comp_options: comp_options.into(),
            g_wk: [grid_blocks * block_size, 1, 1],
            l_wk: [block_size, 1, 1],
        }
    }

    /// Total number of workgroups.
    pub fn grid_blocks(&self) -> usize {
        (0..3)
            .map(|dim| self.g_wk[dim] / self.l_wk[dim].max(1))
            .product()
    }

    pub fn request(&self, algorithm: &str, network_config: &str) -> KernelRequest {
        KernelRequest {
            algorithm: algorithm.to_string(),
            network_config: network_config.to_string(),
            program_name: self.kernel_file.clone(),
            kernel_name: self.kernel_name.clone(),
            local: self.l_wk,
            global: self.g_wk,
            params: self.comp_options.clone(),
            is_binary: false,
        }
    }
}

/// Executable plan produced by a solver. Kernel order is launch order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvSolution {
    pub solver_id: String,
    pub network_config: String,
    pub construction_params: Vec<KernelInfo>,
    pub workspace_size: usize,
    pub invoker_factory: InvokerFactory,
}

impl ConvSolution {
    pub fn kernel_count(&self) -> usize {
        self.construction_params.len()
    }

    pub fn to_json(&self) -> ConvResult<String> {
        serde_json::to_string_pretty(self).map_err(|err| {
            ConvError::inconsistency(&self.solver_id, format!("cannot render solution: {err}"))
        })
    }

    /// Compiles every kernel on `handle` and binds them to an invoker.
    pub fn prepare(&self, handle: &Handle) -> ConvResult<Invoker> {
        let mut kernels = Vec::with_capacity(self.construction_params.len());
        for info in &self.construction_params {
            let kernel = handle.get_kernel(&info.request(&self.solver_id, &self.network_config))?;
            kernels.push(kernel.into_kernel());
        }
        self.invoker_factory.make(kernels, self.workspace_size)
    }
}
