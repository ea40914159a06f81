//! Invokers: run a prepared kernel sequence against live buffers.

use serde::{Deserialize, Serialize};

use crate::device::{DeviceBuffer, KernelArg};
use crate::error::{ConvError, ConvResult};
use crate::handle::{Handle, Kernel};
use crate::problem::{DataType, Direction, ProblemDescription};

/// Shape parameters the kernels take as arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvShape {
    pub dtype: DataType,
    pub n: usize,
    pub c: usize,
    pub k: usize,
    pub hi: usize,
    pub wi: usize,
    pub ho: usize,
    pub wo: usize,
    pub y: usize,
    pub x: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    pub group_count: usize,
}

impl ConvShape {
    pub fn input_bytes(&self) -> usize {
        self.n * self.c * self.hi * self.wi * self.dtype.size_bytes()
    }

    pub fn weight_bytes(&self) -> usize {
        self.weight_elements() * self.dtype.size_bytes()
    }

    pub fn output_bytes(&self) -> usize {
        self.n * self.k * self.ho * self.wo * self.dtype.size_bytes()
    }

    pub fn weight_elements(&self) -> usize {
        self.k * (self.c / self.group_count) * self.y * self.x
    }

    /// `hi, wi, n, k, c, ho, wo, stride_h, stride_w, dilation_h, dilation_w,
    /// pad_h, pad_w, y, x` in kernel argument order.
    fn scalar_args(&self) -> ConvResult<Vec<KernelArg>> {
        [
            self.hi,
            self.wi,
            self.n,
            self.k,
            self.c,
            self.ho,
            self.wo,
            self.stride_h,
            self.stride_w,
            self.dilation_h,
            self.dilation_w,
            self.pad_h,
            self.pad_w,
            self.y,
            self.x,
        ]
        .into_iter()
        .map(int_arg)
        .collect()
    }
}

impl From<&ProblemDescription> for ConvShape {
    fn from(problem: &ProblemDescription) -> Self {
        Self {
            dtype: problem.dtype,
            n: problem.n,
            c: problem.c,
            k: problem.k,
            hi: problem.hi,
            wi: problem.wi,
            ho: problem.ho,
            wo: problem.wo,
            y: problem.y,
            x: problem.x,
            stride_h: problem.stride_h,
            stride_w: problem.stride_w,
            dilation_h: problem.dilation_h,
            dilation_w: problem.dilation_w,
            pad_h: problem.pad_h,
            pad_w: problem.pad_w,
            group_count: problem.group_count,
        }
    }
}

/// Recipe for the invoker of a solution, carried as data so solutions stay
/// comparable and serializable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvokerFactory {
    /// Weight gradient through the dynamic implicit-GEMM kernel, followed by
    /// a reduction over `gemmk_groups` partial results when there is more
    /// than one group.
    ImplicitGemmDynamicWrw {
        shape: ConvShape,
        gemmk_groups: usize,
    },
    ImplicitGemmDynamicFwd {
        shape: ConvShape,
    },
    DirectNaive {
        direction: Direction,
        shape: ConvShape,
    },
}

impl InvokerFactory {
    pub fn direction(&self) -> Direction {
        match self {
            InvokerFactory::ImplicitGemmDynamicWrw { .. } => Direction::BackwardWeights,
            InvokerFactory::ImplicitGemmDynamicFwd { .. } => Direction::Forward,
            InvokerFactory::DirectNaive { direction, .. } => *direction,
        }
    }

    pub fn shape(&self) -> &ConvShape {
        match self {
            InvokerFactory::ImplicitGemmDynamicWrw { shape, .. }
            | InvokerFactory::ImplicitGemmDynamicFwd { shape }
            | InvokerFactory::DirectNaive { shape, .. } => shape,
        }
    }

    pub fn kernel_count(&self) -> usize {
        match self {
            InvokerFactory::ImplicitGemmDynamicWrw { gemmk_groups, .. } if *gemmk_groups > 1 => 2,
            _ => 1,
        }
    }

    /// Binds compiled kernels, in solution order.
    pub fn make(&self, kernels: Vec<Kernel>, workspace_size: usize) -> ConvResult<Invoker> {
        if kernels.len() != self.kernel_count() {
            return Err(ConvError::inconsistency(
                "invoker",
                format!(
                    "{:?} invoker expects {} kernels, got {}",
                    self.direction(),
                    self.kernel_count(),
                    kernels.len()
                ),
            ));
        }
        Ok(Invoker {
            factory: self.clone(),
            kernels,
            workspace_size,
        })
    }
}

/// Buffers for one execution of a plan.
#[derive(Debug, Clone, Copy)]
pub enum InvokeParams<'a> {
    Forward {
        x: &'a DeviceBuffer,
        w: &'a DeviceBuffer,
        y: &'a DeviceBuffer,
        workspace: Option<&'a DeviceBuffer>,
    },
    BackwardData {
        dy: &'a DeviceBuffer,
        w: &'a DeviceBuffer,
        dx: &'a DeviceBuffer,
        workspace: Option<&'a DeviceBuffer>,
    },
    BackwardWeights {
        dy: &'a DeviceBuffer,
        x: &'a DeviceBuffer,
        dw: &'a DeviceBuffer,
        workspace: Option<&'a DeviceBuffer>,
    },
}

impl<'a> InvokeParams<'a> {
    pub fn direction(&self) -> Direction {
        match self {
            InvokeParams::Forward { .. } => Direction::Forward,
            InvokeParams::BackwardData { .. } => Direction::BackwardData,
            InvokeParams::BackwardWeights { .. } => Direction::BackwardWeights,
        }
    }

    pub fn workspace(&self) -> Option<&'a DeviceBuffer> {
        match *self {
            InvokeParams::Forward { workspace, .. }
            | InvokeParams::BackwardData { workspace, .. }
            | InvokeParams::BackwardWeights { workspace, .. } => workspace,
        }
    }

    /// `(input, weights, output)` in convolution terms.
    fn tensors(&self) -> (&'a DeviceBuffer, &'a DeviceBuffer, &'a DeviceBuffer) {
        match *self {
            InvokeParams::Forward { x, w, y, .. } => (x, w, y),
            InvokeParams::BackwardData { dy, w, dx, .. } => (dx, w, dy),
            InvokeParams::BackwardWeights { dy, x, dw, .. } => (x, dw, dy),
        }
    }
}

/// Compiled kernels of one solution, ready to run any number of times.
#[derive(Debug)]
pub struct Invoker {
    factory: InvokerFactory,
    kernels: Vec<Kernel>,
    workspace_size: usize,
}

impl Invoker {
    pub fn kernels(&self) -> &[Kernel] {
        &self.kernels
    }

    pub fn workspace_size(&self) -> usize {
        self.workspace_size
    }

    /// Enqueues the kernel sequence on `handle`'s queue. When profiling is
    /// enabled the handle's kernel time afterwards covers exactly this run.
    pub fn run(&self, handle: &Handle, params: &InvokeParams<'_>) -> ConvResult<()> {
        let expected = self.factory.direction();
        if params.direction() != expected {
            return Err(ConvError::invalid_invocation(format!(
                "{} invoker called with {} buffers",
                expected,
                params.direction()
            )));
        }
        let workspace = self.check_workspace(params.workspace())?;
        let (input, weights, output) = params.tensors();
        let shape = self.factory.shape();
        check_tensor("input", input, shape.input_bytes())?;
        check_tensor("weights", weights, shape.weight_bytes())?;
        check_tensor("output", output, shape.output_bytes())?;

        if handle.is_profiling_enabled() {
            handle.reset_kernel_time();
        }

        match &self.factory {
            InvokerFactory::ImplicitGemmDynamicWrw {
                shape,
                gemmk_groups,
            } => {
                let partials = match workspace {
                    Some(workspace) if *gemmk_groups > 1 => workspace,
                    _ => weights,
                };
                let mut args = vec![
                    KernelArg::buffer(input),
                    KernelArg::buffer(partials),
                    KernelArg::buffer(output),
                ];
                args.extend(shape.scalar_args()?);
                args.push(int_arg(*gemmk_groups)?);
                handle.launch(&self.kernels[0], &args)?;

                if *gemmk_groups > 1 {
                    let length = int_arg(shape.weight_elements())?;
                    handle.launch(
                        &self.kernels[1],
                        &[
                            KernelArg::buffer(weights),
                            KernelArg::buffer(partials),
                            length,
                            length,
                            int_arg(*gemmk_groups)?,
                        ],
                    )?;
                }
            }
            InvokerFactory::ImplicitGemmDynamicFwd { shape } => {
                let mut args = vec![
                    KernelArg::buffer(input),
                    KernelArg::buffer(weights),
                    KernelArg::buffer(output),
                ];
                args.extend(shape.scalar_args()?);
                args.push(KernelArg::I32(0));
                handle.launch(&self.kernels[0], &args)?;
            }
            InvokerFactory::DirectNaive { shape, .. } => {
                let mut args = vec![
                    KernelArg::buffer(input),
                    KernelArg::buffer(weights),
                    KernelArg::buffer(output),
                ];
                args.extend(shape.scalar_args()?);
                args.push(int_arg(shape.group_count)?);
                handle.launch(&self.kernels[0], &args)?;
            }
        }
        Ok(())
    }

    fn check_workspace<'a>(
        &self,
        workspace: Option<&'a DeviceBuffer>,
    ) -> ConvResult<Option<&'a DeviceBuffer>> {
        if self.workspace_size == 0 {
            return Ok(workspace);
        }
        match workspace {
            Some(buffer) if buffer.bytes() >= self.workspace_size => Ok(Some(buffer)),
            Some(buffer) => Err(ConvError::invalid_invocation(format!(
                "workspace of {} bytes is smaller than the required {}",
                buffer.bytes(),
                self.workspace_size
            ))),
            None => Err(ConvError::invalid_invocation(format!(
                "plan requires a {}-byte workspace",
                self.workspace_size
            ))),
        }
    }
}

fn check_tensor(what: &str, buffer: &DeviceBuffer, required: usize) -> ConvResult<()> {
    if buffer.bytes() < required {
        return Err(ConvError::invalid_invocation(format!(
            "{what} buffer holds {} bytes, {required} required",
            buffer.bytes()
        )));
    }
    Ok(())
}

fn int_arg(value: usize) -> ConvResult<KernelArg> {
    i32::try_from(value)
        .map(KernelArg::I32)
        .map_err(|_| ConvError::invalid_invocation(format!("{value} does not fit a kernel int")))
}
