//! Host implementations of the kernels the solvers launch.
//!
//! Each kernel decodes the same argument list its device counterpart takes
//! and walks the launch grid block by block, so a plan with the wrong grid or
//! a buffer that is too small fails here the way it would corrupt memory on
//! a device.

use convplan::device::DevicePtr;
use convplan::{ConvError, ConvResult, KernelArg};
use half::f16;

use crate::driver::Memory;

/// Scalar type a kernel reads and writes. Accumulation is in `f32`.
pub(crate) trait Element: Copy {
    const SIZE: usize;

    fn from_le_bytes(bytes: &[u8]) -> Self;

    fn write_le_bytes(self, out: &mut [u8]);

    fn to_f32(self) -> f32;

    fn from_f32(value: f32) -> Self;
}

impl Element for f32 {
    const SIZE: usize = 4;

    fn from_le_bytes(bytes: &[u8]) -> Self {
        f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn write_le_bytes(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn to_f32(self) -> f32 {
        self
    }

    fn from_f32(value: f32) -> Self {
        value
    }
}

impl Element for f16 {
    const SIZE: usize = 2;

    fn from_le_bytes(bytes: &[u8]) -> Self {
        f16::from_bits(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn write_le_bytes(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_bits().to_le_bytes());
    }

    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }
}

pub(crate) struct KernelContext<'a> {
    name: &'static str,
    grid: [usize; 3],
    block: [usize; 3],
    args: &'a [KernelArg],
    memory: &'a mut Memory,
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(
        name: &'static str,
        grid: [usize; 3],
        block: [usize; 3],
        args: &'a [KernelArg],
        memory: &'a mut Memory,
    ) -> Self {
        Self {
            name,
            grid,
            block,
            args,
            memory,
        }
    }

    fn fail(&self, message: impl Into<String>) -> ConvError {
        ConvError::launch(self.name, message)
    }

    fn expect_args(&self, count: usize) -> ConvResult<()> {
        if self.args.len() != count {
            return Err(self.fail(format!(
                "expected {count} arguments, got {}",
                self.args.len()
            )));
        }
        Ok(())
    }

    fn ptr(&self, index: usize) -> ConvResult<DevicePtr> {
        match self.args.get(index) {
            Some(KernelArg::Buffer(ptr)) => Ok(*ptr),
            other => Err(self.fail(format!("argument {index} should be a buffer, got {other:?}"))),
        }
    }

    fn int(&self, index: usize) -> ConvResult<usize> {
        match self.args.get(index) {
            Some(KernelArg::I32(value)) if *value >= 0 => Ok(*value as usize),
            Some(KernelArg::U32(value)) => Ok(*value as usize),
            other => Err(self.fail(format!(
                "argument {index} should be a non-negative int, got {other:?}"
            ))),
        }
    }

    /// Requires a one-dimensional launch of exactly `blocks` workgroups of
    /// `block_size` work items.
    fn expect_grid(&self, blocks: usize, block_size: usize) -> ConvResult<()> {
        if self.grid != [blocks, 1, 1] || self.block != [block_size, 1, 1] {
            return Err(self.fail(format!(
                "launched {:?} blocks of {:?}, problem needs [{blocks}, 1, 1] of [{block_size}, 1, 1]",
                self.grid, self.block
            )));
        }
        Ok(())
    }

    fn threads(&self) -> usize {
        self.grid.iter().product::<usize>() * self.block.iter().product::<usize>()
    }

    fn load<T: Element>(&mut self, ptr: DevicePtr, index: usize) -> ConvResult<f32> {
        Ok(self.memory.load::<T>(self.name, ptr, index)?.to_f32())
    }

    fn store<T: Element>(&mut self, ptr: DevicePtr, index: usize, value: f32) -> ConvResult<()> {
        self.memory.store(self.name, ptr, index, T::from_f32(value))
    }
}

/// Argument list shared by the convolution kernels:
/// `(p_in, p_wei, p_out, hi, wi, n, k, c, ho, wo, stride_h, stride_w,
/// dilation_h, dilation_w, pad_h, pad_w, y, x, extra)`.
struct ConvArgs {
    input: DevicePtr,
    weight: DevicePtr,
    output: DevicePtr,
    hi: usize,
    wi: usize,
    n: usize,
    k: usize,
    c: usize,
    ho: usize,
    wo: usize,
    stride: [usize; 2],
    dilation: [usize; 2],
    pad: [usize; 2],
    y: usize,
    x: usize,
    extra: usize,
}

impl ConvArgs {
    fn parse(ctx: &KernelContext<'_>) -> ConvResult<Self> {
        ctx.expect_args(19)?;
        Ok(Self {
            input: ctx.ptr(0)?,
            weight: ctx.ptr(1)?,
            output: ctx.ptr(2)?,
            hi: ctx.int(3)?,
            wi: ctx.int(4)?,
            n: ctx.int(5)?,
            k: ctx.int(6)?,
            c: ctx.int(7)?,
            ho: ctx.int(8)?,
            wo: ctx.int(9)?,
            stride: [ctx.int(10)?, ctx.int(11)?],
            dilation: [ctx.int(12)?, ctx.int(13)?],
            pad: [ctx.int(14)?, ctx.int(15)?],
            y: ctx.int(16)?,
            x: ctx.int(17)?,
            extra: ctx.int(18)?,
        })
    }

    /// Input row/column read by output position `out` and filter tap `tap`.
    fn input_coord(&self, axis: usize, out: usize, tap: usize) -> Option<usize> {
        let extent = if axis == 0 { self.hi } else { self.wi };
        let pos = (out * self.stride[axis] + tap * self.dilation[axis]).checked_sub(self.pad[axis])?;
        (pos < extent).then_some(pos)
    }

    /// Output row/column that reads input position `input` through filter
    /// tap `tap`, if any.
    fn output_coord(&self, axis: usize, input: usize, tap: usize) -> Option<usize> {
        let extent = if axis == 0 { self.ho } else { self.wo };
        let shifted = (input + self.pad[axis]).checked_sub(tap * self.dilation[axis])?;
        if shifted % self.stride[axis] != 0 {
            return None;
        }
        let pos = shifted / self.stride[axis];
        (pos < extent).then_some(pos)
    }

    fn x_index(&self, n: usize, c: usize, h: usize, w: usize) -> usize {
        ((n * self.c + c) * self.hi + h) * self.wi + w
    }

    fn y_index(&self, n: usize, k: usize, h: usize, w: usize) -> usize {
        ((n * self.k + k) * self.ho + h) * self.wo + w
    }

    fn check_strides(&self, ctx: &KernelContext<'_>) -> ConvResult<()> {
        if self.stride.contains(&0) || self.dilation.contains(&0) {
            return Err(ctx.fail("stride and dilation must be non-zero"));
        }
        Ok(())
    }
}

const BLOCK_SIZE: usize = 256;
const IGEMM_M_PER_BLOCK: usize = 128;
const IGEMM_N_PER_BLOCK: usize = 128;
const IGEMM_K_PER_BLOCK: usize = 16;

/// Weight gradient as a GEMM over `M = k`, `N = c * y * x`, `K = n * ho * wo`,
/// with `K` split into `gemmk_groups` slices written `k * c * y * x` elements
/// apart.
fn igemm_v4r1_wrw(ctx: &mut KernelContext<'_>) -> ConvResult<()> {
    let args = ConvArgs::parse(ctx)?;
    args.check_strides(ctx)?;
    let groups = args.extra;
    let gemm_m = args.k;
    let gemm_n = args.c * args.y * args.x;
    let gemm_k = args.n * args.ho * args.wo;
    if groups == 0
        || gemm_m % IGEMM_M_PER_BLOCK != 0
        || gemm_n % IGEMM_N_PER_BLOCK != 0
        || gemm_k % (groups * IGEMM_K_PER_BLOCK) != 0
    {
        return Err(ctx.fail(format!(
            "gemm {gemm_m}x{gemm_n}x{gemm_k} with {groups} groups is not tileable"
        )));
    }
    let m_blocks = gemm_m / IGEMM_M_PER_BLOCK;
    let n_blocks = gemm_n / IGEMM_N_PER_BLOCK;
    ctx.expect_grid(m_blocks * n_blocks * groups, BLOCK_SIZE)?;

    let k_per_group = gemm_k / groups;
    let window = args.y * args.x;
    let out_area = args.ho * args.wo;
    for block in 0..m_blocks * n_blocks * groups {
        let group = block / (m_blocks * n_blocks);
        let tile = block % (m_blocks * n_blocks);
        let (m_block, n_block) = (tile / n_blocks, tile % n_blocks);
        for m in m_block * IGEMM_M_PER_BLOCK..(m_block + 1) * IGEMM_M_PER_BLOCK {
            for gn in n_block * IGEMM_N_PER_BLOCK..(n_block + 1) * IGEMM_N_PER_BLOCK {
                let (c, tap) = (gn / window, gn % window);
                let (ty, tx) = (tap / args.x, tap % args.x);
                let mut acc = 0.0f32;
                for gk in group * k_per_group..(group + 1) * k_per_group {
                    let (n, pos) = (gk / out_area, gk % out_area);
                    let (oh, ow) = (pos / args.wo, pos % args.wo);
                    let (Some(ih), Some(iw)) =
                        (args.input_coord(0, oh, ty), args.input_coord(1, ow, tx))
                    else {
                        continue;
                    };
                    let dy = ctx.load::<f32>(args.output, args.y_index(n, m, oh, ow))?;
                    let x = ctx.load::<f32>(args.input, args.x_index(n, c, ih, iw))?;
                    acc += dy * x;
                }
                ctx.store::<f32>(args.weight, group * gemm_m * gemm_n + m * gemm_n + gn, acc)?;
            }
        }
    }
    Ok(())
}

/// Forward convolution as a GEMM over `M = k`, `N = n * ho * wo`,
/// `K = c * y * x`.
fn igemm_v4r1_fwd(ctx: &mut KernelContext<'_>) -> ConvResult<()> {
    let args = ConvArgs::parse(ctx)?;
    args.check_strides(ctx)?;
    if args.extra != 0 {
        return Err(ctx.fail("pack0 must be zero"));
    }
    let pointwise = args.y == 1
        && args.x == 1
        && args.stride == [1, 1]
        && args.dilation == [1, 1]
        && args.pad == [0, 0];
    if ctx.name.starts_with("igemm_v4r1_1x1") && !pointwise {
        return Err(ctx.fail("1x1 kernel launched on a windowed problem"));
    }
    let gemm_m = args.k;
    let gemm_n = args.n * args.ho * args.wo;
    let gemm_k = args.c * args.y * args.x;
    if gemm_m % IGEMM_M_PER_BLOCK != 0
        || gemm_n % IGEMM_N_PER_BLOCK != 0
        || gemm_k % IGEMM_K_PER_BLOCK != 0
    {
        return Err(ctx.fail(format!("gemm {gemm_m}x{gemm_n}x{gemm_k} is not tileable")));
    }
    let m_blocks = gemm_m / IGEMM_M_PER_BLOCK;
    let n_blocks = gemm_n / IGEMM_N_PER_BLOCK;
    ctx.expect_grid(m_blocks * n_blocks, BLOCK_SIZE)?;

    let out_area = args.ho * args.wo;
    let window = args.y * args.x;
    for block in 0..m_blocks * n_blocks {
        let (m_block, n_block) = (block / n_blocks, block % n_blocks);
        for m in m_block * IGEMM_M_PER_BLOCK..(m_block + 1) * IGEMM_M_PER_BLOCK {
            for gn in n_block * IGEMM_N_PER_BLOCK..(n_block + 1) * IGEMM_N_PER_BLOCK {
                let (n, pos) = (gn / out_area, gn % out_area);
                let (oh, ow) = (pos / args.wo, pos % args.wo);
                let mut acc = 0.0f32;
                for gk in 0..gemm_k {
                    let (c, tap) = (gk / window, gk % window);
                    let (ty, tx) = (tap / args.x, tap % args.x);
                    let (Some(ih), Some(iw)) =
                        (args.input_coord(0, oh, ty), args.input_coord(1, ow, tx))
                    else {
                        continue;
                    };
                    let x = ctx.load::<f32>(args.input, args.x_index(n, c, ih, iw))?;
                    let w = ctx.load::<f32>(args.weight, m * gemm_k + gk)?;
                    acc += x * w;
                }
                ctx.store::<f32>(args.output, args.y_index(n, m, oh, ow), acc)?;
            }
        }
    }
    Ok(())
}

const REDUCTION_PER_THREAD: usize = 8;
const REDUCTION_BLOCK_SIZE: usize = 256;

/// `out[i] = sum_g in[g * in_stride + i]` for `i < out_length`.
fn wrw_reduction(ctx: &mut KernelContext<'_>) -> ConvResult<()> {
    ctx.expect_args(5)?;
    let output = ctx.ptr(0)?;
    let input = ctx.ptr(1)?;
    let out_length = ctx.int(2)?;
    let in_stride = ctx.int(3)?;
    let groups = ctx.int(4)?;
    if ctx.block != [REDUCTION_BLOCK_SIZE, 1, 1] {
        return Err(ctx.fail(format!("block must be {REDUCTION_BLOCK_SIZE} work items")));
    }
    if ctx.threads() * REDUCTION_PER_THREAD < out_length {
        return Err(ctx.fail(format!(
            "{} threads cannot cover {out_length} outputs",
            ctx.threads()
        )));
    }
    for i in 0..out_length {
        let mut acc = 0.0f32;
        for group in 0..groups {
            acc += ctx.load::<f32>(input, group * in_stride + i)?;
        }
        ctx.store::<f32>(output, i, acc)?;
    }
    Ok(())
}

struct Grouping {
    c_per_group: usize,
    k_per_group: usize,
}

fn grouping(ctx: &KernelContext<'_>, args: &ConvArgs) -> ConvResult<Grouping> {
    let groups = args.extra;
    if groups == 0 || args.c % groups != 0 || args.k % groups != 0 {
        return Err(ctx.fail(format!(
            "group count {groups} does not divide c={} and k={}",
            args.c, args.k
        )));
    }
    Ok(Grouping {
        c_per_group: args.c / groups,
        k_per_group: args.k / groups,
    })
}

fn naive_fwd<T: Element>(ctx: &mut KernelContext<'_>) -> ConvResult<()> {
    let args = ConvArgs::parse(ctx)?;
    args.check_strides(ctx)?;
    let g = grouping(ctx, &args)?;
    ctx.expect_grid(args.n * args.k, BLOCK_SIZE)?;
    for block in 0..args.n * args.k {
        let (n, k) = (block / args.k, block % args.k);
        let group = k / g.k_per_group;
        for oh in 0..args.ho {
            for ow in 0..args.wo {
                let mut acc = 0.0f32;
                for cg in 0..g.c_per_group {
                    let c = group * g.c_per_group + cg;
                    for ty in 0..args.y {
                        let Some(ih) = args.input_coord(0, oh, ty) else {
                            continue;
                        };
                        for tx in 0..args.x {
                            let Some(iw) = args.input_coord(1, ow, tx) else {
                                continue;
                            };
                            let x = ctx.load::<T>(args.input, args.x_index(n, c, ih, iw))?;
                            let w_index = ((k * g.c_per_group + cg) * args.y + ty) * args.x + tx;
                            let w = ctx.load::<T>(args.weight, w_index)?;
                            acc += x * w;
                        }
                    }
                }
                ctx.store::<T>(args.output, args.y_index(n, k, oh, ow), acc)?;
            }
        }
    }
    Ok(())
}

fn naive_bwd<T: Element>(ctx: &mut KernelContext<'_>) -> ConvResult<()> {
    let args = ConvArgs::parse(ctx)?;
    args.check_strides(ctx)?;
    let g = grouping(ctx, &args)?;
    ctx.expect_grid(args.n * args.c, BLOCK_SIZE)?;
    for block in 0..args.n * args.c {
        let (n, c) = (block / args.c, block % args.c);
        let (group, cg) = (c / g.c_per_group, c % g.c_per_group);
        for ih in 0..args.hi {
            for iw in 0..args.wi {
                let mut acc = 0.0f32;
                for kg in 0..g.k_per_group {
                    let k = group * g.k_per_group + kg;
                    for ty in 0..args.y {
                        let Some(oh) = args.output_coord(0, ih, ty) else {
                            continue;
                        };
                        for tx in 0..args.x {
                            let Some(ow) = args.output_coord(1, iw, tx) else {
                                continue;
                            };
                            let dy = ctx.load::<T>(args.output, args.y_index(n, k, oh, ow))?;
                            let w_index = ((k * g.c_per_group + cg) * args.y + ty) * args.x + tx;
                            let w = ctx.load::<T>(args.weight, w_index)?;
                            acc += dy * w;
                        }
                    }
                }
                ctx.store::<T>(args.input, args.x_index(n, c, ih, iw), acc)?;
            }
        }
    }
    Ok(())
}

fn naive_wrw<T: Element>(ctx: &mut KernelContext<'_>) -> ConvResult<()> {
    let args = ConvArgs::parse(ctx)?;
    args.check_strides(ctx)?;
    let g = grouping(ctx, &args)?;
    ctx.expect_grid(args.k * g.c_per_group, BLOCK_SIZE)?;
    for block in 0..args.k * g.c_per_group {
        let (k, cg) = (block / g.c_per_group, block % g.c_per_group);
        let c = (k / g.k_per_group) * g.c_per_group + cg;
        for ty in 0..args.y {
            for tx in 0..args.x {
                let mut acc = 0.0f32;
                for n in 0..args.n {
                    for oh in 0..args.ho {
                        let Some(ih) = args.input_coord(0, oh, ty) else {
                            continue;
                        };
                        for ow in 0..args.wo {
                            let Some(iw) = args.input_coord(1, ow, tx) else {
                                continue;
                            };
                            let x = ctx.load::<T>(args.input, args.x_index(n, c, ih, iw))?;
                            let dy = ctx.load::<T>(args.output, args.y_index(n, k, oh, ow))?;
                            acc += x * dy;
                        }
                    }
                }
                let w_index = ((k * g.c_per_group + cg) * args.y + ty) * args.x + tx;
                ctx.store::<T>(args.weight, w_index, acc)?;
            }
        }
    }
    Ok(())
}

pub(crate) struct KernelDef {
    pub(crate) program: &'static str,
    pub(crate) name: &'static str,
    pub(crate) run: fn(&mut KernelContext<'_>) -> ConvResult<()>,
}

const KERNELS: &[KernelDef] = &[
    KernelDef {
        program: "igemm_v4r1_wrw_dynamic.s",
        name: "igemm_v4r1_dynamic_wrw_128x128x16_8x8_4x4x4x4x4x4_16x1x16x1_4x64",
        run: igemm_v4r1_wrw,
    },
    KernelDef {
        program: "igemm_v4r1_wrw_dynamic.s",
        name: "igemm_v4r1_dynamic_wrw_128x128x16_8x8_4x4x4x4x4x4_16x1x16x1_16x16",
        run: igemm_v4r1_wrw,
    },
    KernelDef {
        program: "igemm_v4r1_dynamic.s",
        name: "igemm_v4r1_dynamic_128x128x16_8x8_4x4x4x4x4x4_16x1x16x1_16x1x16x1",
        run: igemm_v4r1_fwd,
    },
    KernelDef {
        program: "igemm_v4r1_dynamic.s",
        name: "igemm_v4r1_1x1_dynamic_128x128x16_8x8_4x4x4x4x4x4_16x1x16x1_16x1x16x1",
        run: igemm_v4r1_fwd,
    },
    KernelDef {
        program: "wrw_reduction_hip.cpp",
        name: "wrw_reduction_hip",
        run: wrw_reduction,
    },
    KernelDef {
        program: "naive_conv.cpp",
        name: "naive_conv_fwd_nchw_float",
        run: naive_fwd::<f32>,
    },
    KernelDef {
        program: "naive_conv.cpp",
        name: "naive_conv_bwd_nchw_float",
        run: naive_bwd::<f32>,
    },
    KernelDef {
        program: "naive_conv.cpp",
        name: "naive_conv_wrw_nchw_float",
        run: naive_wrw::<f32>,
    },
    KernelDef {
        program: "naive_conv.cpp",
        name: "naive_conv_fwd_nchw_half",
        run: naive_fwd::<f16>,
    },
    KernelDef {
        program: "naive_conv.cpp",
        name: "naive_conv_bwd_nchw_half",
        run: naive_bwd::<f16>,
    },
    KernelDef {
        program: "naive_conv.cpp",
        name: "naive_conv_wrw_nchw_half",
        run: naive_wrw::<f16>,
    },
];

pub(crate) fn is_known_program(program: &str) -> bool {
    KERNELS.iter().any(|def| def.program == program)
}

pub(crate) fn find(program: &str, name: &str) -> Option<&'static KernelDef> {
    KERNELS
        .iter()
        .find(|def| def.program == program && def.name == name)
}
