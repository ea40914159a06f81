//! Convolution problem descriptor.
//!
//! Tensors are NCHW (NCDHW for 3-D): input `x` is `n x c x hi x wi`, weights
//! `w` are `k x (c / group_count) x y x x`, output `y` is `n x k x ho x wo`.
//! `c` and `k` keep these meanings in every direction.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::DeviceInfo;
use crate::error::{ConvError, ConvResult};
use crate::handle::Handle;
use crate::hashing::hash_value;

pub use crate::device::CodeObjectVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    BackwardData,
    BackwardWeights,
}

impl Direction {
    pub fn is_forward(self) -> bool {
        self == Direction::Forward
    }

    pub fn is_backward_data(self) -> bool {
        self == Direction::BackwardData
    }

    pub fn is_backward_weights(self) -> bool {
        self == Direction::BackwardWeights
    }

    fn tag(self) -> &'static str {
        match self {
            Direction::Forward => "fwd",
            Direction::BackwardData => "bwd",
            Direction::BackwardWeights => "wrw",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    F32,
    F16,
    BF16,
}

impl DataType {
    pub fn size_bytes(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 | DataType::BF16 => 2,
        }
    }

    /// Element type name as used in kernel names.
    pub fn kernel_suffix(self) -> &'static str {
        match self {
            DataType::F32 => "float",
            DataType::F16 => "half",
            DataType::BF16 => "bfloat16",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
        };
        f.write_str(name)
    }
}

/// Immutable description of one convolution on one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProblemDescription {
    pub direction: Direction,
    pub dtype: DataType,
    pub spatial_dims: usize,
    pub n: usize,
    pub c: usize,
    pub k: usize,
    /// Depth extents; 1 for 2-D problems.
    pub di: usize,
    pub hi: usize,
    pub wi: usize,
    pub dout: usize,
    pub ho: usize,
    pub wo: usize,
    pub z: usize,
    pub y: usize,
    pub x: usize,
    pub pad_d: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    pub stride_d: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilation_d: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
    pub group_count: usize,
    pub device: DeviceInfo,
    pub code_object: CodeObjectVersion,
}

impl ProblemDescription {
    pub fn builder(direction: Direction) -> ProblemBuilder {
        ProblemBuilder::new(direction)
    }

    pub fn is_2d(&self) -> bool {
        self.spatial_dims == 2
    }

    pub fn is_3d(&self) -> bool {
        self.spatial_dims == 3
    }

    pub fn is_fp32(&self) -> bool {
        self.dtype == DataType::F32
    }

    pub fn is_fp16(&self) -> bool {
        self.dtype == DataType::F16
    }

    pub fn elem_size(&self) -> usize {
        self.dtype.size_bytes()
    }

    pub fn input_elements(&self) -> usize {
        self.n * self.c * self.di * self.hi * self.wi
    }

    pub fn weight_elements(&self) -> usize {
        self.k * (self.c / self.group_count) * self.z * self.y * self.x
    }

    pub fn output_elements(&self) -> usize {
        self.n * self.k * self.dout * self.ho * self.wo
    }

    /// Stable key for kernels compiled for this problem shape. The device is
    /// not part of the key since kernel caches live on a per-device handle.
    pub fn network_config(&self) -> String {
        let mut key = format!(
            "{}-{}-n{}c{}k{}-h{}w{}-y{}x{}-p{}x{}-s{}x{}-d{}x{}-g{}",
            self.direction,
            self.dtype,
            self.n,
            self.c,
            self.k,
            self.hi,
            self.wi,
            self.y,
            self.x,
            self.pad_h,
            self.pad_w,
            self.stride_h,
            self.stride_w,
            self.dilation_h,
            self.dilation_w,
            self.group_count
        );
        if self.is_3d() {
            key.push_str(&format!(
                "-di{}z{}-pd{}sd{}dd{}",
                self.di, self.z, self.pad_d, self.stride_d, self.dilation_d
            ));
        }
        key
    }

    /// Hash of every field, device included.
    pub fn fingerprint(&self) -> u64 {
        hash_value(self)
    }
}

impl fmt::Display for ProblemDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.network_config(), self.device.name)
    }
}

/// Validating builder for [`ProblemDescription`]. Output extents are derived.
#[derive(Debug, Clone)]
pub struct ProblemBuilder {
    direction: Direction,
    dtype: DataType,
    spatial_dims: usize,
    n: usize,
    c: usize,
    k: usize,
    input: [usize; 3],
    window: [usize; 3],
    pad: [usize; 3],
    stride: [usize; 3],
    dilation: [usize; 3],
    group_count: usize,
    device: Option<DeviceInfo>,
    code_object: Option<CodeObjectVersion>,
}

impl ProblemBuilder {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            dtype: DataType::F32,
            spatial_dims: 2,
            n: 1,
            c: 1,
            k: 1,
            input: [1, 1, 1],
            window: [1, 1, 1],
            pad: [0, 0, 0],
            stride: [1, 1, 1],
            dilation: [1, 1, 1],
            group_count: 1,
            device: None,
            code_object: None,
        }
    }

    pub fn dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn spatial_dims(mut self, dims: usize) -> Self {
        self.spatial_dims = dims;
        self
    }

    pub fn batch(mut self, n: usize) -> Self {
        self.n = n;
        self
    }

    pub fn in_channels(mut self, c: usize) -> Self {
        self.c = c;
        self
    }

    pub fn out_channels(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    /// Input height and width.
    pub fn input(mut self, hi: usize, wi: usize) -> Self {
        self.input[1] = hi;
        self.input[2] = wi;
        self
    }

    /// Filter height and width.
    pub fn window(mut self, y: usize, x: usize) -> Self {
        self.window[1] = y;
        self.window[2] = x;
        self
    }

    pub fn pad(mut self, pad_h: usize, pad_w: usize) -> Self {
        self.pad[1] = pad_h;
        self.pad[2] = pad_w;
        self
    }

    pub fn stride(mut self, stride_h: usize, stride_w: usize) -> Self {
        self.stride[1] = stride_h;
        self.stride[2] = stride_w;
        self
    }

    pub fn dilation(mut self, dilation_h: usize, dilation_w: usize) -> Self {
        self.dilation[1] = dilation_h;
        self.dilation[2] = dilation_w;
        self
    }

    /// Depth parameters for 3-D problems: input depth, filter depth, pad,
    /// stride and dilation.
    pub fn depth(mut self, di: usize, z: usize, pad: usize, stride: usize, dilation: usize) -> Self {
        self.input[0] = di;
        self.window[0] = z;
        self.pad[0] = pad;
        self.stride[0] = stride;
        self.dilation[0] = dilation;
        self
    }

    pub fn group_count(mut self, group_count: usize) -> Self {
        self.group_count = group_count;
        self
    }

    pub fn device(mut self, device: DeviceInfo) -> Self {
        self.device = Some(device);
        self
    }

    /// Snapshots the device behind `handle`.
    pub fn on(self, handle: &Handle) -> Self {
        self.device(handle.device_info().clone())
    }

    /// Overrides the code-object version reported by the device.
    pub fn code_object(mut self, code_object: CodeObjectVersion) -> Self {
        self.code_object = Some(code_object);
        self
    }

    pub fn build(self) -> ConvResult<ProblemDescription> {
        let device = self
            .device
            .ok_or_else(|| ConvError::invalid_problem("no device set on the problem"))?;
        if !matches!(self.spatial_dims, 2 | 3) {
            return Err(ConvError::invalid_problem(format!(
                "unsupported spatial dimensionality {}",
                self.spatial_dims
            )));
        }
        for (name, value) in [
            ("batch", self.n),
            ("in_channels", self.c),
            ("out_channels", self.k),
            ("group_count", self.group_count),
        ] {
            if value == 0 {
                return Err(ConvError::invalid_problem(format!("{name} must be non-zero")));
            }
        }
        if self.c % self.group_count != 0 || self.k % self.group_count != 0 {
            return Err(ConvError::invalid_problem(format!(
                "group_count {} must divide in_channels {} and out_channels {}",
                self.group_count, self.c, self.k
            )));
        }

        let first_dim = if self.spatial_dims == 3 { 0 } else { 1 };
        let mut output = [1usize; 3];
        for dim in first_dim..3 {
            output[dim] = output_extent(
                dim,
                self.input[dim],
                self.window[dim],
                self.pad[dim],
                self.stride[dim],
                self.dilation[dim],
            )?;
        }
        let (depth_in, depth_window, depth_pad, depth_stride, depth_dilation) =
            if self.spatial_dims == 3 {
                (
                    self.input[0],
                    self.window[0],
                    self.pad[0],
                    self.stride[0],
                    self.dilation[0],
                )
            } else {
                (1, 1, 0, 1, 1)
            };

        Ok(ProblemDescription {
            direction: self.direction,
            dtype: self.dtype,
            spatial_dims: self.spatial_dims,
            n: self.n,
            c: self.c,
            k: self.k,
            di: depth_in,
            hi: self.input[1],
            wi: self.input[2],
            dout: output[0],
            ho: output[1],
            wo: output[2],
            z: depth_window,
            y: self.window[1],
            x: self.window[2],
            pad_d: depth_pad,
            pad_h: self.pad[1],
            pad_w: self.pad[2],
            stride_d: depth_stride,
            stride_h: self.stride[1],
            stride_w: self.stride[2],
            dilation_d: depth_dilation,
            dilation_h: self.dilation[1],
            dilation_w: self.dilation[2],
            group_count: self.group_count,
            code_object: self.code_object.unwrap_or(device.code_object),
            device,
        })
    }
}

const AXES: [&str; 3] = ["depth", "height", "width"];

fn output_extent(
    dim: usize,
    input: usize,
    window: usize,
    pad: usize,
    stride: usize,
    dilation: usize,
) -> ConvResult<usize> {
    let axis = AXES[dim];
    if input == 0 || window == 0 {
        return Err(ConvError::invalid_problem(format!(
            "{axis} input and window extents must be non-zero"
        )));
    }
    if stride == 0 || dilation == 0 {
        return Err(ConvError::invalid_problem(format!(
            "{axis} stride and dilation must be non-zero"
        )));
    }
    let span = dilation * (window - 1) + 1;
    let padded = input + 2 * pad;
    if span > padded {
        return Err(ConvError::invalid_problem(format!(
            "{axis} window span {span} exceeds padded input {padded}"
        )));
    }
    Ok((padded - span) / stride + 1)
}
