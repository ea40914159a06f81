#![allow(dead_code)]

use std::sync::Arc;

use convplan::{DeviceInfo, Handle, ProblemDescription};
use convplan_backend_ref_cpu::RefCpuDriver;
use rand::{rngs::StdRng, Rng, SeedableRng};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn ref_handle() -> (Arc<RefCpuDriver>, Handle) {
    ref_handle_on(DeviceInfo::new("gfx906").with_compute_units(60))
}

pub fn ref_handle_on(device: DeviceInfo) -> (Arc<RefCpuDriver>, Handle) {
    init_logging();
    let driver = Arc::new(RefCpuDriver::with_device(device));
    let handle = Handle::new(driver.clone()).expect("reference handle");
    (driver, handle)
}

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn random_vec(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect()
}

pub fn assert_close_tol(expected: &[f32], actual: &[f32], atol: f64, rtol: f64) {
    assert_eq!(expected.len(), actual.len());
    for (idx, (&e, &a)) in expected.iter().zip(actual.iter()).enumerate() {
        let diff = (e as f64 - a as f64).abs();
        let thresh = atol + rtol * e.abs().max(a.abs()) as f64;
        assert!(
            diff <= thresh,
            "value mismatch at index {idx}: expected {e}, actual {a}, diff {diff}, thresh {thresh}"
        );
    }
}

pub fn assert_close(expected: &[f32], actual: &[f32]) {
    assert_close_tol(expected, actual, 1e-4, 1e-4);
}

/// Calls `visit(x_index, w_index, y_index)` for every tap of a grouped NCHW
/// convolution that lands inside the input.
fn for_each_tap(p: &ProblemDescription, mut visit: impl FnMut(usize, usize, usize)) {
    let c_per_group = p.c / p.group_count;
    let k_per_group = p.k / p.group_count;
    for n in 0..p.n {
        for k in 0..p.k {
            let group = k / k_per_group;
            for oh in 0..p.ho {
                for ow in 0..p.wo {
                    let y_index = ((n * p.k + k) * p.ho + oh) * p.wo + ow;
                    for cg in 0..c_per_group {
                        let c = group * c_per_group + cg;
                        for ty in 0..p.y {
                            let ih = (oh * p.stride_h + ty * p.dilation_h) as isize
                                - p.pad_h as isize;
                            if ih < 0 || ih >= p.hi as isize {
                                continue;
                            }
                            for tx in 0..p.x {
                                let iw = (ow * p.stride_w + tx * p.dilation_w) as isize
                                    - p.pad_w as isize;
                                if iw < 0 || iw >= p.wi as isize {
                                    continue;
                                }
                                let x_index =
                                    ((n * p.c + c) * p.hi + ih as usize) * p.wi + iw as usize;
                                let w_index = ((k * c_per_group + cg) * p.y + ty) * p.x + tx;
                                visit(x_index, w_index, y_index);
                            }
                        }
                    }
                }
            }
        }
    }
}

pub fn conv_forward(p: &ProblemDescription, x: &[f32], w: &[f32]) -> Vec<f32> {
    let mut y = vec![0f64; p.output_elements()];
    for_each_tap(p, |xi, wi, yi| y[yi] += x[xi] as f64 * w[wi] as f64);
    y.into_iter().map(|v| v as f32).collect()
}

pub fn conv_backward_data(p: &ProblemDescription, dy: &[f32], w: &[f32]) -> Vec<f32> {
    let mut dx = vec![0f64; p.input_elements()];
    for_each_tap(p, |xi, wi, yi| dx[xi] += dy[yi] as f64 * w[wi] as f64);
    dx.into_iter().map(|v| v as f32).collect()
}

pub fn conv_backward_weights(p: &ProblemDescription, x: &[f32], dy: &[f32]) -> Vec<f32> {
    let mut dw = vec![0f64; p.weight_elements()];
    for_each_tap(p, |xi, wi, yi| dw[wi] += x[xi] as f64 * dy[yi] as f64);
    dw.into_iter().map(|v| v as f32).collect()
}
