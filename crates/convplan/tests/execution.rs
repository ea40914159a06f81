mod common;

use std::sync::Arc;

use anyhow::Result;
use convplan::{
    ConvAsmImplicitGemmV4R1DynamicFwd, ConvAsmImplicitGemmV4R1DynamicWrw, ConvDirectNaive,
    ConvError, DataType, Direction, Handle, InvokeParams, ProblemBuilder, ProblemDescription,
    Solver,
};
use convplan_backend_ref_cpu::RefCpuDriver;
use half::f16;

fn problem_on(handle: &Handle, direction: Direction) -> ProblemBuilder {
    ProblemBuilder::new(direction).on(handle)
}

/// Runs a weight-gradient plan from `solver` and checks it against the host
/// reference, returning the computed gradient.
fn run_wrw(
    solver: &dyn Solver,
    problem: &ProblemDescription,
    driver: &Arc<RefCpuDriver>,
    handle: &Handle,
) -> Result<Vec<f32>> {
    let mut rng = common::seeded_rng(11);
    let x = common::random_vec(&mut rng, problem.input_elements());
    let dy = common::random_vec(&mut rng, problem.output_elements());
    let expected = common::conv_backward_weights(problem, &x, &dy);

    let solution = solver.solution(problem)?;
    let invoker = solution.prepare(handle)?;
    let x_buf = handle.write(&x)?;
    let dy_buf = handle.write(&dy)?;
    let dw_buf = handle.create_zeroed(problem.weight_elements() * 4)?;
    let workspace = match solution.workspace_size {
        0 => None,
        bytes => Some(handle.create(bytes)?),
    };
    driver.clear_launches();
    invoker.run(
        handle,
        &InvokeParams::BackwardWeights {
            dy: &dy_buf,
            x: &x_buf,
            dw: &dw_buf,
            workspace: workspace.as_ref(),
        },
    )?;
    handle.finish()?;
    let actual: Vec<f32> = handle.read(&dw_buf, problem.weight_elements())?;
    common::assert_close(&expected, &actual);
    Ok(actual)
}

#[test]
fn igemm_wrw_single_group_matches_reference() -> Result<()> {
    let (driver, handle) = common::ref_handle();
    let problem = problem_on(&handle, Direction::BackwardWeights)
        .batch(1)
        .in_channels(8)
        .out_channels(128)
        .input(7, 7)
        .window(4, 4)
        .build()?;
    let solver = ConvAsmImplicitGemmV4R1DynamicWrw;
    assert_eq!(solver.workspace_size(&problem)?, 0);
    run_wrw(&solver, &problem, &driver, &handle)?;

    let launches = driver.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].program, "igemm_v4r1_wrw_dynamic.s");
    assert_eq!(launches[0].global, [256, 1, 1]);
    Ok(())
}

#[test]
fn igemm_wrw_split_k_reduces_through_the_workspace() -> Result<()> {
    let (driver, handle) = common::ref_handle();
    let problem = problem_on(&handle, Direction::BackwardWeights)
        .batch(2)
        .in_channels(8)
        .out_channels(128)
        .input(7, 7)
        .window(4, 4)
        .build()?;
    let solver = ConvAsmImplicitGemmV4R1DynamicWrw;
    let solution = solver.solution(&problem)?;
    assert_eq!(solution.workspace_size, 131_072);
    run_wrw(&solver, &problem, &driver, &handle)?;

    let launches = driver.launches();
    let names: Vec<_> = launches.iter().map(|l| l.kernel_name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            solution.construction_params[0].kernel_name.as_str(),
            "wrw_reduction_hip"
        ]
    );
    Ok(())
}

#[test]
fn igemm_wrw_strided_padded_problem_matches_reference() -> Result<()> {
    let (driver, handle) = common::ref_handle();
    let problem = problem_on(&handle, Direction::BackwardWeights)
        .batch(4)
        .in_channels(8)
        .out_channels(128)
        .input(9, 9)
        .window(4, 4)
        .pad(1, 1)
        .stride(2, 2)
        .build()?;
    assert_eq!((problem.ho, problem.wo), (4, 4));
    assert_eq!(convplan::gemmk_groups(&problem), 4);
    run_wrw(&ConvAsmImplicitGemmV4R1DynamicWrw, &problem, &driver, &handle)?;
    Ok(())
}

#[test]
fn workspace_is_written_exactly_to_its_reported_size() -> Result<()> {
    let (driver, handle) = common::ref_handle();
    let problem = problem_on(&handle, Direction::BackwardWeights)
        .batch(2)
        .in_channels(8)
        .out_channels(128)
        .input(7, 7)
        .window(4, 4)
        .build()?;
    let solution = ConvAsmImplicitGemmV4R1DynamicWrw.solution(&problem)?;
    let invoker = solution.prepare(&handle)?;

    let x = handle.create_zeroed(problem.input_elements() * 4)?;
    let dy = handle.create_zeroed(problem.output_elements() * 4)?;
    let dw = handle.create(problem.weight_elements() * 4)?;
    // Oversized so a kernel that ran past the reported size would show up.
    let workspace = handle.create(solution.workspace_size * 2)?;
    invoker.run(
        &handle,
        &InvokeParams::BackwardWeights {
            dy: &dy,
            x: &x,
            dw: &dw,
            workspace: Some(&workspace),
        },
    )?;

    let stats = driver
        .access_stats(workspace.device_ptr())
        .expect("workspace stats");
    assert_eq!(stats.kernel_write_end, solution.workspace_size);
    assert_eq!(stats.kernel_read_end, solution.workspace_size);
    let dw_stats = driver.access_stats(dw.device_ptr()).expect("dw stats");
    assert_eq!(dw_stats.kernel_write_end, dw.bytes());
    Ok(())
}

#[test]
fn igemm_fwd_matches_reference() -> Result<()> {
    let (_driver, handle) = common::ref_handle();
    for (window, pad) in [(1, 0), (3, 1)] {
        let problem = problem_on(&handle, Direction::Forward)
            .batch(8)
            .in_channels(16)
            .out_channels(128)
            .input(4, 4)
            .window(window, window)
            .pad(pad, pad)
            .build()?;
        let mut rng = common::seeded_rng(3);
        let x = common::random_vec(&mut rng, problem.input_elements());
        let w = common::random_vec(&mut rng, problem.weight_elements());
        let expected = common::conv_forward(&problem, &x, &w);

        let invoker = ConvAsmImplicitGemmV4R1DynamicFwd
            .solution(&problem)?
            .prepare(&handle)?;
        let (x_buf, w_buf) = (handle.write(&x)?, handle.write(&w)?);
        let y_buf = handle.create(problem.output_elements() * 4)?;
        invoker.run(
            &handle,
            &InvokeParams::Forward {
                x: &x_buf,
                w: &w_buf,
                y: &y_buf,
                workspace: None,
            },
        )?;
        let actual: Vec<f32> = handle.read(&y_buf, problem.output_elements())?;
        common::assert_close(&expected, &actual);
    }
    Ok(())
}

fn grouped(handle: &Handle, direction: Direction) -> Result<ProblemDescription> {
    Ok(problem_on(handle, direction)
        .batch(2)
        .in_channels(6)
        .out_channels(4)
        .group_count(2)
        .input(6, 5)
        .window(3, 2)
        .pad(1, 0)
        .stride(2, 1)
        .dilation(1, 2)
        .build()?)
}

#[test]
fn naive_solvers_match_reference_in_every_direction() -> Result<()> {
    let (_driver, handle) = common::ref_handle();
    let mut rng = common::seeded_rng(5);

    let problem = grouped(&handle, Direction::Forward)?;
    let x = common::random_vec(&mut rng, problem.input_elements());
    let w = common::random_vec(&mut rng, problem.weight_elements());
    let invoker = ConvDirectNaive::forward().solution(&problem)?.prepare(&handle)?;
    let (x_buf, w_buf) = (handle.write(&x)?, handle.write(&w)?);
    let y_buf = handle.create(problem.output_elements() * 4)?;
    invoker.run(
        &handle,
        &InvokeParams::Forward {
            x: &x_buf,
            w: &w_buf,
            y: &y_buf,
            workspace: None,
        },
    )?;
    let y: Vec<f32> = handle.read(&y_buf, problem.output_elements())?;
    common::assert_close(&common::conv_forward(&problem, &x, &w), &y);

    let problem = grouped(&handle, Direction::BackwardData)?;
    let dy = common::random_vec(&mut rng, problem.output_elements());
    let invoker = ConvDirectNaive::backward_data()
        .solution(&problem)?
        .prepare(&handle)?;
    let dy_buf = handle.write(&dy)?;
    let dx_buf = handle.create(problem.input_elements() * 4)?;
    invoker.run(
        &handle,
        &InvokeParams::BackwardData {
            dy: &dy_buf,
            w: &w_buf,
            dx: &dx_buf,
            workspace: None,
        },
    )?;
    let dx: Vec<f32> = handle.read(&dx_buf, problem.input_elements())?;
    common::assert_close(&common::conv_backward_data(&problem, &dy, &w), &dx);

    let problem = grouped(&handle, Direction::BackwardWeights)?;
    let invoker = ConvDirectNaive::backward_weights()
        .solution(&problem)?
        .prepare(&handle)?;
    let dw_buf = handle.create(problem.weight_elements() * 4)?;
    invoker.run(
        &handle,
        &InvokeParams::BackwardWeights {
            dy: &dy_buf,
            x: &x_buf,
            dw: &dw_buf,
            workspace: None,
        },
    )?;
    let dw: Vec<f32> = handle.read(&dw_buf, problem.weight_elements())?;
    common::assert_close(&common::conv_backward_weights(&problem, &x, &dy), &dw);
    Ok(())
}

#[test]
fn naive_forward_runs_in_half_precision() -> Result<()> {
    let (_driver, handle) = common::ref_handle();
    let problem = problem_on(&handle, Direction::Forward)
        .dtype(DataType::F16)
        .batch(1)
        .in_channels(4)
        .out_channels(2)
        .input(5, 5)
        .window(3, 3)
        .build()?;
    let mut rng = common::seeded_rng(9);
    let round = |v: Vec<f32>| -> Vec<f16> { v.into_iter().map(f16::from_f32).collect() };
    let x = round(common::random_vec(&mut rng, problem.input_elements()));
    let w = round(common::random_vec(&mut rng, problem.weight_elements()));
    let widen = |v: &[f16]| -> Vec<f32> { v.iter().map(|h| h.to_f32()).collect() };
    let expected = common::conv_forward(&problem, &widen(&x), &widen(&w));

    let invoker = ConvDirectNaive::forward().solution(&problem)?.prepare(&handle)?;
    let x_buf = handle.write(&x)?;
    let w_buf = handle.write(&w)?;
    let y_buf = handle.create(problem.output_elements() * 2)?;
    invoker.run(
        &handle,
        &InvokeParams::Forward {
            x: &x_buf,
            w: &w_buf,
            y: &y_buf,
            workspace: None,
        },
    )?;
    let y: Vec<f16> = handle.read(&y_buf, problem.output_elements())?;
    common::assert_close_tol(&expected, &widen(&y), 2e-2, 1e-2);
    Ok(())
}

#[test]
fn invoker_does_not_outlive_its_handle() -> Result<()> {
    let (driver, first) = common::ref_handle();
    let second = Handle::new(driver.clone())?;
    let problem = problem_on(&first, Direction::Forward)
        .in_channels(6)
        .out_channels(4)
        .input(5, 5)
        .window(3, 3)
        .build()?;
    let invoker = ConvDirectNaive::forward().solution(&problem)?.prepare(&first)?;

    let x = second.create_zeroed(problem.input_elements() * 4)?;
    let w = second.create_zeroed(problem.weight_elements() * 4)?;
    let y = second.create(problem.output_elements() * 4)?;
    let params = InvokeParams::Forward {
        x: &x,
        w: &w,
        y: &y,
        workspace: None,
    };
    invoker.run(&first, &params)?;
    assert_eq!(driver.launches().len(), 1);

    drop(first);
    let err = invoker.run(&second, &params).unwrap_err();
    assert!(matches!(err, ConvError::Launch { .. }), "{err}");
    assert_eq!(driver.launches().len(), 1);
    drop(invoker);
    assert_eq!(driver.live_programs(), 0);
    Ok(())
}

#[test]
fn invoker_rejects_mismatched_buffers() -> Result<()> {
    let (_driver, handle) = common::ref_handle();
    let problem = problem_on(&handle, Direction::BackwardWeights)
        .batch(2)
        .in_channels(8)
        .out_channels(128)
        .input(7, 7)
        .window(4, 4)
        .build()?;
    let solution = ConvAsmImplicitGemmV4R1DynamicWrw.solution(&problem)?;
    let invoker = solution.prepare(&handle)?;
    assert_eq!(invoker.workspace_size(), solution.workspace_size);
    assert_eq!(invoker.kernels().len(), 2);

    let x = handle.create(problem.input_elements() * 4)?;
    let dy = handle.create(problem.output_elements() * 4)?;
    let dw = handle.create(problem.weight_elements() * 4)?;
    let short = handle.create(solution.workspace_size - 4)?;

    let missing = invoker.run(
        &handle,
        &InvokeParams::BackwardWeights {
            dy: &dy,
            x: &x,
            dw: &dw,
            workspace: None,
        },
    );
    assert!(matches!(missing, Err(ConvError::InvalidInvocation { .. })));

    let too_small = invoker.run(
        &handle,
        &InvokeParams::BackwardWeights {
            dy: &dy,
            x: &x,
            dw: &dw,
            workspace: Some(&short),
        },
    );
    assert!(matches!(too_small, Err(ConvError::InvalidInvocation { .. })));

    let wrong_direction = invoker.run(
        &handle,
        &InvokeParams::Forward {
            x: &x,
            w: &dw,
            y: &dy,
            workspace: None,
        },
    );
    assert!(matches!(
        wrong_direction,
        Err(ConvError::InvalidInvocation { .. })
    ));

    let truncated_dy = handle.create(problem.output_elements() * 4 - 4)?;
    let workspace = handle.create(solution.workspace_size)?;
    let short_tensor = invoker.run(
        &handle,
        &InvokeParams::BackwardWeights {
            dy: &truncated_dy,
            x: &x,
            dw: &dw,
            workspace: Some(&workspace),
        },
    );
    assert!(matches!(
        short_tensor,
        Err(ConvError::InvalidInvocation { .. })
    ));
    Ok(())
}

#[test]
fn profiling_reports_time_of_the_last_run() -> Result<()> {
    let (_driver, handle) = common::ref_handle();
    let problem = problem_on(&handle, Direction::BackwardWeights)
        .batch(2)
        .in_channels(8)
        .out_channels(128)
        .input(7, 7)
        .window(4, 4)
        .build()?;
    let solution = ConvAsmImplicitGemmV4R1DynamicWrw.solution(&problem)?;
    let invoker = solution.prepare(&handle)?;
    let x = handle.create_zeroed(problem.input_elements() * 4)?;
    let dy = handle.create_zeroed(problem.output_elements() * 4)?;
    let dw = handle.create(problem.weight_elements() * 4)?;
    let workspace = handle.create(solution.workspace_size)?;
    let params = InvokeParams::BackwardWeights {
        dy: &dy,
        x: &x,
        dw: &dw,
        workspace: Some(&workspace),
    };

    invoker.run(&handle, &params)?;
    assert!(handle.kernel_time().is_zero());

    handle.enable_profiling(true);
    invoker.run(&handle, &params)?;
    assert!(!handle.kernel_time().is_zero());
    Ok(())
}

#[test]
fn kernels_are_cached_per_solver_and_network_config() -> Result<()> {
    let (driver, handle) = common::ref_handle();
    let first = problem_on(&handle, Direction::BackwardWeights)
        .batch(2)
        .in_channels(8)
        .out_channels(128)
        .input(7, 7)
        .window(4, 4)
        .build()?;
    let second = problem_on(&handle, Direction::BackwardWeights)
        .batch(4)
        .in_channels(8)
        .out_channels(128)
        .input(9, 9)
        .window(4, 4)
        .pad(1, 1)
        .stride(2, 2)
        .build()?;
    let solver = ConvAsmImplicitGemmV4R1DynamicWrw;

    let solution = solver.solution(&first)?;
    solution.prepare(&handle)?;
    let stats = handle.program_cache_stats();
    assert_eq!((stats.hits, stats.misses, stats.programs), (0, 2, 2));

    // Same solution again: served from the kernel cache.
    solution.prepare(&handle)?;
    assert_eq!(handle.program_cache_stats().misses, 2);
    let cached = handle.get_kernels(&solution.solver_id, &solution.network_config)?;
    let names: Vec<_> = cached.iter().map(|k| k.kernel().name().to_string()).collect();
    assert_eq!(
        names,
        vec![
            solution.construction_params[0].kernel_name.clone(),
            "wrw_reduction_hip".to_string()
        ]
    );

    // A different problem reuses both programs.
    solver.solution(&second)?.prepare(&handle)?;
    let stats = handle.program_cache_stats();
    assert_eq!((stats.hits, stats.misses, stats.programs), (2, 2, 2));
    assert_eq!(driver.builds().len(), 2);

    assert!(handle.get_kernels(&solution.solver_id, "unknown")?.is_empty());
    Ok(())
}

#[test]
fn solutions_render_as_json() -> Result<()> {
    let (_driver, handle) = common::ref_handle();
    let problem = problem_on(&handle, Direction::BackwardWeights)
        .batch(2)
        .in_channels(8)
        .out_channels(128)
        .input(7, 7)
        .window(4, 4)
        .build()?;
    let solution = ConvAsmImplicitGemmV4R1DynamicWrw.solution(&problem)?;
    let json: serde_json::Value = serde_json::from_str(&solution.to_json()?)?;
    assert_eq!(json["solver_id"], "ConvAsmImplicitGemmV4R1DynamicWrw");
    assert_eq!(json["workspace_size"], 131_072);
    assert_eq!(json["construction_params"].as_array().map(Vec::len), Some(2));
    assert_eq!(
        json["construction_params"][1]["kernel_file"],
        "wrw_reduction_hip.cpp"
    );
    Ok(())
}

#[test]
fn failed_builds_surface_as_compile_errors() -> Result<()> {
    let (driver, handle) = common::ref_handle();
    driver.fail_builds_of("wrw_reduction_hip.cpp");
    let problem = problem_on(&handle, Direction::BackwardWeights)
        .batch(2)
        .in_channels(8)
        .out_channels(128)
        .input(7, 7)
        .window(4, 4)
        .build()?;
    let err = ConvAsmImplicitGemmV4R1DynamicWrw
        .solution(&problem)?
        .prepare(&handle)
        .unwrap_err();
    assert!(matches!(err, ConvError::Compile { .. }), "{err}");
    Ok(())
}
