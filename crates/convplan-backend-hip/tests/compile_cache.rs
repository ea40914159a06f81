use std::path::{Path, PathBuf};

use anyhow::Result;
use convplan::device::ProgramSource;
use convplan::ConvError;
use convplan_backend_hip::{CompilerConfig, HipCompiler};

fn scratch_dir(name: &str) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!(
        "convplan-hip-{name}-{}",
        std::process::id()
    ));
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    std::fs::create_dir_all(dir.join("kernels"))?;
    Ok(dir)
}

fn source(name: &str, params: &str) -> ProgramSource {
    ProgramSource {
        name: name.to_string(),
        params: params.to_string(),
        is_binary: false,
    }
}

/// A stand-in assembler that copies its input to `-o` and logs each call.
#[cfg(unix)]
fn fake_tool(dir: &Path) -> Result<(String, PathBuf)> {
    use std::os::unix::fs::PermissionsExt;

    let log = dir.join("calls.log");
    let tool = dir.join("fake-clang");
    std::fs::write(
        &tool,
        format!(
            "#!/bin/sh\necho \"$@\" >> '{}'\nwhile [ $# -gt 2 ]; do src=\"$1\"; shift; done\ncp \"$src\" \"$2\"\n",
            log.display()
        ),
    )?;
    std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755))?;
    Ok((tool.display().to_string(), log))
}

fn calls(log: &Path) -> usize {
    std::fs::read_to_string(log)
        .map(|text| text.lines().count())
        .unwrap_or(0)
}

#[cfg(unix)]
#[test]
fn code_objects_are_cached_in_memory_and_on_disk() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = scratch_dir("cache")?;
    let (tool, log) = fake_tool(&dir)?;
    std::fs::write(dir.join("kernels/igemm.s"), b"assembly text")?;
    let config = CompilerConfig {
        kernel_dir: dir.join("kernels"),
        cache_dir: dir.join("cache"),
        clang: tool,
        hipcc: "/nonexistent/hipcc".to_string(),
    };
    let program = source("igemm.s", "-Wa,-defsym,ROCM_METADATA_VERSION=5");

    let compiler = HipCompiler::new(config.clone(), "gfx906");
    let first = compiler.compile(&program)?;
    assert_eq!(&*first.code_object, b"assembly text");
    assert_eq!(calls(&log), 1);
    assert!(std::fs::read_to_string(&log)?.contains("-mcpu=gfx906"));

    let again = compiler.compile(&program)?;
    assert_eq!(again.fingerprint, first.fingerprint);
    assert_eq!(calls(&log), 1);

    // A fresh compiler finds the object on disk.
    let restarted = HipCompiler::new(config.clone(), "gfx906");
    restarted.compile(&program)?;
    assert_eq!(calls(&log), 1);

    let metas: Vec<_> = std::fs::read_dir(dir.join("cache"))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.to_string_lossy().ends_with(".meta.json"))
        .collect();
    assert_eq!(metas.len(), 1);
    let meta: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&metas[0])?)?;
    assert_eq!(meta["arch"], "gfx906");
    assert_eq!(meta["program"], "igemm.s");

    // New options or a new target rebuild.
    restarted.compile(&source("igemm.s", "-Wa,-defsym,ROCM_METADATA_VERSION=4"))?;
    assert_eq!(calls(&log), 2);
    HipCompiler::new(config, "gfx900").compile(&program)?;
    assert_eq!(calls(&log), 3);

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn build_failures_are_compile_errors() -> Result<()> {
    let dir = scratch_dir("failures")?;
    std::fs::write(dir.join("kernels/wrw_reduction_hip.cpp"), b"// source")?;
    let compiler = HipCompiler::new(
        CompilerConfig {
            kernel_dir: dir.join("kernels"),
            cache_dir: dir.join("cache"),
            clang: "/nonexistent/clang".to_string(),
            hipcc: "/nonexistent/hipcc".to_string(),
        },
        "gfx906",
    );

    let missing_tool = compiler
        .compile(&source("wrw_reduction_hip.cpp", ""))
        .unwrap_err();
    assert!(matches!(missing_tool, ConvError::Compile { .. }), "{missing_tool}");
    assert!(missing_tool.to_string().contains("hipcc"), "{missing_tool}");

    let missing_source = compiler.compile(&source("absent.s", "")).unwrap_err();
    assert!(matches!(missing_source, ConvError::Compile { .. }));

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn binary_programs_are_loaded_verbatim() -> Result<()> {
    let dir = scratch_dir("binary")?;
    std::fs::write(dir.join("kernels/prebuilt.co"), [0x7f, b'E', b'L', b'F'])?;
    let compiler = HipCompiler::new(
        CompilerConfig {
            kernel_dir: dir.join("kernels"),
            cache_dir: dir.join("cache"),
            clang: "/nonexistent/clang".to_string(),
            hipcc: "/nonexistent/hipcc".to_string(),
        },
        "gfx906",
    );
    let program = ProgramSource {
        name: "prebuilt.co".to_string(),
        params: String::new(),
        is_binary: true,
    };
    let compiled = compiler.compile(&program)?;
    assert_eq!(&*compiled.code_object, &[0x7f, b'E', b'L', b'F']);
    assert!(!dir.join("cache").exists());

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
