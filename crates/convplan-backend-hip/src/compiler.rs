//! Builds code objects for the HIP driver.
//!
//! Assembly programs (`.s`) go through clang's AMDGPU assembler and C++
//! programs through `hipcc --genco`. Results are cached in memory and on
//! disk, keyed by a fingerprint of the source text, build options, target
//! and tool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};

use convplan::device::ProgramSource;
use convplan::hashing::fnv1a_hash;
use convplan::{ConvError, ConvResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramKind {
    Assembly,
    Hip,
    Binary,
}

impl ProgramKind {
    pub fn of(source: &ProgramSource) -> ConvResult<Self> {
        if source.is_binary {
            return Ok(ProgramKind::Binary);
        }
        match Path::new(&source.name)
            .extension()
            .and_then(|ext| ext.to_str())
        {
            Some("s") => Ok(ProgramKind::Assembly),
            Some("cpp") => Ok(ProgramKind::Hip),
            _ => Err(ConvError::compile(
                &source.name,
                "unsupported program type (expected .s or .cpp)",
            )),
        }
    }
}

/// Locations of kernel sources, the cache, and the build tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerConfig {
    pub kernel_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub clang: String,
    pub hipcc: String,
}

impl CompilerConfig {
    /// Reads `CONVPLAN_HIP_KERNEL_DIR`, `CONVPLAN_HIP_CACHE_DIR`,
    /// `CONVPLAN_HIP_CLANG` and `CONVPLAN_HIPCC`.
    pub fn from_env() -> Self {
        Self {
            kernel_dir: env_path("CONVPLAN_HIP_KERNEL_DIR")
                .unwrap_or_else(|| PathBuf::from("kernels")),
            cache_dir: env_path("CONVPLAN_HIP_CACHE_DIR")
                .unwrap_or_else(|| PathBuf::from(".cache/convplan-hip")),
            clang: env_string("CONVPLAN_HIP_CLANG")
                .unwrap_or_else(|| "/opt/rocm/llvm/bin/clang".to_string()),
            hipcc: env_string("CONVPLAN_HIPCC")
                .unwrap_or_else(|| "/opt/rocm/bin/hipcc".to_string()),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_string(key).map(PathBuf::from)
}

/// Sidecar written next to every cached code object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CompileMeta {
    program: String,
    params: String,
    arch: String,
    tool: String,
}

#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub fingerprint: u64,
    pub code_object: Arc<[u8]>,
}

pub struct HipCompiler {
    config: CompilerConfig,
    arch: String,
    compiled: Mutex<HashMap<u64, Arc<CompiledProgram>>>,
    compile_gates: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl HipCompiler {
    pub fn new(config: CompilerConfig, arch: impl Into<String>) -> Self {
        Self {
            config,
            arch: arch.into(),
            compiled: Mutex::new(HashMap::new()),
            compile_gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Returns the code object for `source`, building it if neither the
    /// memory nor the disk cache has it.
    pub fn compile(&self, source: &ProgramSource) -> ConvResult<Arc<CompiledProgram>> {
        let kind = ProgramKind::of(source)?;
        let source_path = self.config.kernel_dir.join(&source.name);
        let text = std::fs::read(&source_path).map_err(|err| {
            ConvError::compile(
                &source.name,
                format!("cannot read {}: {err}", source_path.display()),
            )
        })?;
        if kind == ProgramKind::Binary {
            return Ok(Arc::new(CompiledProgram {
                fingerprint: fnv1a_hash(&text),
                code_object: Arc::from(text),
            }));
        }

        let tool = self.tool(kind);
        let fingerprint = program_fingerprint(&text, source, &self.arch, tool);
        if let Some(found) = lock(&self.compiled, &source.name)?.get(&fingerprint).cloned() {
            log::trace!("code object memory hit: {}", source.name);
            return Ok(found);
        }

        let gate = {
            let mut gates = lock(&self.compile_gates, &source.name)?;
            Arc::clone(
                gates
                    .entry(fingerprint)
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _gate_lock = lock(&*gate, &source.name)?;

        if let Some(found) = lock(&self.compiled, &source.name)?.get(&fingerprint).cloned() {
            return Ok(found);
        }

        let cache_dir = &self.config.cache_dir;
        std::fs::create_dir_all(cache_dir).map_err(|err| io_error(source, cache_dir, err))?;
        let stem = format!(
            "{}_{fingerprint:016x}_{}",
            file_stem(&source.name),
            sanitize(&self.arch)
        );
        let co_path = cache_dir.join(format!("{stem}.co"));
        let meta_path = cache_dir.join(format!("{stem}.meta.json"));
        let meta = CompileMeta {
            program: source.name.clone(),
            params: source.params.clone(),
            arch: self.arch.clone(),
            tool: tool.to_string(),
        };

        if cached_meta(&meta_path).as_ref() == Some(&meta) && co_path.exists() {
            log::debug!("code object disk hit: {}", co_path.display());
        } else {
            log::debug!(
                "compiling {} for {} (`{}`)",
                source.name,
                self.arch,
                source.params
            );
            let args = build_args(kind, &self.arch, &source.params, &source_path, &co_path);
            run_tool(&source.name, tool, &args)?;
            let rendered = serde_json::to_string_pretty(&meta)
                .map_err(|err| ConvError::compile(&source.name, err.to_string()))?;
            std::fs::write(&meta_path, rendered)
                .map_err(|err| io_error(source, &meta_path, err))?;
        }

        let code_object = std::fs::read(&co_path).map_err(|err| io_error(source, &co_path, err))?;
        let compiled = Arc::new(CompiledProgram {
            fingerprint,
            code_object: Arc::from(code_object),
        });
        lock(&self.compiled, &source.name)?.insert(fingerprint, Arc::clone(&compiled));
        Ok(compiled)
    }

    fn tool(&self, kind: ProgramKind) -> &str {
        match kind {
            ProgramKind::Hip => &self.config.hipcc,
            _ => &self.config.clang,
        }
    }
}

/// Command-line arguments (tool excluded) that build `source` into `output`.
pub fn build_args(
    kind: ProgramKind,
    arch: &str,
    params: &str,
    source: &Path,
    output: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = match kind {
        ProgramKind::Assembly => vec![
            "-x".into(),
            "assembler".into(),
            "-target".into(),
            "amdgcn-amd-amdhsa".into(),
            format!("-mcpu={arch}"),
        ],
        ProgramKind::Hip => vec![
            "--genco".into(),
            format!("--offload-arch={arch}"),
            "-O3".into(),
        ],
        ProgramKind::Binary => Vec::new(),
    };
    args.extend(params.split_whitespace().map(str::to_string));
    args.push(source.display().to_string());
    args.push("-o".into());
    args.push(output.display().to_string());
    args
}

fn run_tool(program: &str, tool: &str, args: &[String]) -> ConvResult<()> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|err| ConvError::compile(program, format!("failed to run {tool}: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        return Err(ConvError::compile(
            program,
            format!(
                "{tool} failed (status={}): stdout='{}' stderr='{}'",
                output.status,
                stdout.trim(),
                stderr.trim()
            ),
        ));
    }
    Ok(())
}

fn cached_meta(path: &Path) -> Option<CompileMeta> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

/// Stable across runs so the disk cache survives restarts.
fn program_fingerprint(text: &[u8], source: &ProgramSource, arch: &str, tool: &str) -> u64 {
    let mut bytes = Vec::with_capacity(text.len() + 256);
    let parts = [
        source.name.as_bytes(),
        source.params.as_bytes(),
        arch.as_bytes(),
        tool.as_bytes(),
        text,
    ];
    for part in parts {
        bytes.extend_from_slice(&(part.len() as u64).to_le_bytes());
        bytes.extend_from_slice(part);
    }
    fnv1a_hash(&bytes)
}

fn file_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(sanitize)
        .unwrap_or_else(|| "program".to_string())
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '_' { ch } else { '-' })
        .collect()
}

fn io_error(source: &ProgramSource, path: &Path, err: std::io::Error) -> ConvError {
    ConvError::compile(&source.name, format!("{}: {err}", path.display()))
}

fn lock<'a, T>(mutex: &'a Mutex<T>, program: &str) -> ConvResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| ConvError::compile(program, "compiler cache poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str, params: &str) -> ProgramSource {
        ProgramSource {
            name: name.to_string(),
            params: params.to_string(),
            is_binary: false,
        }
    }

    #[test]
    fn program_kind_follows_the_extension() {
        let asm = source("igemm_v4r1_wrw_dynamic.s", "");
        assert_eq!(ProgramKind::of(&asm).expect("asm"), ProgramKind::Assembly);
        let hip = source("wrw_reduction_hip.cpp", "");
        assert_eq!(ProgramKind::of(&hip).expect("hip"), ProgramKind::Hip);
        let mut binary = source("kernel.co", "");
        binary.is_binary = true;
        assert_eq!(ProgramKind::of(&binary).expect("bin"), ProgramKind::Binary);
        assert!(matches!(
            ProgramKind::of(&source("kernel.cl", "")),
            Err(ConvError::Compile { .. })
        ));
    }

    #[test]
    fn assembler_arguments_carry_the_defsym_options() {
        let args = build_args(
            ProgramKind::Assembly,
            "gfx906",
            "-Wa,-defsym,ROCM_METADATA_VERSION=5",
            Path::new("k/igemm.s"),
            Path::new("c/igemm.co"),
        );
        assert_eq!(
            args,
            vec![
                "-x",
                "assembler",
                "-target",
                "amdgcn-amd-amdhsa",
                "-mcpu=gfx906",
                "-Wa,-defsym,ROCM_METADATA_VERSION=5",
                "k/igemm.s",
                "-o",
                "c/igemm.co",
            ]
        );
    }

    #[test]
    fn hipcc_arguments_split_options_on_whitespace() {
        let args = build_args(
            ProgramKind::Hip,
            "gfx900",
            " -Wno-old-style-cast  -Wno-cast-align ",
            Path::new("wrw_reduction_hip.cpp"),
            Path::new("out.co"),
        );
        assert_eq!(&args[..2], &["--genco", "--offload-arch=gfx900"]);
        assert!(args.contains(&"-Wno-old-style-cast".to_string()));
        assert!(args.contains(&"-Wno-cast-align".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("out.co"));
    }

    #[test]
    fn fingerprint_covers_options_target_and_text() {
        let base = source("a.s", "-DX=1");
        let reference = program_fingerprint(b"text", &base, "gfx906", "clang");
        assert_eq!(reference, program_fingerprint(b"text", &base, "gfx906", "clang"));
        assert_ne!(reference, program_fingerprint(b"text!", &base, "gfx906", "clang"));
        assert_ne!(reference, program_fingerprint(b"text", &base, "gfx900", "clang"));
        assert_ne!(
            reference,
            program_fingerprint(b"text", &source("a.s", "-DX=2"), "gfx906", "clang")
        );
    }

    #[test]
    fn cache_names_are_filesystem_safe() {
        assert_eq!(sanitize("gfx906:sramecc+:xnack-"), "gfx906-sramecc--xnack-");
        assert_eq!(file_stem("igemm_v4r1_wrw_dynamic.s"), "igemm_v4r1_wrw_dynamic");
    }
}
