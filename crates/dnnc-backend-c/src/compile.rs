//! Compiling generated C into shared objects and loading them.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use libloading::Library;

use dnnc::backend::{BackendError, BackendResult};

use crate::codegen::ENTRY_SYMBOL;
use crate::config::CCompileOptions;

pub type CEntrypoint = unsafe extern "C" fn(
    inputs: *const *const u8,
    params: *const *const u8,
    outputs: *const *mut u8,
) -> i32;

static BUILD_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A loaded module. The library handle keeps `entry` valid.
pub struct CompiledModule {
    _lib: Library,
    entry: CEntrypoint,
    path: PathBuf,
}

impl CompiledModule {
    pub fn entry(&self) -> CEntrypoint {
        self.entry
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Content hash of a translation unit together with the toolchain that compiles it.
pub fn cache_key(source: &str, options: &CCompileOptions) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.as_bytes());
    hasher.update(b"\0");
    hasher.update(options.compiler.as_bytes());
    for flag in options.flags() {
        hasher.update(b"\0");
        hasher.update(flag.as_bytes());
    }
    *hasher.finalize().as_bytes()
}

pub fn hex(key: &[u8; 32]) -> String {
    blake3::Hash::from(*key).to_hex().to_string()
}

pub fn lib_ext() -> &'static str {
    if cfg!(target_os = "macos") {
        ".dylib"
    } else if cfg!(target_os = "windows") {
        ".dll"
    } else {
        ".so"
    }
}

pub fn library_path(options: &CCompileOptions, key: &[u8; 32]) -> PathBuf {
    options
        .cache_dir
        .join(format!("dnnc_{}{}", hex(key), lib_ext()))
}

/// Builds the module for `source` unless the cache directory already holds it, then loads it.
pub fn build_module(
    source: &str,
    key: &[u8; 32],
    options: &CCompileOptions,
) -> BackendResult<CompiledModule> {
    fs::create_dir_all(&options.cache_dir).map_err(|err| {
        BackendError::compile(format!(
            "cannot create cache dir {}: {err}",
            options.cache_dir.display()
        ))
    })?;

    let lib_path = library_path(options, key);
    if lib_path.exists() {
        dnnc::profiling::cache_event("c.disk_hit");
        log::debug!("reusing compiled module {}", lib_path.display());
    } else {
        dnnc::profiling::cache_event("c.disk_miss");
        let stem = format!("dnnc_{}", hex(key));
        // Per-build staging names: concurrent builds of one key never share a partial file.
        let build = BUILD_COUNTER.fetch_add(1, Ordering::Relaxed);
        let staging = format!("{stem}.{}.{build}", std::process::id());
        let src_path = options.cache_dir.join(format!("{staging}.c"));
        let staged_lib = options.cache_dir.join(format!("{staging}{}", lib_ext()));
        fs::write(&src_path, source).map_err(|err| {
            BackendError::compile(format!("cannot write {}: {err}", src_path.display()))
        })?;

        let started = Instant::now();
        let result = {
            let _scope = dnnc::profiling::compile_scope("c.compile");
            compile_c(&src_path, &staged_lib, options)
        };
        let keep_as = options
            .keep_source
            .then(|| options.cache_dir.join(format!("{stem}.c")));
        dispose_source(&src_path, keep_as.as_deref());
        result?;
        fs::rename(&staged_lib, &lib_path).map_err(|err| {
            BackendError::compile(format!("cannot move {}: {err}", staged_lib.display()))
        })?;
        log::info!(
            "compiled {} in {:.1} ms",
            lib_path.display(),
            started.elapsed().as_secs_f64() * 1e3
        );
    }

    load_module(&lib_path)
}

/// Moves the staged source to `keep_as`, or deletes it. Failures are logged, never fatal.
fn dispose_source(src_path: &Path, keep_as: Option<&Path>) -> bool {
    let result = match keep_as {
        Some(kept) => fs::rename(src_path, kept),
        None => fs::remove_file(src_path),
    };
    match result {
        Ok(()) => true,
        Err(err) => {
            match keep_as {
                Some(kept) => {
                    log::warn!("cannot keep generated source at {}: {err}", kept.display())
                }
                None => log::warn!("cannot remove {}: {err}", src_path.display()),
            }
            false
        }
    }
}

fn load_module(lib_path: &Path) -> BackendResult<CompiledModule> {
    let lib = unsafe { Library::new(lib_path) }.map_err(|err| {
        BackendError::compile(format!("cannot load {}: {err}", lib_path.display()))
    })?;
    let entry = unsafe {
        lib.get::<CEntrypoint>(ENTRY_SYMBOL.as_bytes())
            .map(|symbol| *symbol)
    }
    .map_err(|err| BackendError::compile(format!("{ENTRY_SYMBOL} not found: {err}")))?;
    Ok(CompiledModule {
        _lib: lib,
        entry,
        path: lib_path.to_path_buf(),
    })
}

fn compile_c(src: &Path, out: &Path, options: &CCompileOptions) -> BackendResult<()> {
    let mut cmd = Command::new(&options.compiler);
    cmd.args(options.flags());
    cmd.arg("-o").arg(out).arg(src);
    if !cfg!(target_os = "windows") {
        cmd.arg("-lm");
    }

    let output = cmd.output().map_err(|err| {
        BackendError::compile(format!("cannot run {}: {err}", options.compiler))
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BackendError::compile(format!(
            "{} failed on {}: {stderr}",
            options.compiler,
            src.display()
        )));
    }
    Ok(())
}

/// Whether the configured compiler can be executed at all.
pub fn compiler_available(options: &CCompileOptions) -> bool {
    Command::new(&options.compiler)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_depends_on_source_and_flags() {
        let options = CCompileOptions::default();
        let a = cache_key("int x;", &options);
        assert_eq!(a, cache_key("int x;", &options));
        assert_ne!(a, cache_key("int y;", &options));

        let mut openmp = options.clone();
        openmp.openmp = true;
        assert_ne!(a, cache_key("int x;", &openmp));
    }

    #[test]
    fn source_disposal_failures_are_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("staged.c");
        fs::write(&src, "int x;").unwrap();

        let occupied = dir.path().join("kept.c");
        fs::create_dir(&occupied).unwrap();
        fs::write(occupied.join("inside"), "").unwrap();
        assert!(!dispose_source(&src, Some(&occupied)));
        assert!(src.exists());

        assert!(dispose_source(&src, None));
        assert!(!src.exists());
        assert!(!dispose_source(&src, None));
    }

    #[test]
    fn library_names_use_the_hex_digest() {
        let options = CCompileOptions::default().with_cache_dir("/tmp/cache");
        let key = cache_key("int x;", &options);
        let path = library_path(&options, &key);
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("dnnc_"));
        assert!(name.ends_with(lib_ext()));
        assert_eq!(name.len(), "dnnc_".len() + 64 + lib_ext().len());
    }
}
