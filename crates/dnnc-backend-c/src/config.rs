//! Compiler invocation settings.

use std::env;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use dnnc::env::flag;

/// Loaded modules kept per backend instance.
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

static ENV_OPTIONS: Lazy<CCompileOptions> = Lazy::new(CCompileOptions::read_env);

/// How generated C is compiled and where the shared objects live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CCompileOptions {
    /// Compiler executable (`CC`).
    pub compiler: String,
    /// Directory holding compiled modules (`DNNC_C_CACHE_DIR`).
    pub cache_dir: PathBuf,
    /// Build with `-fopenmp` so the parallel pragmas take effect (`DNNC_C_OPENMP`).
    pub openmp: bool,
    /// Leave the generated `.c` next to the library (`DNNC_C_KEEP_SOURCE`).
    pub keep_source: bool,
    #[serde(default)]
    pub extra_flags: Vec<String>,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

impl Default for CCompileOptions {
    fn default() -> Self {
        CCompileOptions {
            compiler: "cc".to_string(),
            cache_dir: env::temp_dir().join("dnnc_c_backend"),
            openmp: false,
            keep_source: false,
            extra_flags: Vec::new(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl CCompileOptions {
    /// Options from the environment, read once per process.
    pub fn from_env() -> Self {
        ENV_OPTIONS.clone()
    }

    fn read_env() -> Self {
        let defaults = CCompileOptions::default();
        let compiler = match env::var("CC") {
            Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
            _ => defaults.compiler,
        };
        let cache_dir = match env::var_os("DNNC_C_CACHE_DIR") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => defaults.cache_dir,
        };
        CCompileOptions {
            compiler,
            cache_dir,
            openmp: flag("DNNC_C_OPENMP"),
            keep_source: flag("DNNC_C_KEEP_SOURCE"),
            ..defaults
        }
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Compiler flags, excluding the source and output paths.
    pub fn flags(&self) -> Vec<String> {
        let mut flags: Vec<String> = Vec::new();
        if cfg!(target_os = "macos") {
            flags.push("-dynamiclib".into());
        } else {
            flags.push("-shared".into());
            flags.push("-fPIC".into());
        }
        flags.push("-O3".into());
        // Keep a*b+c rounded twice so results track the reference backend.
        flags.push("-ffp-contract=off".into());
        if self.openmp {
            flags.push("-fopenmp".into());
        }
        flags.extend(self.extra_flags.iter().cloned());
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_follow_options() {
        let mut options = CCompileOptions::default();
        let flags = options.flags();
        assert!(flags.iter().any(|f| f == "-O3"));
        assert!(flags.iter().any(|f| f == "-ffp-contract=off"));
        assert!(!flags.iter().any(|f| f == "-fopenmp"));

        options.openmp = true;
        options.extra_flags.push("-g".into());
        let flags = options.flags();
        assert!(flags.iter().any(|f| f == "-fopenmp"));
        assert_eq!(flags.last().map(String::as_str), Some("-g"));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: CCompileOptions = serde_json::from_str(
            r#"{"compiler":"clang","cache_dir":"/tmp/x","openmp":true,"keep_source":false}"#,
        )
        .unwrap();
        assert_eq!(options.compiler, "clang");
        assert_eq!(options.cache_capacity, DEFAULT_CACHE_CAPACITY);
        assert!(options.extra_flags.is_empty());
    }
}
