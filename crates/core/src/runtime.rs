//! ONNX Runtime shared-library discovery.
//!
//! With `load-dynamic`, `ort` opens `libonnxruntime` from `ORT_DYLIB_PATH` on first use. This
//! module points that variable at a bundled copy when one exists and preloads the CUDA, cuDNN
//! and TensorRT libraries next to it.

use std::env;
#[cfg(windows)]
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

/// What [`setup_runtime_libs`] found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibs {
    /// `ORT_DYLIB_PATH` as it stands after setup.
    pub ort_dylib: Option<PathBuf>,
    /// Set from a discovered file rather than inherited from the environment.
    pub ort_discovered: bool,
    pub preloaded: Vec<PathBuf>,
}

/// Directories probed for runtime libraries, in priority order.
///
///   1. every entry of `extra` (typically `<data_dir>/lib`)
///   2. `<exe_dir>/` (Windows only), `<exe_dir>/lib/`, `<exe_dir>/../lib/`
///   3. `<cwd>/lib/`
///   4. `/usr/local/lib/`, `/usr/lib/` (Unix only)
fn candidate_lib_dirs(extra: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    for dir in extra {
        push(dir.clone());
    }
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            push(exe_dir.to_path_buf());
            push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push(PathBuf::from("/usr/local/lib"));
        push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

#[cfg(windows)]
fn prepend_dirs_to_path(dirs: &[PathBuf]) {
    let current = env::var_os("PATH");
    let fallback: OsString = current.clone().unwrap_or_default();
    let mut merged: Vec<PathBuf> = dirs.iter().filter(|d| d.is_dir()).cloned().collect();
    if let Some(path) = current {
        for dir in env::split_paths(&path) {
            let key = dir.to_string_lossy().to_ascii_lowercase();
            if !dir.as_os_str().is_empty()
                && !merged
                    .iter()
                    .any(|m| m.to_string_lossy().to_ascii_lowercase() == key)
            {
                merged.push(dir);
            }
        }
    }
    env::set_var("PATH", env::join_paths(merged).unwrap_or(fallback));
}

/// Load-priority tier for GPU runtime libraries, `None` for anything not preloaded.
///
/// ORT provider libraries are skipped: they resolve symbols from `libonnxruntime`, which `ort`
/// loads itself later.
///
///   0: CUDA runtime (cudart, cublas, cublasLt, cufft, curand)
///   1: cuDNN
///   2: TensorRT (nvinfer, nvonnxparser)
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    let name = name.strip_prefix("lib").unwrap_or(&name);
    if ["cudart", "cublas", "cufft", "curand"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("cudnn") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_candidate_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_candidate_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// Libraries to preload, sorted so dependencies load before dependents. The first directory
/// holding a given file name wins.
fn preload_plan(dirs: &[PathBuf]) -> Vec<PathBuf> {
    use std::collections::HashSet;

    let mut seen_names: HashSet<String> = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();

            if !is_candidate_lib(&name, &path) || !seen_names.insert(name.clone()) {
                continue;
            }
            if let Some(priority) = load_priority(&name) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

/// Open with RTLD_GLOBAL so later dlopen calls from ORT resolve against it. glibc caches
/// `LD_LIBRARY_PATH` at startup, so loading by absolute path is the only reliable route.
#[cfg(unix)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::Library::new(path) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Configure runtime library paths before the first ORT session is built.
///
/// Call early in `main()`, before any other thread reads the environment.
pub fn setup_runtime_libs(extra_dirs: &[PathBuf]) -> RuntimeLibs {
    let dirs = candidate_lib_dirs(extra_dirs);
    let mut libs = RuntimeLibs::default();

    if env::var_os(ORT_DYLIB_ENV).is_none() {
        if let Some(path) = find_ort_dylib_in_dirs(&dirs) {
            env::set_var(ORT_DYLIB_ENV, &path);
            libs.ort_discovered = true;
        }

        #[cfg(windows)]
        prepend_dirs_to_path(&dirs);
    }
    libs.ort_dylib = env::var_os(ORT_DYLIB_ENV).map(PathBuf::from);

    for path in preload_plan(&dirs) {
        if unsafe { load_library(&path) } {
            libs.preloaded.push(path);
        }
    }

    libs
}

/// Log what [`setup_runtime_libs`] resolved. Call after tracing is initialized.
pub fn log_runtime_lib_status(libs: &RuntimeLibs) {
    match &libs.ort_dylib {
        Some(path) if path.is_file() => info!(
            path = %path.display(),
            discovered = libs.ort_discovered,
            "ORT library"
        ),
        Some(path) => warn!(path = %path.display(), "{ORT_DYLIB_ENV} points at a missing file"),
        None => warn!("{ORT_DYLIB_ENV} not set, ORT will try default search paths"),
    }
    for path in &libs.preloaded {
        debug!(path = %path.display(), "Preloaded runtime library");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn candidate_lib_dirs_contains_system_paths() {
        let dirs = candidate_lib_dirs(&[]);
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert!(dirs.contains(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn candidate_lib_dirs_puts_extra_dirs_first() {
        let extra = PathBuf::from("/opt/tilescale/lib");
        let dirs = candidate_lib_dirs(&[extra.clone(), extra.clone()]);
        assert_eq!(dirs.first(), Some(&extra));
        assert_eq!(dirs.iter().filter(|d| **d == extra).count(), 1);
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd.join("lib")));
        }
    }

    #[test]
    fn find_ort_dylib_prefers_first_dir() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).expect("first dir should be created");
        std::fs::create_dir_all(&second).expect("second dir should be created");
        std::fs::write(second.join(ORT_LIB_NAME), b"second").expect("write lib");
        assert_eq!(
            find_ort_dylib_in_dirs(&[first.clone(), second.clone()]),
            Some(second.join(ORT_LIB_NAME))
        );

        std::fs::write(first.join(ORT_LIB_NAME), b"first").expect("write lib");
        assert_eq!(
            find_ort_dylib_in_dirs(&[first.clone(), second]),
            Some(first.join(ORT_LIB_NAME))
        );
    }

    #[test]
    fn load_priority_orders_cuda_before_cudnn_before_trt() {
        assert!(load_priority("libcudart.so.12") < load_priority("libcudnn.so.9"));
        assert!(load_priority("cublas64_12.dll") < load_priority("cudnn64_9.dll"));
        assert!(load_priority("libcudnn_ops.so.9") < load_priority("libnvinfer.so.10"));
        assert_eq!(load_priority("nvonnxparser.dll"), Some(2));
    }

    #[test]
    fn load_priority_excludes_ort_and_unknown_libs() {
        assert_eq!(load_priority("libonnxruntime.so.1.23.2"), None);
        assert_eq!(load_priority("libonnxruntime_providers_cuda.so"), None);
        assert_eq!(load_priority("something_else.dll"), None);
    }

    #[cfg(unix)]
    #[test]
    fn preload_plan_sorts_by_tier_and_dedups_names() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        std::fs::create_dir_all(&a).expect("create dir");
        std::fs::create_dir_all(&b).expect("create dir");
        for name in ["libnvinfer.so.10", "libcudnn.so.9", "libpng.so"] {
            std::fs::write(a.join(name), b"").expect("write lib");
        }
        std::fs::write(b.join("libcudart.so.12"), b"").expect("write lib");
        std::fs::write(b.join("libcudnn.so.9"), b"").expect("write lib");

        let plan = preload_plan(&[a.clone(), b.clone()]);
        assert_eq!(
            plan,
            vec![
                b.join("libcudart.so.12"),
                a.join("libcudnn.so.9"),
                a.join("libnvinfer.so.10"),
            ]
        );
    }
}
