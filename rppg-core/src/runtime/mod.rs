//! runtime: locating the ONNX Runtime shared library
//!
//! `ort` is built with `load-dynamic`, so the library is opened from
//! `ORT_DYLIB_PATH` when the first session is created. The CLI points that
//! variable at a usable copy before loading any model.

use std::env;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

#[cfg(target_os = "macos")]
const ORT_LIB: &str = "libonnxruntime.dylib";
#[cfg(target_os = "windows")]
const ORT_LIB: &str = "onnxruntime.dll";
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const ORT_LIB: &str = "libonnxruntime.so";

/// Sub-paths of a search root where a bundled runtime may live.
const BUNDLED: [&str; 2] = ["models/onnxruntime/lib", "models"];

const SYSTEM_DIRS: [&str; 3] = ["/opt/homebrew/lib", "/usr/local/lib", "/usr/lib"];

/// How many parents of the executable are searched for a bundled runtime.
const EXE_ANCESTORS: usize = 6;

/// Point `ORT_DYLIB_PATH` at an existing ONNX Runtime library.
///
/// A valid path already in the environment wins. Otherwise the bundled
/// locations under the working directory and the executable's ancestors are
/// tried, then the system library directories. Must run before any thread
/// that could read the environment is started.
pub fn configure_ort_dylib() {
    let preset = env::var_os("ORT_DYLIB_PATH").map(PathBuf::from);
    if let Some(path) = &preset {
        if path.is_file() {
            info!(path = %path.display(), "onnxruntime from ORT_DYLIB_PATH");
            return;
        }
        warn!(path = %path.display(), "ORT_DYLIB_PATH does not exist; searching");
    }

    match find_onnxruntime(&search_roots(), |p| p.is_file()) {
        Some(path) => {
            // SAFETY: the CLI calls this on its main thread before the
            // capture and consumer threads exist.
            unsafe { env::set_var("ORT_DYLIB_PATH", &path) };
            info!(path = %path.display(), "onnxruntime found");
        }
        None => warn!(
            lib = ORT_LIB,
            "onnxruntime not found; set ORT_DYLIB_PATH before loading models"
        ),
    }
}

/// Working directory first, then the executable's directory and parents.
fn search_roots() -> Vec<PathBuf> {
    let cwd = env::current_dir().ok();
    let exe_dirs = env::current_exe()
        .ok()
        .into_iter()
        .flat_map(|exe| {
            exe.ancestors()
                .skip(1)
                .take(EXE_ANCESTORS)
                .map(Path::to_path_buf)
                .collect::<Vec<_>>()
        });
    cwd.into_iter().chain(exe_dirs).collect()
}

/// First candidate accepted by `exists`: bundled copies under each root in
/// order, then the system directories.
fn find_onnxruntime(roots: &[PathBuf], exists: impl Fn(&Path) -> bool) -> Option<PathBuf> {
    let bundled = roots
        .iter()
        .flat_map(|root| BUNDLED.iter().map(move |sub| root.join(sub).join(ORT_LIB)));
    let system = SYSTEM_DIRS.iter().map(|dir| Path::new(dir).join(ORT_LIB));
    bundled.chain(system).find(|p| exists(p))
}
