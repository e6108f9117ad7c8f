//! Locating native runtime pieces: the ONNX Runtime shared library loaded by
//! `ort` (`load-dynamic`) and the `ffmpeg`/`ffprobe` executables.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use tracing::{info, warn};

pub const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(target_os = "linux")]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(target_os = "macos")]
const ORT_LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Library search order:
///   1. `<data_dir>/lib/` when a data dir is given
///   2. `<exe_dir>/lib/`, then `<exe_dir>/../lib/`
///   3. `<cwd>/lib/`
///   4. `/usr/local/lib/`, `/usr/lib/` (Unix only)
fn candidate_lib_dirs(data_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Some(data_dir) = data_dir {
        push(data_dir.join("lib"));
    }
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
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

fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("bin"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_bin = cwd.join("bin");
        if !dirs.contains(&cwd_bin) {
            dirs.push(cwd_bin);
        }
    }
    dirs
}

fn binary_file_name(binary: &str) -> String {
    if cfg!(windows) && !binary.to_ascii_lowercase().ends_with(".exe") {
        format!("{binary}.exe")
    } else {
        binary.to_string()
    }
}

fn find_in_dirs(file_name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(file_name))
        .find(|candidate| candidate.is_file())
}

/// Bundled copy of `binary` next to the executable, if any.
pub fn bundled_binary(binary: &str) -> Option<PathBuf> {
    find_in_dirs(&binary_file_name(binary), &candidate_bin_dirs())
}

/// `Command` for a bundled binary, falling back to `PATH` lookup.
pub fn command_for(binary: &str) -> ProcessCommand {
    match bundled_binary(binary) {
        Some(path) => ProcessCommand::new(path),
        None => ProcessCommand::new(binary),
    }
}

/// Point `ORT_DYLIB_PATH` at a discovered ONNX Runtime library unless the
/// user already set it. Call before the first ORT session is built.
pub fn setup_runtime_libs(data_dir: Option<&Path>) -> Option<PathBuf> {
    if let Some(existing) = env::var_os(ORT_DYLIB_ENV) {
        return Some(PathBuf::from(existing));
    }
    let found = find_in_dirs(ORT_LIB_NAME, &candidate_lib_dirs(data_dir))?;
    env::set_var(ORT_DYLIB_ENV, &found);
    Some(found)
}

/// Log which runtime pieces were resolved. Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    match env::var(ORT_DYLIB_ENV) {
        Ok(ort) if Path::new(&ort).is_file() => info!(path = %ort, "ORT library"),
        Ok(ort) => warn!(path = %ort, "ORT_DYLIB_PATH set but file not found"),
        Err(_) => warn!("ORT_DYLIB_PATH not set, ORT will try default search paths"),
    }
    for binary in ["ffmpeg", "ffprobe"] {
        match bundled_binary(binary) {
            Some(path) => info!(binary, path = %path.display(), "using bundled binary"),
            None => info!(binary, "using binary from PATH"),
        }
    }
}
