//! Per-slot workspace provisioning.
//!
//! The template project is cloned once per evaluator slot into
//! `<root>/<template name>_<slot>`. Slots persist for the life of the process.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Workspace preparation errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Template directory not found: {0}")]
    TemplateMissing(PathBuf),
    #[error("Workspace slot {0} does not exist")]
    MissingSlot(usize),
    #[error("Workspace root {root} lies inside template {template}")]
    NestedRoot { root: PathBuf, template: PathBuf },
    #[error("Failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> WorkspaceError + '_ {
    move |source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Directory of slot `slot` for `template` under `root`.
pub fn slot_path(template: &Path, root: &Path, slot: usize) -> PathBuf {
    let name = template
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workspace".to_string());
    root.join(format!("{name}_{slot}"))
}

/// Clone `template` into `count` slot directories under `root`.
///
/// An existing slot directory is replaced so every run starts from the template.
pub fn provision_slots(
    template: &Path,
    root: &Path,
    count: usize,
) -> Result<Vec<PathBuf>, WorkspaceError> {
    if !template.is_dir() {
        return Err(WorkspaceError::TemplateMissing(template.to_path_buf()));
    }
    let template = template.canonicalize().map_err(io_err(template))?;
    fs::create_dir_all(root).map_err(io_err(root))?;
    let root = root.canonicalize().map_err(io_err(root))?;
    if root.starts_with(&template) {
        return Err(WorkspaceError::NestedRoot { root, template });
    }

    let mut slots = Vec::with_capacity(count);
    for slot in 0..count {
        let dest = slot_path(&template, &root, slot);
        if dest.exists() {
            fs::remove_dir_all(&dest).map_err(io_err(&dest))?;
        }
        copy_tree(&template, &dest)?;
        log::debug!("Provisioned slot {slot} at {}", dest.display());
        slots.push(dest);
    }
    log::info!("Provisioned {count} workspace slots under {}", root.display());
    Ok(slots)
}

fn copy_tree(src: &Path, dst: &Path) -> Result<(), WorkspaceError> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|source| WorkspaceError::Walk {
            path: src.to_path_buf(),
            source,
        })?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(io_err(&target))?;
        } else {
            fs::copy(entry.path(), &target).map_err(io_err(&target))?;
        }
    }
    Ok(())
}

/// All files under `dir` with the given extension, sorted.
pub fn collect_sources(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, WorkspaceError> {
    let mut sources = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|source| WorkspaceError::Walk {
            path: dir.to_path_buf(),
            source,
        })?;
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == extension)
        {
            sources.push(entry.into_path());
        }
    }
    sources.sort();
    Ok(sources)
}
