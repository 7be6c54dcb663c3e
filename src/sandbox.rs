//! Work-area construction and teardown.
//!
//! A work area is a disposable directory tree that stands in for a real
//! installation. Reference directories are mirrored with symlinks (files are
//! linked, directories are recreated), so a test sees the installed system
//! under test without paying for a copy of it.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt, symlink};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

/// Root under which work areas are derived unless configured otherwise.
pub const DEFAULT_WORK_AREA_ROOT: &str = "/tmp/asterisk-testsuite";

/// Mode for directories created by the work-area builder (before umask).
const DIR_MODE: u32 = 0o755;

static NEXT_INSTANCE: AtomicU32 = AtomicU32::new(1);

/// Error type for work-area operations.
///
/// Every variant names the path that could not be handled.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("unable to create directory in work area ({}): {source}", .path.display())]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("error opening dir '{}': {source}", .path.display())]
    ReadDir { path: PathBuf, source: io::Error },
    #[error("error with stat for '{}': {source}", .path.display())]
    Stat { path: PathBuf, source: io::Error },
    #[error("error symlink '{}': {source}", .path.display())]
    Symlink { path: PathBuf, source: io::Error },
    #[error("error unlinking path '{}': {source}", .path.display())]
    Unlink { path: PathBuf, source: io::Error },
    #[error("error removing dir '{}': {source}", .path.display())]
    RemoveDir { path: PathBuf, source: io::Error },
    #[error("error determining working directory: {0}")]
    WorkingDir(#[source] io::Error),
}

/// The parts of a reference installation that make up a work area.
///
/// All paths are relative to the installation root; a leading `/` is
/// accepted and ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Layout {
    /// Directories mirrored recursively with symlinks.
    pub mirror_dirs: Vec<PathBuf>,
    /// Directories created empty.
    pub create_dirs: Vec<PathBuf>,
    /// Individual files linked into the work area.
    pub files: Vec<PathBuf>,
}

impl Default for Layout {
    fn default() -> Self {
        let paths = |list: &[&str]| list.iter().map(PathBuf::from).collect();
        Self {
            mirror_dirs: paths(&[
                "etc/asterisk",
                "usr/lib/asterisk/modules",
                "usr/include/asterisk",
                "var/lib/asterisk",
                "var/log/asterisk",
                "var/spool/asterisk",
            ]),
            create_dirs: paths(&["var/run/asterisk"]),
            files: paths(&[
                "usr/sbin/astcanary",
                "usr/sbin/asterisk",
                "usr/sbin/astgenkey",
                "usr/sbin/autosupport",
                "usr/sbin/rasterisk",
                "usr/sbin/safe_asterisk",
            ]),
        }
    }
}

/// A work area bound to its derived location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkArea {
    index: u32,
    path: PathBuf,
}

impl WorkArea {
    /// Derive a fresh work area for the current working directory.
    ///
    /// Consumes one instance index, so two calls never share a path.
    pub fn derive(root: &Path) -> Result<Self, SandboxError> {
        let cwd = std::env::current_dir().map_err(SandboxError::WorkingDir)?;
        let index = next_instance_index();
        Ok(Self {
            index,
            path: derive_work_area_path(&cwd, root, index),
        })
    }

    /// Instance index this work area was derived from.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Populate the work area from `install` according to `layout`.
    pub fn create(&self, install: &Path, layout: &Layout) -> Result<(), SandboxError> {
        create_work_area(install, &self.path, layout)
    }

    /// Remove the work area and everything below it.
    pub fn clean(&self) -> Result<(), SandboxError> {
        remove_work_area(&self.path)
    }
}

/// Take the next per-process work-area instance index.
pub fn next_instance_index() -> u32 {
    NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
}

/// Compute the work-area path for an instance index.
///
/// The base name of `cwd` keeps work areas of different test directories
/// apart. Base names that say nothing about the directory (`.`, `..`, `/`)
/// place the work area directly under `root`.
pub fn derive_work_area_path(cwd: &Path, root: &Path, index: u32) -> PathBuf {
    let leaf = format!("ast{index}");
    match cwd.file_name() {
        Some(base) if base != "." && base != ".." && base != "/" => root.join(base).join(leaf),
        _ => root.join(leaf),
    }
}

/// Build a work area at `work_area` mirroring `install`.
///
/// Not atomic: on error, whatever was already created stays in place and
/// must be removed with [`remove_work_area`].
pub fn create_work_area(
    install: &Path,
    work_area: &Path,
    layout: &Layout,
) -> Result<(), SandboxError> {
    log::debug!(
        "creating work area {} from {}",
        work_area.display(),
        install.display()
    );

    for dir in &layout.mirror_dirs {
        let dir = relative(dir);
        let dst = work_area.join(dir);
        make_dirs(&dst)?;
        mirror_dir(&install.join(dir), &dst)?;
    }

    for dir in &layout.create_dirs {
        make_dirs(&work_area.join(relative(dir)))?;
    }

    for file in &layout.files {
        let file = relative(file);
        let dst = work_area.join(file);
        if let Some(parent) = dst.parent() {
            make_dirs(parent)?;
        }
        link(&install.join(file), &dst)?;
    }

    Ok(())
}

/// Recursively remove a work area.
///
/// Symlinks are removed, never followed, so the reference installation is
/// left untouched. A missing path is not an error.
pub fn remove_work_area(path: &Path) -> Result<(), SandboxError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(SandboxError::Stat {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    if meta.is_dir() {
        let entries = fs::read_dir(path).map_err(|source| SandboxError::ReadDir {
            path: path.to_path_buf(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| SandboxError::ReadDir {
                path: path.to_path_buf(),
                source,
            })?;
            remove_work_area(&entry.path())?;
        }
        fs::remove_dir(path).map_err(|source| SandboxError::RemoveDir {
            path: path.to_path_buf(),
            source,
        })
    } else {
        fs::remove_file(path).map_err(|source| SandboxError::Unlink {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Strip any root or prefix so `path` always lands inside a base directory.
fn relative(path: &Path) -> &Path {
    let mut components = path.components();
    while let Some(Component::RootDir | Component::Prefix(_)) = components.clone().next() {
        components.next();
    }
    components.as_path()
}

fn make_dirs(path: &Path) -> Result<(), SandboxError> {
    DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(path)
        .map_err(|source| SandboxError::CreateDir {
            path: path.to_path_buf(),
            source,
        })
}

fn link(src: &Path, dst: &Path) -> Result<(), SandboxError> {
    symlink(src, dst).map_err(|source| SandboxError::Symlink {
        path: dst.to_path_buf(),
        source,
    })
}

/// Recreate the directories of `src` under `dst` and symlink everything else.
fn mirror_dir(src: &Path, dst: &Path) -> Result<(), SandboxError> {
    let entries = fs::read_dir(src).map_err(|source| SandboxError::ReadDir {
        path: src.to_path_buf(),
        source,
    })?;

    for entry in entries {
        let entry = entry.map_err(|source| SandboxError::ReadDir {
            path: src.to_path_buf(),
            source,
        })?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        let meta = fs::symlink_metadata(&src_path).map_err(|source| SandboxError::Stat {
            path: src_path.clone(),
            source,
        })?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            match DirBuilder::new()
                .mode(meta.permissions().mode() & 0o7777)
                .create(&dst_path)
            {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(source) => {
                    return Err(SandboxError::CreateDir {
                        path: dst_path,
                        source,
                    });
                }
            }
            mirror_dir(&src_path, &dst_path)?;
        } else if file_type.is_file() || file_type.is_symlink() {
            link(&src_path, &dst_path)?;
        } else {
            log::debug!("skipping unsupported file type: {}", src_path.display());
        }
    }

    Ok(())
}
