use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

const MAX_LINK_DEPTH: usize = 40;

/// Resolves `path` to its real location, following symbolic links even when
/// the final target (or some trailing part of it) does not exist yet.
///
/// Missing trailing components are appended verbatim to the real path of the
/// deepest existing ancestor, so a dangling link resolves to where a write
/// through it would land.
pub fn resolve_real_path(path: &Path) -> io::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    resolve_with_depth(&normalize_lexically(&absolute), 0)
}

/// Returns `Some(resolved)` when `path` resolves to something that is not a
/// strict descendant of `boundary`, which must already be a real path.
pub fn escaping_target(boundary: &Path, path: &Path) -> io::Result<Option<PathBuf>> {
    let resolved = resolve_real_path(path)?;
    if is_strict_descendant(boundary, &resolved) {
        Ok(None)
    } else {
        Ok(Some(resolved))
    }
}

pub fn is_strict_descendant(boundary: &Path, candidate: &Path) -> bool {
    candidate != boundary && candidate.starts_with(boundary)
}

fn resolve_with_depth(path: &Path, depth: usize) -> io::Result<PathBuf> {
    if depth > MAX_LINK_DEPTH {
        return Err(io::Error::other(format!(
            "too many levels of symbolic links resolving {}",
            path.display()
        )));
    }

    match fs::canonicalize(path) {
        Ok(real) => return Ok(real),
        Err(error) if error.kind() != io::ErrorKind::NotFound => return Err(error),
        Err(_) => {}
    }

    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            let target = fs::read_link(path)?;
            let target = if target.is_absolute() {
                target
            } else {
                path.parent().unwrap_or(Path::new("/")).join(target)
            };
            resolve_with_depth(&normalize_lexically(&target), depth + 1)
        }
        Ok(_) => fs::canonicalize(path),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
                return Ok(path.to_path_buf());
            };
            Ok(resolve_with_depth(parent, depth)?.join(name))
        }
        Err(error) => Err(error),
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
