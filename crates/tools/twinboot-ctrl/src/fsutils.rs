//! Durable file operations.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Replace the file at `path` with `contents` such that a crash leaves either the old or
/// the new contents in place.
///
/// The contents are written to a sibling `.new` file, synchronized, and renamed over
/// the target. Afterwards, the directory is synchronized to persist the rename.
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = parent_dir(path);
    fs::create_dir_all(parent)?;
    let mut new_name = path.file_name().unwrap_or_default().to_owned();
    new_name.push(".new");
    let new_path = parent.join(new_name);
    let mut file = File::create(&new_path)?;
    file.write_all(contents)?;
    file.flush()?;
    file.sync_all()?;
    drop(file);
    fs::rename(&new_path, path)?;
    sync_dir(parent)
}

/// Append a line to a file and synchronize it.
pub fn append_line(path: &Path, line: &str) -> io::Result<()> {
    fs::create_dir_all(parent_dir(path))?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()
}

/// Remove a file if it exists and persist the removal.
pub fn remove_durable(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => sync_dir(parent_dir(path)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

/// Read a file, returning `None` if it does not exist.
pub fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error),
    }
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
