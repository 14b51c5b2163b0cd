/// Extensions to `std::fs` types.
use std::{fs, io};

use camino::Utf8Path;

/// Version of [`std::fs::remove_dir_all`] that is idempotent and tolerates parallel removals of the same path or sub-paths
///
/// The idempotency implies that we return `Ok(())`` even if the file is already gone or has never existed,
/// unlike `remove_dir_all` from std/tokio.
pub fn remove_dir_all(path: impl AsRef<Utf8Path>) -> io::Result<()> {
    fn strip_not_found<T>(v: io::Result<T>) -> Option<io::Result<T>> {
        match v {
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            other => Some(other),
        }
    }
    let path = path.as_ref();
    let Some(list) = strip_not_found(fs::read_dir(path)) else {
        return Ok(());
    };
    for entry in list? {
        let Some(entry) = strip_not_found(entry) else {
            continue;
        };
        let entry = entry?;
        let Some(file_type) = strip_not_found(entry.file_type()) else {
            continue;
        };
        let entry_path = entry.path();
        let entry_path = Utf8Path::from_path(&entry_path).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("non UTF-8 path {}", entry_path.display()),
            )
        })?;
        if file_type?.is_dir() {
            remove_dir_all(entry_path)?;
        } else {
            strip_not_found(fs::remove_file(entry_path)).unwrap_or(Ok(()))?;
        }
    }
    strip_not_found(fs::remove_dir(path)).unwrap_or(Ok(()))
}

/// Renames `from` to `to`, failing if `to` already exists instead of silently replacing an
/// empty directory as `rename(2)` would.
pub fn rename_no_replace(from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
    if to.symlink_metadata().is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("rename {from} to {to}: destination already exists"),
        ));
    }
    fs::rename(from, to)
}
