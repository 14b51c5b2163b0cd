use std::{
    borrow::Cow,
    fs::{self, File, OpenOptions},
    io::{self, Write},
};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};

/// Adds a suffix to the file(directory) name, either appending the suffix to the end of its extension,
/// or if there's no extension, creates one and puts a suffix there.
pub fn path_with_suffix_extension(original_path: impl AsRef<Utf8Path>, suffix: &str) -> Utf8PathBuf {
    let new_extension = match original_path.as_ref().extension() {
        Some(extension) => Cow::Owned(format!("{extension}.{suffix}")),
        None => Cow::Borrowed(suffix),
    };
    original_path.as_ref().with_extension(new_extension.as_ref())
}

/// Appends `suffix` verbatim to the last path component, `/data/gpseg0` + `.old` -> `/data/gpseg0.old`.
pub fn path_with_suffix(original_path: impl AsRef<Utf8Path>, suffix: &str) -> Utf8PathBuf {
    let original_path = original_path.as_ref();
    let trimmed = original_path.as_str().trim_end_matches('/');
    Utf8PathBuf::from(format!("{trimmed}{suffix}"))
}

pub fn fsync_file_and_parent(file_path: &Utf8Path) -> anyhow::Result<()> {
    let parent = file_path
        .parent()
        .with_context(|| format!("File {file_path} has no parent"))?;

    fsync(file_path)?;
    fsync(parent)?;
    Ok(())
}

pub fn fsync(path: &Utf8Path) -> anyhow::Result<()> {
    File::open(path)
        .context("Failed to open the file")
        .and_then(|file| file.sync_all().context("Failed to sync file metadata"))
        .with_context(|| format!("Failed to fsync file {path}"))
}

/// Similar to [`std::fs::create_dir_all`], except we fsync all
/// newly created directories and the pre-existing parent.
pub fn create_dir_all(path: impl AsRef<Utf8Path>) -> anyhow::Result<()> {
    let mut path = path.as_ref();

    let mut dirs_to_create = Vec::new();

    // Figure out which directories we need to create.
    loop {
        match path.metadata() {
            Ok(metadata) if metadata.is_dir() => break,
            Ok(_) => anyhow::bail!("non-directory found in path: {path}"),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => anyhow::bail!("Error during path {path} metadata retrieval: {e}"),
        }

        dirs_to_create.push(path);

        match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => path = parent,
            _ => anyhow::bail!("can't find parent of path '{path}'"),
        }
    }

    // Create directories from parent to child.
    for &path in dirs_to_create.iter().rev() {
        match fs::create_dir(path) {
            Ok(()) => {}
            // Another process may have won the race, which is fine.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to create directory {path}")),
        }
    }

    // Fsync the created directories from child to parent.
    for &path in dirs_to_create.iter() {
        fsync(path)?;
    }

    // If we created any new directories, fsync the parent.
    if !dirs_to_create.is_empty() {
        fsync(path)?;
    }

    Ok(())
}

/// Writes `content` to `final_path` so that readers observe either the old or the new file.
///
/// The content goes to a sibling `<name>.___temp` file which is fsynced,
/// renamed over `final_path`, and then the parent directory is fsynced.
pub fn overwrite(final_path: &Utf8Path, content: &[u8]) -> anyhow::Result<()> {
    let tmp_path = path_with_suffix_extension(final_path, TEMP_FILE_SUFFIX);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .with_context(|| format!("Failed to open temporary file {tmp_path}"))?;
    let tmp_guard = scopeguard::guard(tmp_path.clone(), |tmp_path| {
        let _ = fs::remove_file(tmp_path);
    });

    file.write_all(content)
        .with_context(|| format!("Failed to write temporary file {tmp_path}"))?;
    file.sync_all()
        .with_context(|| format!("Failed to fsync temporary file {tmp_path}"))?;
    drop(file);

    fs::rename(&tmp_path, final_path)
        .with_context(|| format!("Failed to rename {tmp_path} to {final_path}"))?;
    scopeguard::ScopeGuard::into_inner(tmp_guard);

    let parent = final_path
        .parent()
        .with_context(|| format!("File {final_path} has no parent"))?;
    // A bare filename has an empty parent, which means the current directory.
    let parent = if parent.as_str().is_empty() {
        Utf8Path::new(".")
    } else {
        parent
    };
    fsync(parent)
}

pub const TEMP_FILE_SUFFIX: &str = "___temp";

#[cfg(test)]
mod tests {
    use camino_tempfile::tempdir;

    use super::*;

    #[test]
    fn test_path_with_suffix_extension() {
        let p = Utf8PathBuf::from("/foo/bar");
        assert_eq!(path_with_suffix_extension(&p, "temp"), "/foo/bar.temp");
        let p = Utf8PathBuf::from("/foo/bar.baz");
        assert_eq!(
            path_with_suffix_extension(&p, "temp.temp"),
            "/foo/bar.baz.temp.temp"
        );
    }

    #[test]
    fn test_path_with_suffix() {
        assert_eq!(path_with_suffix("/data/gpseg0", ".old"), "/data/gpseg0.old");
        assert_eq!(path_with_suffix("/data/gpseg0/", ".old"), "/data/gpseg0.old");
        assert_eq!(
            path_with_suffix("/data/demoDataDir.AAAAAAAAAAA.0", ".old"),
            "/data/demoDataDir.AAAAAAAAAAA.0.old"
        );
    }

    #[test]
    fn test_create_dir_all_fsyncd() {
        let dir = tempdir().unwrap();

        let existing_dir_path = dir.path();
        create_dir_all(existing_dir_path).unwrap();

        let nested_child_dir = existing_dir_path.join("child1").join("child2");
        assert!(!nested_child_dir.exists());
        create_dir_all(&nested_child_dir).unwrap();
        assert!(nested_child_dir.exists());

        let file_path = existing_dir_path.join("file");
        std::fs::write(&file_path, b"").unwrap();

        let err = create_dir_all(&file_path).unwrap_err();
        let error_message = format!("{:#}", err);
        assert!(
            error_message.contains("non-directory found in path"),
            "Unexpected error message: {error_message}"
        );
    }

    #[test]
    fn test_overwrite_replaces_content_and_cleans_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        overwrite(&path, b"first").unwrap();
        overwrite(&path, b"second").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!path_with_suffix_extension(&path, TEMP_FILE_SUFFIX).exists());
    }

    #[test]
    fn test_overwrite_missing_parent_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("steps.json");

        let err = overwrite(&path, b"{}").unwrap_err();
        assert!(
            format!("{err:#}").contains("Failed to open temporary file"),
            "Unexpected error message: {err:#}"
        );
    }
}
