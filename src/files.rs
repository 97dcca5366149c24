//! Small filesystem helpers shared across the engine.

use std::{
    env, fs, io,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};

/// Creates all directories in a path if they don't exist.
pub fn create_dirs<S>(path: S) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    fs::create_dir_all(path.as_ref()).context(format!(
        "Could not create path: {}",
        path.as_ref().display()
    ))
}

/// Returns whether the path exists at all.
pub fn path_exists(path: impl AsRef<Path>) -> bool {
    path.as_ref().exists()
}

/// Makes a path absolute against the current working directory, without
/// resolving symlinks.
pub fn absolute(path: impl AsRef<Path>) -> io::Result<PathBuf> {
    let path = path.as_ref();
    if path.is_absolute() {
        Ok(path.to_owned())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}

/// Returns whether the directory has no entries.
pub fn is_empty_dir(path: impl AsRef<Path>) -> io::Result<bool> {
    Ok(fs::read_dir(path.as_ref())?.next().is_none())
}

/// Returns whether the file at `path` is no longer the same inode that
/// `before` described. A vanished path counts as changed.
pub fn file_changed(before: &fs::Metadata, path: impl AsRef<Path>) -> bool {
    match fs::symlink_metadata(path.as_ref()) {
        Ok(after) => before.dev() != after.dev() || before.ino() != after.ino(),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::File;

    use tempfile::TempDir;

    #[test]
    fn test_is_empty_dir() {
        let dir = TempDir::new().unwrap();
        assert!(is_empty_dir(dir.path()).unwrap());

        File::create(dir.path().join("entry")).unwrap();
        assert!(!is_empty_dir(dir.path()).unwrap());

        assert!(is_empty_dir(dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_absolute() {
        assert_eq!(absolute("/etc").unwrap(), Path::new("/etc"));

        let relative = absolute("some/dir").unwrap();
        assert!(relative.is_absolute());
        assert!(relative.ends_with("some/dir"));
    }

    #[test]
    fn test_file_changed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("probe");
        File::create(&path).unwrap();

        let before = fs::symlink_metadata(&path).unwrap();
        assert!(!file_changed(&before, &path));

        // replacing the file changes the inode
        fs::remove_file(&path).unwrap();
        assert!(file_changed(&before, &path));
        File::create(&path).unwrap();
        assert!(file_changed(&before, &path));
    }
}
