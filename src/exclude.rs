//! Maintains a coherent include/exclude set for image-building callers.
//!
//! Callers walk the filesystem and report each path as included or excluded;
//! this keeps the math straight: excluding a directory implicitly excludes
//! everything under it, and including something un-excludes all its parents.

use std::{
    collections::BTreeSet,
    fmt,
    path::{Path, PathBuf},
};

#[derive(Debug, Default)]
pub struct ExcludePaths {
    exclude: BTreeSet<PathBuf>,
    include: Vec<PathBuf>,
}

impl ExcludePaths {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_exclude(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        // If /usr/bin/ls has changed but /usr hasn't, /usr must not land in
        // the exclude list: only add paths that aren't a prefix of anything
        // already included.
        for included in &self.include {
            if included.starts_with(&path) {
                return;
            }
        }
        self.exclude.insert(path);
    }

    pub fn add_include(&mut self, path: impl Into<PathBuf>, is_dir: bool) {
        let original: PathBuf = path.into();

        // remove this path and all its parents from the exclude set,
        // normalizing files to their directory first
        let mut current: &Path = &original;
        if !is_dir {
            current = current.parent().unwrap_or(Path::new("/"));
        }
        loop {
            // paths are absolute, so the root is the base case
            if current == Path::new("/") {
                break;
            }
            self.exclude.remove(current);
            current = match current.parent() {
                Some(parent) => parent,
                None => break,
            };
        }

        // remember the include so nothing above it gets re-added
        self.include.push(original);
    }

    pub fn is_empty(&self) -> bool {
        self.exclude.is_empty()
    }
}

/// The newline-separated exclude list in the form the mkfs tools consume.
impl fmt::Display for ExcludePaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for path in &self.exclude {
            writeln!(f, "{}", path.display())?;
        }
        writeln!(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(paths: &ExcludePaths) -> Vec<String> {
        paths
            .to_string()
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_exclude_then_include_below() {
        let mut paths = ExcludePaths::new();
        paths.add_exclude("/usr");
        paths.add_include("/usr/bin/ls", false);

        // including /usr/bin/ls removes /usr from the excludes
        assert!(rendered(&paths).is_empty());
    }

    #[test]
    fn test_include_then_exclude_above_is_ignored() {
        let mut paths = ExcludePaths::new();
        paths.add_include("/usr/bin/ls", false);
        paths.add_exclude("/usr");
        paths.add_exclude("/usr/bin");

        assert!(rendered(&paths).is_empty());
    }

    #[test]
    fn test_unrelated_excludes_survive() {
        let mut paths = ExcludePaths::new();
        paths.add_exclude("/var/cache");
        paths.add_exclude("/tmp");
        paths.add_include("/usr/bin/ls", false);

        assert_eq!(rendered(&paths), vec!["/tmp", "/var/cache"]);
    }

    #[test]
    fn test_include_directory_keeps_siblings_excluded() {
        let mut paths = ExcludePaths::new();
        paths.add_exclude("/usr/share");
        paths.add_exclude("/usr/lib");
        paths.add_include("/usr/share", true);

        assert_eq!(rendered(&paths), vec!["/usr/lib"]);
    }

    #[test]
    fn test_render_has_trailing_newline() {
        let mut paths = ExcludePaths::new();
        assert!(paths.is_empty());
        paths.add_exclude("/a");
        assert_eq!(paths.to_string(), "/a\n\n");
    }
}
