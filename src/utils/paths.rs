//! Model file listing and resolution restricted to accepted extensions.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

/// Search roots plus the extensions a model file may have.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    roots: Vec<PathBuf>,
    extensions: Vec<String>,
}

impl ModelPaths {
    pub fn new(roots: Vec<PathBuf>, extensions: Vec<String>) -> Self {
        let extensions = extensions
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();
        Self { roots, extensions }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Whether `path` has one of the accepted extensions
    pub fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
    }

    /// Accepted files under every root, as sorted `/`-separated relative names
    pub fn list_filenames(&self) -> Vec<String> {
        let mut names = BTreeSet::new();

        for root in &self.roots {
            if !root.is_dir() {
                tracing::debug!("Skipping missing model directory {:?}", root);
                continue;
            }
            for entry in WalkDir::new(root).follow_links(true).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() || !self.accepts(entry.path()) {
                    continue;
                }
                if let Ok(relative) = entry.path().strip_prefix(root) {
                    let name: Vec<_> = relative.components().map(|c| c.as_os_str().to_string_lossy()).collect();
                    names.insert(name.join("/"));
                }
            }
        }

        names.into_iter().collect()
    }

    /// Resolve a listed name to a file in the first root that has it
    pub fn full_path(&self, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        if !self.accepts(relative) || !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return None;
        }

        self.roots
            .iter()
            .map(|root| root.join(relative))
            .find(|candidate| candidate.is_file())
    }
}
