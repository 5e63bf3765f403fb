//! Result artifact discovery.
//!
//! Patterns are shell-style globs rooted at the job's working directory:
//! `*` and `?` never cross a `/`, `**/` matches any number of directories and
//! `[...]` is a character class.

use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::JobError;

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct ArtifactPattern {
    source: String,
    regex: Regex,
    max_depth: usize,
}

impl ArtifactPattern {
    pub fn new(pattern: &str) -> Result<Self, JobError> {
        let regex = Regex::new(&glob_to_regex(pattern)).map_err(|e| {
            JobError::validation(format!("invalid artifact pattern '{}': {}", pattern, e))
        })?;
        let max_depth = if pattern.contains("**") {
            usize::MAX
        } else {
            pattern.matches('/').count() + 1
        };
        Ok(Self {
            source: pattern.to_string(),
            regex,
            max_depth,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Matches a path relative to the search root, using `/` separators.
    pub fn matches(&self, relative: &str) -> bool {
        self.regex.is_match(relative)
    }

    /// All regular files under `dir` matching this pattern, sorted.
    pub fn find(&self, dir: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for entry in WalkDir::new(dir)
            .min_depth(1)
            .max_depth(self.max_depth)
            .follow_links(true)
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry under {}: {}", dir.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(dir) else {
                continue;
            };
            let relative = relative.to_string_lossy().replace('\\', "/");
            if self.matches(&relative) {
                found.push(entry.into_path());
            }
        }
        found.sort();
        found
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => match chars[i + 1..].iter().position(|&c| c == ']') {
                Some(len) => {
                    let class: String = chars[i + 1..i + 1 + len].iter().collect();
                    let class = match class.strip_prefix('!') {
                        Some(rest) => format!("^{}", rest),
                        None => class,
                    };
                    out.push('[');
                    out.push_str(&class.replace('\\', "\\\\"));
                    out.push(']');
                    i += len + 2;
                    continue;
                }
                None => out.push_str(r"\["),
            },
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push('$');
    out
}

/// Resolves every pattern; each one must match at least one file.
pub fn discover_artifacts(dir: &Path, patterns: &[String]) -> Result<Vec<PathBuf>, JobError> {
    let mut artifacts = Vec::new();
    for pattern in patterns {
        let compiled = ArtifactPattern::new(pattern)?;
        let found = compiled.find(dir);
        if found.is_empty() {
            return Err(JobError::MissingArtifact {
                pattern: pattern.clone(),
                dir: dir.to_path_buf(),
            });
        }
        debug!(pattern = %pattern, count = found.len(), "Discovered artifacts");
        for path in found {
            if !artifacts.contains(&path) {
                artifacts.push(path);
            }
        }
    }
    Ok(artifacts)
}

/// Removes files matching any of `patterns`, returning the removed paths.
pub fn clear_matching(dir: &Path, patterns: &[String]) -> Result<Vec<PathBuf>, JobError> {
    let mut removed = Vec::new();
    if !dir.is_dir() {
        return Ok(removed);
    }
    for pattern in patterns {
        for path in ArtifactPattern::new(pattern)?.find(dir) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed.push(path),
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_glob_translation() {
        let p = ArtifactPattern::new("S*_pynx_norm_*.npz").unwrap();
        assert!(p.matches("S12_pynx_norm_run3.npz"));
        assert!(!p.matches("S12_pynx_mask_run3.npz"));
        assert!(!p.matches("sub/S12_pynx_norm_run3.npz"));

        let p = ArtifactPattern::new("*Run?[0-9].cxi").unwrap();
        assert!(p.matches("2024_Run01.cxi"));
        assert!(!p.matches("2024_Run0x.cxi"));

        let p = ArtifactPattern::new("**/*.cxi").unwrap();
        assert!(p.matches("a.cxi"));
        assert!(p.matches("modes/run/a.cxi"));
    }

    #[test]
    fn test_discover_single_match() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "S12_pynx_norm_run3.npz");
        touch(dir.path(), "S12_pynx_mask_run3.npz");

        let found =
            discover_artifacts(dir.path(), &["S*_pynx_norm_*.npz".to_string()]).unwrap();
        assert_eq!(found, vec![dir.path().join("S12_pynx_norm_run3.npz")]);
    }

    #[test]
    fn test_discover_missing() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "notes.txt");

        let err = discover_artifacts(dir.path(), &["S*_pynx_norm_*.npz".to_string()])
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::MissingArtifact);
    }

    #[test]
    fn test_clear_matching() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "S12_Run0001.cxi");
        touch(dir.path(), "S12_Run0001.png");
        touch(dir.path(), "pynx-cdi-inputs.txt");

        let removed = clear_matching(
            dir.path(),
            &["*Run*.cxi".to_string(), "*Run*.png".to_string()],
        )
        .unwrap();
        assert_eq!(removed.len(), 2);
        assert!(dir.path().join("pynx-cdi-inputs.txt").exists());
        assert!(!dir.path().join("S12_Run0001.cxi").exists());
    }
}
