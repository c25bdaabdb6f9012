//! Ignore rules for workspace synchronization.
//!
//! Combines a fixed set of default rules (VCS metadata, dependency and build
//! output directories, editor state, log files) with the rules of the
//! workspace's own ignore file. Matching follows gitignore semantics via the
//! [`ignore`] crate: a path is ignored when it or any of its parent
//! directories matches.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::normalize_relative_path;

/// Ignore file read from the workspace root when none is configured.
pub const DEFAULT_IGNORE_FILE: &str = ".gitignore";

/// Rules that always apply, before the workspace's own ignore file.
pub const DEFAULT_IGNORE_RULES: &[&str] = &[
    ".git/",
    "node_modules/",
    "dist/",
    "build/",
    ".next/",
    "out/",
    ".cache/",
    ".turbo/",
    ".parcel-cache/",
    ".idea/",
    ".vscode/",
    "**/*.log",
];

/// Errors that can occur while compiling ignore rules.
#[derive(Error, Debug)]
pub enum IgnoreError {
    /// The combined ruleset could not be compiled.
    #[error("failed to build ignore rules: {0}")]
    Build(#[from] ignore::Error),
}

/// Compiled ignore ruleset for one workspace.
#[derive(Debug, Clone)]
pub struct IgnoreMatcher {
    gitignore: Gitignore,
}

impl IgnoreMatcher {
    /// Builds a matcher from the default rules plus `<workspace>/.gitignore`.
    ///
    /// A missing ignore file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the combined ruleset cannot be compiled.
    pub fn build(workspace_path: &Path) -> Result<Self, IgnoreError> {
        Self::build_with_file(workspace_path, DEFAULT_IGNORE_FILE)
    }

    /// Builds a matcher from the default rules plus the named ignore file
    /// inside `workspace_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the combined ruleset cannot be compiled.
    pub fn build_with_file(workspace_path: &Path, file_name: &str) -> Result<Self, IgnoreError> {
        let ignore_path = workspace_path.join(file_name);
        let file_rules = read_ignore_file(&ignore_path);

        let lines = DEFAULT_IGNORE_RULES
            .iter()
            .copied()
            .chain(file_rules.iter().map(String::as_str));

        let matcher = Self::from_lines(workspace_path, lines)?;

        debug!(
            workspace = %workspace_path.display(),
            ignore_file = %ignore_path.display(),
            file_rules = file_rules.len(),
            "Built ignore matcher"
        );

        Ok(matcher)
    }

    /// Builds a matcher from explicit gitignore-style lines.
    ///
    /// Lines that fail to parse are logged and skipped. Blank lines and
    /// comments are accepted and have no effect.
    ///
    /// # Errors
    ///
    /// Returns an error if the accepted lines cannot be compiled together.
    pub fn from_lines<'a, I>(root: &Path, lines: I) -> Result<Self, IgnoreError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut builder = GitignoreBuilder::new(root);

        for line in lines {
            if let Err(e) = builder.add_line(None::<PathBuf>, line) {
                warn!(rule = line, error = %e, "Skipping invalid ignore rule");
            }
        }

        Ok(Self {
            gitignore: builder.build()?,
        })
    }

    /// Returns true if `relative_path` should not be synchronized.
    ///
    /// Backslashes are treated as separators. A trailing `/` marks the path
    /// as a directory, so `"dist/"` matches a `dist/` rule while `"dist"`
    /// (a plain file named `dist`) does not.
    #[must_use]
    pub fn ignores(&self, relative_path: &str) -> bool {
        let normalized = normalize_relative_path(relative_path);
        let is_dir = normalized.ends_with('/');
        let trimmed = normalized.trim_start_matches("./").trim_end_matches('/');

        if trimmed.is_empty() {
            return false;
        }

        let mut path = Path::new(trimmed);
        if path.has_root() {
            // Absolute paths only match when they lie under the workspace
            match path.strip_prefix(self.gitignore.path()) {
                Ok(relative) if !relative.as_os_str().is_empty() => path = relative,
                _ => return false,
            }
        }

        self.gitignore
            .matched_path_or_any_parents(path, is_dir)
            .is_ignore()
    }

    /// Number of ignore (non-negated) rules in the compiled set.
    #[must_use]
    pub fn rule_count(&self) -> u64 {
        self.gitignore.num_ignores()
    }
}

/// Reads the rules of an ignore file, returning none if it does not exist.
fn read_ignore_file(path: &Path) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(content) => content.lines().map(str::to_string).collect(),
        Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read ignore file, using defaults only");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn defaults_only() -> IgnoreMatcher {
        IgnoreMatcher::from_lines(Path::new("/workspace"), DEFAULT_IGNORE_RULES.iter().copied())
            .unwrap()
    }

    #[test]
    fn default_directories_are_ignored_recursively() {
        let matcher = defaults_only();

        assert!(matcher.ignores(".git/HEAD"));
        assert!(matcher.ignores("node_modules/react/index.js"));
        assert!(matcher.ignores("packages/web/node_modules/a.js"));
        assert!(matcher.ignores("dist/bundle.js"));
        assert!(matcher.ignores(".next/cache/x"));
        assert!(matcher.ignores(".vscode/settings.json"));
    }

    #[test]
    fn absolute_paths_resolved_against_root() {
        let matcher = defaults_only();

        assert!(matcher.ignores("/workspace/node_modules/a.js"));
        assert!(!matcher.ignores("/workspace/src/a.js"));
        assert!(!matcher.ignores("/elsewhere/node_modules/a.js"));
        assert!(!matcher.ignores("/workspace"));
    }

    #[test]
    fn log_files_ignored_at_any_depth() {
        let matcher = defaults_only();

        assert!(matcher.ignores("debug.log"));
        assert!(matcher.ignores("logs/deep/server.log"));
        assert!(!matcher.ignores("logs/deep/server.txt"));
    }

    #[test]
    fn regular_sources_not_ignored() {
        let matcher = defaults_only();

        assert!(!matcher.ignores("src/main.rs"));
        assert!(!matcher.ignores("README.md"));
        assert!(!matcher.ignores("distribution/notes.md"));
    }

    #[test]
    fn backslashes_normalized() {
        let matcher = defaults_only();

        assert!(matcher.ignores(r"node_modules\pkg\index.js"));
        assert!(!matcher.ignores(r"src\lib.rs"));
    }

    #[test]
    fn trailing_slash_marks_directory() {
        let matcher = defaults_only();

        assert!(matcher.ignores("build/"));
        assert!(!matcher.ignores("build"));
    }

    #[test]
    fn empty_path_never_ignored() {
        let matcher = defaults_only();
        assert!(!matcher.ignores(""));
        assert!(!matcher.ignores("./"));
    }

    #[test]
    fn workspace_ignore_file_rules_apply() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(".gitignore"),
            "# secrets\n.env\ncoverage/\n*.tmp\n",
        )
        .unwrap();

        let matcher = IgnoreMatcher::build(dir.path()).unwrap();

        assert!(matcher.ignores(".env"));
        assert!(matcher.ignores("coverage/lcov.info"));
        assert!(matcher.ignores("a/b/c.tmp"));
        assert!(matcher.ignores("node_modules/x.js"));
        assert!(!matcher.ignores(".env.example"));
    }

    #[test]
    fn negation_in_ignore_file_reincludes() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".gitignore"), "*.md\n!README.md\n").unwrap();

        let matcher = IgnoreMatcher::build(dir.path()).unwrap();

        assert!(matcher.ignores("notes.md"));
        assert!(!matcher.ignores("README.md"));
    }

    #[test]
    fn missing_ignore_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let matcher = IgnoreMatcher::build(dir.path()).unwrap();

        assert_eq!(matcher.rule_count(), DEFAULT_IGNORE_RULES.len() as u64);
        assert!(matcher.ignores(".git/config"));
        assert!(!matcher.ignores("index.ts"));
    }

    #[test]
    fn custom_ignore_file_name() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".syncignore"), "secret.txt\n").unwrap();
        fs::write(dir.path().join(".gitignore"), "other.txt\n").unwrap();

        let matcher = IgnoreMatcher::build_with_file(dir.path(), ".syncignore").unwrap();

        assert!(matcher.ignores("secret.txt"));
        assert!(!matcher.ignores("other.txt"));
    }

    #[test]
    fn invalid_rule_skipped() {
        let matcher =
            IgnoreMatcher::from_lines(Path::new("/w"), ["[unclosed", "*.bak"]).unwrap();

        assert!(matcher.ignores("file.bak"));
        assert!(!matcher.ignores("file.txt"));
    }
}
