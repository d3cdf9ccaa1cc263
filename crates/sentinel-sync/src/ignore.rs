//! Ignore pattern matching.
//!
//! Three pattern forms, checked against both the basename and the path
//! relative to the watch root:
//!
//! - basename glob: `*.tmp`
//! - relative-path glob: `src/temp/*`
//! - directory suffix `X/`: matches the directory itself, anything under
//!   `X/` at the root, and any path with `/X/` as a component
//!
//! Emacs auto-save names (`#…#`) are always ignored. The built-in default
//! set applies in addition to user-configured patterns. Classification is
//! pure: same inputs, same answer.

use std::path::Path;

/// Patterns applied regardless of configuration.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    // Version control
    ".git/",
    ".svn/",
    ".hg/",
    // Package managers
    "node_modules/",
    "__pycache__/",
    ".venv/",
    "venv/",
    // Build artifacts
    ".pio/",
    "build/",
    "dist/",
    "target/",
    ".cache/",
    // IDE
    ".idea/",
    ".vscode/",
    // Temp files
    "*.swp",
    "*.tmp",
    "*~",
];

/// Glob match supporting `*`, `?` and `[...]` character classes.
///
/// `*` does not stop at path separators; patterns that care about
/// structure match against the relative path as a whole.
#[must_use]
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    match_at(&pattern, &text)
}

fn match_at(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            // Try every possible span for the star, shortest first.
            for skip in 0..=text.len() {
                if match_at(&pattern[1..], &text[skip..]) {
                    return true;
                }
            }
            false
        }
        Some('?') => !text.is_empty() && match_at(&pattern[1..], &text[1..]),
        Some('[') => {
            let Some(close) = pattern.iter().position(|c| *c == ']') else {
                // Unterminated class: treat '[' literally.
                return !text.is_empty()
                    && text[0] == '['
                    && match_at(&pattern[1..], &text[1..]);
            };
            let Some(&ch) = text.first() else {
                return false;
            };
            let (negate, class) = match pattern.get(1) {
                Some('!') | Some('^') => (true, &pattern[2..close]),
                _ => (false, &pattern[1..close]),
            };
            if class_contains(class, ch) != negate {
                match_at(&pattern[close + 1..], &text[1..])
            } else {
                false
            }
        }
        Some(&expected) => {
            !text.is_empty() && text[0] == expected && match_at(&pattern[1..], &text[1..])
        }
    }
}

fn class_contains(class: &[char], ch: char) -> bool {
    let mut i = 0;
    while i < class.len() {
        if i + 2 < class.len() && class[i + 1] == '-' {
            if class[i] <= ch && ch <= class[i + 2] {
                return true;
            }
            i += 3;
        } else {
            if class[i] == ch {
                return true;
            }
            i += 1;
        }
    }
    false
}

/// A compiled set of ignore patterns.
#[derive(Debug, Clone, Default)]
pub struct IgnoreMatcher {
    user_patterns: Vec<String>,
}

impl IgnoreMatcher {
    /// Build a matcher over the defaults plus `user_patterns`.
    #[must_use]
    pub fn new(user_patterns: Vec<String>) -> Self {
        Self { user_patterns }
    }

    /// Replace the user-configured pattern set.
    pub fn set_user_patterns(&mut self, patterns: Vec<String>) {
        self.user_patterns = patterns;
    }

    /// Whether `path` (absolute) under `root` is ignored.
    #[must_use]
    pub fn should_ignore(&self, root: &Path, path: &Path) -> bool {
        let relative = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        // Emacs auto-save files.
        if basename.len() > 1 && basename.starts_with('#') && basename.ends_with('#') {
            return true;
        }

        DEFAULT_IGNORE_PATTERNS
            .iter()
            .any(|p| matches_pattern(p, &basename, &relative))
            || self
                .user_patterns
                .iter()
                .any(|p| matches_pattern(p, &basename, &relative))
    }
}

fn matches_pattern(pattern: &str, basename: &str, relative: &str) -> bool {
    // Basename and relative-path globs.
    if glob_match(pattern, basename) || glob_match(pattern, relative) {
        return true;
    }

    // Directory-suffix semantics.
    if let Some(dir) = pattern.strip_suffix('/') {
        if basename == dir {
            return true;
        }
        if relative.starts_with(pattern) {
            return true;
        }
        let component = format!("/{dir}/");
        if format!("/{relative}").contains(&component) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn matcher() -> IgnoreMatcher {
        IgnoreMatcher::new(Vec::new())
    }

    fn root() -> PathBuf {
        PathBuf::from("/watch")
    }

    #[test]
    fn test_glob_star() {
        assert!(glob_match("*.tmp", "scratch.tmp"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*~", "notes.txt~"));
        assert!(!glob_match("*.tmp", "scratch.txt"));
        assert!(glob_match("src/*", "src/deep/main.c"));
    }

    #[test]
    fn test_glob_question_mark() {
        assert!(glob_match("?.log", "a.log"));
        assert!(!glob_match("?.log", "ab.log"));
    }

    #[test]
    fn test_glob_classes() {
        assert!(glob_match("[abc].txt", "b.txt"));
        assert!(!glob_match("[abc].txt", "d.txt"));
        assert!(glob_match("[0-9]*.bin", "7chunk.bin"));
        assert!(glob_match("[!x].txt", "y.txt"));
        assert!(!glob_match("[!x].txt", "x.txt"));
    }

    #[test]
    fn test_glob_empty_cases() {
        assert!(glob_match("", ""));
        assert!(!glob_match("", "a"));
        assert!(glob_match("*", ""));
    }

    #[test]
    fn test_default_directory_patterns() {
        let m = matcher();
        assert!(m.should_ignore(&root(), &root().join("node_modules")));
        assert!(m.should_ignore(&root(), &root().join("node_modules/express/index.js")));
        assert!(m.should_ignore(&root(), &root().join("src/node_modules/left-pad/index.js")));
        assert!(m.should_ignore(&root(), &root().join(".git/HEAD")));
        assert!(m.should_ignore(&root(), &root().join("build/out.o")));
    }

    #[test]
    fn test_default_file_patterns() {
        let m = matcher();
        assert!(m.should_ignore(&root(), &root().join("scratch.tmp")));
        assert!(m.should_ignore(&root(), &root().join("src/.main.c.swp")));
        assert!(m.should_ignore(&root(), &root().join("notes.txt~")));
    }

    #[test]
    fn test_emacs_autosave_always_ignored() {
        let m = matcher();
        assert!(m.should_ignore(&root(), &root().join("#main.c#")));
        assert!(m.should_ignore(&root(), &root().join("src/#notes.org#")));
        // A lone '#' is not an auto-save name.
        assert!(!m.should_ignore(&root(), &root().join("#")));
    }

    #[test]
    fn test_regular_sources_not_ignored() {
        let m = matcher();
        assert!(!m.should_ignore(&root(), &root().join("src/main.c")));
        assert!(!m.should_ignore(&root(), &root().join("README.md")));
        assert!(!m.should_ignore(&root(), &root().join("docs/design/notes.md")));
        // Similar names must not trip directory patterns.
        assert!(!m.should_ignore(&root(), &root().join("builder/main.rs")));
        assert!(!m.should_ignore(&root(), &root().join("my-target-notes.txt")));
    }

    #[test]
    fn test_user_patterns() {
        let m = IgnoreMatcher::new(vec!["*.log".into(), "secrets/".into()]);
        assert!(m.should_ignore(&root(), &root().join("debug.log")));
        assert!(m.should_ignore(&root(), &root().join("secrets/key.pem")));
        assert!(m.should_ignore(&root(), &root().join("a/b/secrets/key.pem")));
        assert!(!m.should_ignore(&root(), &root().join("debug.txt")));
    }

    #[test]
    fn test_relative_path_glob() {
        let m = IgnoreMatcher::new(vec!["cache/*".into()]);
        assert!(m.should_ignore(&root(), &root().join("cache/blob1")));
        assert!(!m.should_ignore(&root(), &root().join("src/cache.rs")));
    }

    #[test]
    fn test_classification_is_stable() {
        let m = IgnoreMatcher::new(vec!["*.log".into()]);
        let path = root().join("x/y/debug.log");
        let first = m.should_ignore(&root(), &path);
        for _ in 0..10 {
            assert_eq!(m.should_ignore(&root(), &path), first);
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// should_ignore is a pure function of its inputs.
            #[test]
            fn prop_pure_classification(name in "[a-z0-9._-]{1,12}", dir in "[a-z]{1,8}") {
                let m = IgnoreMatcher::new(vec!["*.tmp".into()]);
                let path = PathBuf::from("/watch").join(&dir).join(&name);
                let a = m.should_ignore(Path::new("/watch"), &path);
                let b = m.should_ignore(Path::new("/watch"), &path);
                prop_assert_eq!(a, b);
            }

            /// Anything ending in .tmp is caught by the default set.
            #[test]
            fn prop_tmp_suffix_ignored(stem in "[a-z0-9]{1,10}") {
                let m = IgnoreMatcher::new(Vec::new());
                let path = PathBuf::from("/watch").join(format!("{stem}.tmp"));
                prop_assert!(m.should_ignore(Path::new("/watch"), &path));
            }
        }
    }
}
