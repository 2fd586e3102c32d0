//! Exclude rules for the file part of a backup.
//!
//! A raw specification like `"*.log, cache, /var/www/site/tmp"` is split on
//! commas into a set of rules. Rules containing a wildcard are matched as
//! globs; every other rule excludes the path it names and everything below
//! it. A rule is *valid* when it contains a wildcard or names something that
//! exists; invalid rules are only reported and still take part in matching.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::warn;

const WILDCARDS: &[char] = &['*', '?'];
const SEPARATORS: &[char] = &['/', '\\'];

/// Split a raw specification into its distinct, trimmed rules
pub fn parse(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|rule| !rule.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn is_wildcard(rule: &str) -> bool {
    rule.contains(WILDCARDS)
}

/// Rules split by whether they look usable
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classified {
    pub valid: Vec<String>,
    pub invalid: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExcludeRules {
    content_root: PathBuf,
    rules: BTreeSet<String>,
    globs: GlobSet,
    literals: Vec<PathBuf>,
}

impl ExcludeRules {
    pub fn new(raw: &str, content_root: &Path) -> Self {
        let rules = parse(raw);

        let mut builder = GlobSetBuilder::new();
        let mut literals = Vec::new();
        for rule in &rules {
            if is_wildcard(rule) {
                match GlobBuilder::new(rule).literal_separator(false).build() {
                    Ok(glob) => {
                        builder.add(glob);
                    }
                    Err(e) => warn!(%rule, error = %e, "skipping unparsable exclude glob"),
                }
            } else {
                literals.extend(literal_candidates(rule, content_root));
            }
        }

        let globs = builder.build().unwrap_or_else(|e| {
            warn!(error = %e, "could not compile exclude globs");
            GlobSet::empty()
        });

        ExcludeRules {
            content_root: content_root.to_path_buf(),
            rules,
            globs,
            literals,
        }
    }

    pub fn rules(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Partition rules into valid and invalid; the two lists are disjoint
    /// and together hold every rule
    pub fn classify(&self) -> Classified {
        let mut classified = Classified::default();
        for rule in &self.rules {
            if is_valid(rule, &self.content_root) {
                classified.valid.push(rule.clone());
            } else {
                classified.invalid.push(rule.clone());
            }
        }
        classified
    }

    /// True when any rule matches the path
    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.rules.is_empty() {
            return false;
        }

        if self.literals.iter().any(|literal| path.starts_with(literal)) {
            return true;
        }

        if self.globs.is_match(path) {
            return true;
        }

        match path.strip_prefix(&self.content_root) {
            Ok(relative) if !relative.as_os_str().is_empty() => self.globs.is_match(relative),
            _ => false,
        }
    }
}

/// A rule is valid if it is a wildcard or resolves to an existing path as
/// given, under the content root, or under the content root with a
/// separator inserted
fn is_valid(rule: &str, content_root: &Path) -> bool {
    if is_wildcard(rule) {
        return true;
    }

    let joined = format!("{}{}", content_root.display(), rule);
    let separated = content_root.join(rule.trim_start_matches(SEPARATORS));

    Path::new(rule).exists() || Path::new(&joined).exists() || separated.exists()
}

/// Paths a non-wildcard rule can refer to
fn literal_candidates(rule: &str, content_root: &Path) -> Vec<PathBuf> {
    let trimmed = rule.trim_end_matches(SEPARATORS);
    let mut candidates = Vec::new();

    let as_given = Path::new(trimmed);
    if as_given.is_absolute() {
        candidates.push(as_given.to_path_buf());
    }

    let relative = trimmed.trim_start_matches(SEPARATORS);
    if !relative.is_empty() {
        candidates.push(content_root.join(relative));
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_parse_trims_and_dedupes() {
        let rules = parse(" *.log ,cache,, cache ,  ");
        assert_eq!(
            rules.into_iter().collect::<Vec<_>>(),
            vec!["*.log".to_string(), "cache".to_string()]
        );
        assert!(parse("").is_empty());
        assert!(parse(" , ,").is_empty());
    }

    #[test]
    fn test_classify_wildcard_and_missing_path() {
        let dir = tempdir().unwrap();
        let rules = ExcludeRules::new("*.log, /secret", dir.path());
        let classified = rules.classify();
        assert_eq!(classified.valid, vec!["*.log".to_string()]);
        assert_eq!(classified.invalid, vec!["/secret".to_string()]);
    }

    #[test]
    fn test_classify_relative_and_absolute_paths() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("uploads").join("cache")).unwrap();
        let outside = tempdir().unwrap();

        let raw = format!(
            "uploads/cache, /uploads, {}, nope",
            outside.path().display()
        );
        let classified = ExcludeRules::new(&raw, dir.path()).classify();

        assert!(classified.valid.contains(&"uploads/cache".to_string()));
        assert!(classified.valid.contains(&"/uploads".to_string()));
        assert!(classified
            .valid
            .contains(&outside.path().display().to_string()));
        assert_eq!(classified.invalid, vec!["nope".to_string()]);
    }

    #[test]
    fn test_classify_partition_is_exhaustive_and_disjoint() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("present")).unwrap();
        let rules = ExcludeRules::new("a*, present, absent, b?, gone/too", dir.path());
        let classified = rules.classify();

        assert_eq!(
            classified.valid.len() + classified.invalid.len(),
            rules.rules().count()
        );
        for rule in &classified.valid {
            assert!(!classified.invalid.contains(rule));
            assert!(is_wildcard(rule) || dir.path().join(rule).exists());
        }
        for rule in &classified.invalid {
            assert!(!is_wildcard(rule));
            assert!(!dir.path().join(rule).exists());
        }
    }

    #[test]
    fn test_wildcard_matching() {
        let root = Path::new("/var/www/site");
        let rules = ExcludeRules::new("*.log, cache/*", root);

        assert!(rules.is_excluded(&root.join("debug.log")));
        assert!(rules.is_excluded(&root.join("a/b/error.log")));
        assert!(rules.is_excluded(&root.join("cache/page/index.html")));
        assert!(!rules.is_excluded(&root.join("index.php")));
        assert!(!rules.is_excluded(&root.join("logs")));
    }

    #[test]
    fn test_literal_matching_is_prefix_containment() {
        let root = Path::new("/var/www/site");
        let rules = ExcludeRules::new("uploads/cache, /tmp-data/", root);

        assert!(rules.is_excluded(&root.join("uploads/cache")));
        assert!(rules.is_excluded(&root.join("uploads/cache/a/b.jpg")));
        assert!(rules.is_excluded(&root.join("tmp-data/x")));
        assert!(!rules.is_excluded(&root.join("uploads/cached.jpg")));
        assert!(!rules.is_excluded(&root.join("uploads")));
    }

    #[test]
    fn test_invalid_rules_still_match() {
        let root = Path::new("/nonexistent/site");
        let rules = ExcludeRules::new("private", root);
        assert_eq!(rules.classify().invalid, vec!["private".to_string()]);
        assert!(rules.is_excluded(&root.join("private/key.pem")));
    }

    #[test]
    fn test_empty_rules_exclude_nothing() {
        let rules = ExcludeRules::new("", Path::new("/var/www"));
        assert!(rules.is_empty());
        assert!(!rules.is_excluded(Path::new("/var/www/anything")));
    }
}
