use globset::{Glob, GlobSet, GlobSetBuilder};

use waypoint_types::WaypointError;

/// Compile a list of glob patterns into one set.
pub fn build_glob_set(patterns: &[String]) -> waypoint_types::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| WaypointError::InvalidPattern {
            pattern_id: pattern.clone(),
            message: e.to_string(),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| WaypointError::InvalidPattern {
        pattern_id: patterns.join(","),
        message: e.to_string(),
    })
}

/// Include/exclude glob pair applied to root-relative paths.
#[derive(Debug, Clone)]
pub struct GlobFilter {
    include: GlobSet,
    exclude: GlobSet,
    include_all: bool,
}

impl GlobFilter {
    /// An empty include list accepts every path.
    pub fn new(include: &[String], exclude: &[String]) -> waypoint_types::Result<Self> {
        Ok(Self {
            include: build_glob_set(include)?,
            exclude: build_glob_set(exclude)?,
            include_all: include.is_empty(),
        })
    }

    pub fn is_match(&self, path: &str) -> bool {
        (self.include_all || self.include.is_match(path)) && !self.exclude.is_match(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn include_and_exclude() {
        let filter = GlobFilter::new(
            &strings(&["**/*.al"]),
            &strings(&["**/.alpackages/**"]),
        )
        .unwrap();
        assert!(filter.is_match("src/Sales.Codeunit.al"));
        assert!(filter.is_match("Top.al"));
        assert!(!filter.is_match(".alpackages/Base.al"));
        assert!(!filter.is_match("src/readme.md"));
    }

    #[test]
    fn empty_include_accepts_everything() {
        let filter = GlobFilter::new(&[], &strings(&["*.lock"])).unwrap();
        assert!(filter.is_match("a/b/c.txt"));
        assert!(!filter.is_match("Cargo.lock"));
    }

    #[test]
    fn invalid_glob_is_reported() {
        let err = GlobFilter::new(&strings(&["src/[unclosed"]), &[]).unwrap_err();
        match err {
            WaypointError::InvalidPattern { pattern_id, .. } => {
                assert_eq!(pattern_id, "src/[unclosed");
            }
            other => panic!("Expected InvalidPattern, got: {other:?}"),
        }
    }
}
