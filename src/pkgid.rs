//! Package identity derivation
//!
//! A package identity is either a real package name taken from a
//! `node_modules` path segment (scoped names keep their `@scope/` prefix),
//! a package-manager sentinel, or `<unknown>`.

/// Identity used when no package can be attributed
pub const UNKNOWN: &str = "<unknown>";
/// Identity for this tool's own activity
pub const SELF: &str = "<malwatch>";
/// Sentinel for npm and its internals
pub const PM_NPM: &str = "<pm:npm>";
/// Sentinel for pnpm and its internals
pub const PM_PNPM: &str = "<pm:pnpm>";

/// Extract a package name from a filesystem path.
///
/// For `…/node_modules/X/…` the identity is `X`, or `@scope/X` when the
/// segment after `node_modules` begins with `@scope`. The innermost
/// (last) `node_modules` segment wins, so nested installs and
/// content-addressed stores resolve to the package actually executing.
pub fn from_path(path: &str) -> Option<String> {
    let idx = path.rfind("node_modules/")?;
    let rest = &path[idx + "node_modules/".len()..];
    let mut segments = rest.split('/').filter(|s| !s.is_empty());
    let first = segments.next()?;
    if first.starts_with('.') {
        // .bin shims and .pnpm store entries carry no usable name here
        return None;
    }
    if first.starts_with('@') {
        let second = segments.next()?;
        if second.is_empty() || second.starts_with('.') {
            return None;
        }
        Some(format!("{}/{}", first, second))
    } else {
        Some(first.to_string())
    }
}

/// Collapse package-manager internals to their sentinel identity
pub fn collapse_pm(name: &str) -> String {
    if is_npm(name) {
        PM_NPM.to_string()
    } else if is_pnpm(name) {
        PM_PNPM.to_string()
    } else {
        name.to_string()
    }
}

fn is_npm(name: &str) -> bool {
    name == "npm" || name.starts_with("@npmcli/")
}

fn is_pnpm(name: &str) -> bool {
    name == "pnpm" || name.starts_with("@pnpm/")
}

/// True for names that belong to the package manager itself
pub fn is_pm(name: &str) -> bool {
    is_npm(name) || is_pnpm(name) || name.starts_with("<pm:")
}

/// True for the reserved non-package identities
pub fn is_sentinel(name: &str) -> bool {
    name.starts_with('<') && name.ends_with('>')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_package_from_path() {
        assert_eq!(
            from_path("/app/node_modules/lodash/index.js").as_deref(),
            Some("lodash")
        );
    }

    #[test]
    fn test_scoped_package_from_path() {
        assert_eq!(
            from_path("/app/node_modules/@babel/core/lib/index.js").as_deref(),
            Some("@babel/core")
        );
    }

    #[test]
    fn test_innermost_node_modules_wins() {
        assert_eq!(
            from_path("/app/node_modules/a/node_modules/b/x.js").as_deref(),
            Some("b")
        );
    }

    #[test]
    fn test_pnpm_store_path_resolves_inner_package() {
        let p = "/app/node_modules/.pnpm/a@1.0.0/node_modules/a/index.js";
        assert_eq!(from_path(p).as_deref(), Some("a"));
    }

    #[test]
    fn test_dot_segments_rejected() {
        assert_eq!(from_path("/app/node_modules/.bin/tsc"), None);
        assert_eq!(from_path("/app/node_modules/.pnpm/lockfile"), None);
    }

    #[test]
    fn test_no_node_modules_segment() {
        assert_eq!(from_path("/usr/lib/node/internal.js"), None);
    }

    #[test]
    fn test_bare_scope_without_name_rejected() {
        assert_eq!(from_path("/app/node_modules/@scope"), None);
    }

    #[test]
    fn test_collapse_npm_and_internals() {
        assert_eq!(collapse_pm("npm"), PM_NPM);
        assert_eq!(collapse_pm("@npmcli/arborist"), PM_NPM);
    }

    #[test]
    fn test_collapse_pnpm_and_internals() {
        assert_eq!(collapse_pm("pnpm"), PM_PNPM);
        assert_eq!(collapse_pm("@pnpm/core"), PM_PNPM);
    }

    #[test]
    fn test_collapse_leaves_regular_names() {
        assert_eq!(collapse_pm("left-pad"), "left-pad");
        assert_eq!(collapse_pm("@babel/core"), "@babel/core");
    }

    #[test]
    fn test_is_pm_covers_sentinels() {
        assert!(is_pm("npm"));
        assert!(is_pm("@pnpm/fetch"));
        assert!(is_pm(PM_NPM));
        assert!(!is_pm("express"));
    }

    #[test]
    fn test_is_sentinel() {
        assert!(is_sentinel(UNKNOWN));
        assert!(is_sentinel(SELF));
        assert!(!is_sentinel("lodash"));
    }
}
