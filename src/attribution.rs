//! Call-site attribution
//!
//! Maps the current call context to a package identity. The primary
//! source is an ambient scope: a thread-local stack of package names
//! pushed around each package entry-point load, so work started inside a
//! package (including continuations it schedules) stays attributed to it.
//! When no scope is active, a captured stack is scanned for the first
//! frame that lives under a `node_modules` path.

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::marker::PhantomData;

use crate::pkgid;

thread_local! {
    static SCOPE: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Pops its scope entry when dropped. Must be dropped on the thread that
/// created it.
pub struct ScopeGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        SCOPE.with(|s| {
            s.borrow_mut().pop();
        });
    }
}

/// Enter an attribution scope for `package`. Continuations spawned while
/// the guard is live should re-enter the same identity on their own
/// thread (see the promise dispatch in `patch`).
pub fn enter_package(package: &str) -> ScopeGuard {
    SCOPE.with(|s| s.borrow_mut().push(package.to_string()));
    ScopeGuard {
        _not_send: PhantomData,
    }
}

/// The innermost active scope identity, if any
pub fn current() -> Option<String> {
    SCOPE.with(|s| s.borrow().last().cloned())
}

/// Resolve the package responsible for the current call. Never fails:
/// falls back to `<unknown>`.
pub fn identify() -> String {
    identify_with_stack().0
}

/// Like [`identify`], additionally returning the captured stack rendering
/// when the frame-scan fallback ran. The stack is already truncated to
/// the record caps.
pub fn identify_with_stack() -> (String, Option<String>) {
    if let Some(pkg) = current() {
        return (pkgid::collapse_pm(&pkg), None);
    }
    let raw = Backtrace::force_capture().to_string();
    let pkg = identify_from_stack(&raw)
        .map(|p| pkgid::collapse_pm(&p))
        .unwrap_or_else(|| pkgid::UNKNOWN.to_string());
    (pkg, Some(truncate_stack(&raw)))
}

/// Scan rendered stack frames top-down for the first attributable one
pub fn identify_from_stack(stack: &str) -> Option<String> {
    for line in stack.lines() {
        if frame_rejected(line) {
            continue;
        }
        if let Some(name) = pkgid::from_path(line) {
            if name == "npm-malwatch" {
                continue;
            }
            return Some(name);
        }
    }
    None
}

/// Frames from the runtime itself or from this tool carry no attribution
fn frame_rejected(line: &str) -> bool {
    let src = line.trim_start();
    let src = src.strip_prefix("at ").unwrap_or(src).trim_start();
    src.starts_with("node:")
        || src.starts_with("internal/")
        || src.starts_with('<')
        || line.contains("npm-malwatch/src")
}

/// Bound a stack rendering to 12 lines and 2000 characters
pub fn truncate_stack(stack: &str) -> String {
    let mut out = String::new();
    for (i, line) in stack.lines().enumerate() {
        if i >= crate::event::MAX_STACK_LINES {
            break;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line);
        if out.len() >= crate::event::MAX_STACK_CHARS {
            break;
        }
    }
    if out.chars().count() > crate::event::MAX_STACK_CHARS {
        out = out.chars().take(crate::event::MAX_STACK_CHARS).collect();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_stack_push_pop() {
        assert_eq!(current(), None);
        {
            let _a = enter_package("a");
            assert_eq!(current().as_deref(), Some("a"));
            {
                let _b = enter_package("b");
                assert_eq!(current().as_deref(), Some("b"));
            }
            assert_eq!(current().as_deref(), Some("a"));
        }
        assert_eq!(current(), None);
    }

    #[test]
    fn test_identify_prefers_scope() {
        let _g = enter_package("left-pad");
        assert_eq!(identify(), "left-pad");
    }

    #[test]
    fn test_identify_collapses_pm_scope() {
        let _g = enter_package("@npmcli/arborist");
        assert_eq!(identify(), pkgid::PM_NPM);
    }

    #[test]
    fn test_identify_without_scope_is_unknown() {
        // no node_modules frames exist in this test binary's backtrace
        assert_eq!(identify(), pkgid::UNKNOWN);
    }

    #[test]
    fn test_stack_scan_finds_first_package_frame() {
        let stack = "\
    at run (node:internal/modules/cjs/loader:1105:14)\n\
    at handler (/app/node_modules/evil-pkg/lib/run.js:10:3)\n\
    at main (/app/node_modules/express/index.js:5:1)";
        assert_eq!(identify_from_stack(stack).as_deref(), Some("evil-pkg"));
    }

    #[test]
    fn test_stack_scan_rejects_runtime_frames() {
        let stack = "\
    at node:fs:100:1\n\
    at internal/bootstrap:3:2\n\
    at <anonymous>";
        assert_eq!(identify_from_stack(stack), None);
    }

    #[test]
    fn test_stack_scan_skips_own_frames() {
        let stack = "    at wrap (/opt/npm-malwatch/src/patch.rs:1:1)\n\
    at caller (/app/node_modules/chalk/index.js:2:2)";
        assert_eq!(identify_from_stack(stack).as_deref(), Some("chalk"));
    }

    #[test]
    fn test_stack_scan_scoped_package() {
        let stack = "    at f (/app/node_modules/@scope/pkg/dist/i.js:1:1)";
        assert_eq!(identify_from_stack(stack).as_deref(), Some("@scope/pkg"));
    }

    #[test]
    fn test_truncate_stack_line_cap() {
        let stack = (0..40).map(|i| format!("line{i}")).collect::<Vec<_>>().join("\n");
        let out = truncate_stack(&stack);
        assert_eq!(out.lines().count(), crate::event::MAX_STACK_LINES);
    }

    #[test]
    fn test_truncate_stack_char_cap() {
        let stack = "x".repeat(5000);
        let out = truncate_stack(&stack);
        assert!(out.chars().count() <= crate::event::MAX_STACK_CHARS);
    }
}
