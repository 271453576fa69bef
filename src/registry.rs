//! Instrumented host-API registry
//!
//! The fixed set of `(namespace, member)` pairs the agent wraps, with the
//! category and argument shape of each. This table drives installation of
//! the patch table and gives the tamper detector its check set.

use crate::event::{ArgShape, Category};

/// Dispatch style of an instrumented member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Returns when the operation completes
    Sync,
    /// Completion is delivered to a caller-supplied continuation
    Callback,
    /// Returns a pending handle resolved later
    Promise,
}

/// One instrumented host API member
#[derive(Debug, Clone, Copy)]
pub struct ApiSpec {
    pub namespace: &'static str,
    pub member: &'static str,
    pub category: Category,
    pub shape: ArgShape,
    pub kind: Kind,
}

impl ApiSpec {
    /// Stable operation label, `<namespace>.<member>`
    pub fn op(&self) -> String {
        format!("{}.{}", self.namespace, self.member)
    }
}

const fn fs_sync(member: &'static str) -> ApiSpec {
    ApiSpec {
        namespace: "fs",
        member,
        category: Category::Fs,
        shape: ArgShape::FsPath,
        kind: Kind::Sync,
    }
}

const fn fs_cb(member: &'static str) -> ApiSpec {
    ApiSpec {
        namespace: "fs",
        member,
        category: Category::Fs,
        shape: ArgShape::FsPath,
        kind: Kind::Callback,
    }
}

const fn fs_promise(member: &'static str) -> ApiSpec {
    ApiSpec {
        namespace: "fs.promises",
        member,
        category: Category::Fs,
        shape: ArgShape::FsPath,
        kind: Kind::Promise,
    }
}

const fn proc(member: &'static str, shape: ArgShape) -> ApiSpec {
    ApiSpec {
        namespace: "child_process",
        member,
        category: Category::Proc,
        shape,
        kind: Kind::Sync,
    }
}

const fn dns(member: &'static str) -> ApiSpec {
    ApiSpec {
        namespace: "dns",
        member,
        category: Category::Dns,
        shape: ArgShape::Dns,
        kind: Kind::Callback,
    }
}

const fn net(namespace: &'static str, member: &'static str, shape: ArgShape) -> ApiSpec {
    ApiSpec {
        namespace,
        member,
        category: Category::Net,
        shape,
        kind: Kind::Sync,
    }
}

/// Every member the agent instruments
pub const ENTRIES: &[ApiSpec] = &[
    // fs, synchronous variants
    fs_sync("readFileSync"),
    fs_sync("writeFileSync"),
    fs_sync("appendFileSync"),
    fs_sync("readdirSync"),
    fs_sync("statSync"),
    fs_sync("lstatSync"),
    fs_sync("readlinkSync"),
    fs_sync("realpathSync"),
    fs_sync("openSync"),
    fs_sync("closeSync"),
    fs_sync("chmodSync"),
    fs_sync("chownSync"),
    fs_sync("unlinkSync"),
    fs_sync("mkdirSync"),
    fs_sync("rmdirSync"),
    fs_sync("rmSync"),
    fs_sync("renameSync"),
    fs_sync("copyFileSync"),
    // fs, callback variants
    fs_cb("readFile"),
    fs_cb("writeFile"),
    fs_cb("appendFile"),
    fs_cb("readdir"),
    fs_cb("stat"),
    fs_cb("lstat"),
    fs_cb("readlink"),
    fs_cb("realpath"),
    fs_cb("open"),
    fs_cb("close"),
    fs_cb("chmod"),
    fs_cb("chown"),
    fs_cb("unlink"),
    fs_cb("mkdir"),
    fs_cb("rmdir"),
    fs_cb("rm"),
    fs_cb("rename"),
    fs_cb("copyFile"),
    // fs, promise-returning variants
    fs_promise("readFile"),
    fs_promise("writeFile"),
    fs_promise("appendFile"),
    fs_promise("readdir"),
    fs_promise("stat"),
    fs_promise("unlink"),
    fs_promise("mkdir"),
    fs_promise("rm"),
    // fs, stream constructors
    fs_sync("createReadStream"),
    fs_sync("createWriteStream"),
    // child_process
    proc("spawn", ArgShape::Spawn),
    proc("spawnSync", ArgShape::Spawn),
    proc("exec", ArgShape::Shell),
    proc("execSync", ArgShape::Shell),
    proc("execFile", ArgShape::Spawn),
    proc("execFileSync", ArgShape::Spawn),
    proc("fork", ArgShape::Spawn),
    // dns
    dns("lookup"),
    dns("resolve"),
    dns("resolve4"),
    dns("resolve6"),
    dns("resolveAny"),
    dns("resolveCname"),
    dns("resolveMx"),
    dns("resolveNs"),
    dns("resolvePtr"),
    dns("resolveSrv"),
    dns("resolveTxt"),
    dns("resolveSoa"),
    dns("resolveCaa"),
    dns("resolveNaptr"),
    // net / http
    net("net", "connect", ArgShape::Net),
    net("net", "createConnection", ArgShape::Net),
    net("http", "request", ArgShape::Http),
    net("http", "get", ArgShape::Http),
    net("https", "request", ArgShape::Http),
    net("https", "get", ArgShape::Http),
];

/// Look up a registry entry
pub fn find(namespace: &str, member: &str) -> Option<&'static ApiSpec> {
    ENTRIES
        .iter()
        .find(|e| e.namespace == namespace && e.member == member)
}
