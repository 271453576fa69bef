//! Original host-API implementations
//!
//! The un-wrapped side of the patch table: each registry member maps to a
//! real operation over `std` (file I/O, `std::process::Command`, DNS via
//! `ToSocketAddrs`, TCP via `TcpStream`). Arguments and results travel as
//! JSON values so one dispatch signature covers the whole table.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};

use crate::event::ErrorInfo;
use crate::registry::ApiSpec;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure of an original host operation
#[derive(Debug, Clone)]
pub struct HostError {
    pub name: String,
    pub message: String,
}

impl HostError {
    pub fn new(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo::new(&self.name, &self.message)
    }
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl From<std::io::Error> for HostError {
    fn from(err: std::io::Error) -> Self {
        Self::new("Error", err.to_string())
    }
}

pub type HostResult = Result<Value, HostError>;

// Open files are handed back as opaque descriptor numbers; closeSync
// drops the backing handle.
static OPEN_FILES: Mutex<Option<HashMap<u64, File>>> = Mutex::new(None);
static NEXT_FD: AtomicU64 = AtomicU64::new(3);

fn stash_file(file: File) -> u64 {
    let fd = NEXT_FD.fetch_add(1, Ordering::SeqCst);
    let mut guard = OPEN_FILES.lock().unwrap_or_else(|e| e.into_inner());
    guard.get_or_insert_with(HashMap::new).insert(fd, file);
    fd
}

fn take_file(fd: u64) -> Option<File> {
    let mut guard = OPEN_FILES.lock().unwrap_or_else(|e| e.into_inner());
    guard.as_mut()?.remove(&fd)
}

fn arg_str(args: &[Value], idx: usize, what: &str) -> Result<String, HostError> {
    args.get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| HostError::type_error(format!("argument {idx} must be a {what}")))
}

fn arg_u64(args: &[Value], idx: usize) -> Result<u64, HostError> {
    args.get(idx)
        .and_then(Value::as_u64)
        .ok_or_else(|| HostError::type_error(format!("argument {idx} must be a number")))
}

fn arg_argv(args: &[Value], idx: usize) -> Vec<String> {
    args.get(idx)
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Dispatch one registry member to its original implementation
pub fn invoke(spec: &ApiSpec, args: &[Value]) -> HostResult {
    match spec.namespace {
        "fs" | "fs.promises" => invoke_fs(fs_base(spec.member), args),
        "child_process" => invoke_proc(spec.member, args),
        "dns" => invoke_dns(args),
        "net" => invoke_net(args),
        "http" => invoke_http(args, 80, true),
        "https" => invoke_http(args, 443, false),
        other => Err(HostError::type_error(format!("unknown namespace {other}"))),
    }
}

fn fs_base(member: &str) -> &str {
    member.strip_suffix("Sync").unwrap_or(member)
}

fn invoke_fs(base: &str, args: &[Value]) -> HostResult {
    match base {
        "readFile" => {
            let path = arg_str(args, 0, "path")?;
            let bytes = fs::read(&path)?;
            Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        }
        "writeFile" => {
            let path = arg_str(args, 0, "path")?;
            let data = args.get(1).map(payload_bytes).unwrap_or_default();
            fs::write(&path, data)?;
            Ok(Value::Null)
        }
        "appendFile" => {
            let path = arg_str(args, 0, "path")?;
            let data = args.get(1).map(payload_bytes).unwrap_or_default();
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(&data)?;
            Ok(Value::Null)
        }
        "readdir" => {
            let path = arg_str(args, 0, "path")?;
            let mut names = Vec::new();
            for entry in fs::read_dir(&path)? {
                names.push(Value::String(
                    entry?.file_name().to_string_lossy().into_owned(),
                ));
            }
            Ok(Value::Array(names))
        }
        "stat" | "lstat" => {
            let path = arg_str(args, 0, "path")?;
            let meta = if base == "stat" {
                fs::metadata(&path)?
            } else {
                fs::symlink_metadata(&path)?
            };
            Ok(json!({
                "size": meta.len(),
                "mode": meta.mode(),
                "isFile": meta.is_file(),
                "isDirectory": meta.is_dir(),
            }))
        }
        "readlink" => {
            let path = arg_str(args, 0, "path")?;
            let target = fs::read_link(&path)?;
            Ok(Value::String(target.to_string_lossy().into_owned()))
        }
        "realpath" => {
            let path = arg_str(args, 0, "path")?;
            let real = fs::canonicalize(&path)?;
            Ok(Value::String(real.to_string_lossy().into_owned()))
        }
        "open" => {
            let path = arg_str(args, 0, "path")?;
            let flags = args.get(1).and_then(Value::as_str).unwrap_or("r");
            let file = open_with_flags(&path, flags)?;
            Ok(json!(stash_file(file)))
        }
        "close" => {
            let fd = arg_u64(args, 0)?;
            take_file(fd).ok_or_else(|| HostError::new("Error", format!("EBADF: bad descriptor {fd}")))?;
            Ok(Value::Null)
        }
        "chmod" => {
            let path = arg_str(args, 0, "path")?;
            let mode = arg_u64(args, 1)? as u32;
            fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
            Ok(Value::Null)
        }
        "chown" => {
            let path = arg_str(args, 0, "path")?;
            let uid = arg_u64(args, 1)? as u32;
            let gid = arg_u64(args, 2)? as u32;
            std::os::unix::fs::chown(Path::new(&path), Some(uid), Some(gid))?;
            Ok(Value::Null)
        }
        "unlink" => {
            let path = arg_str(args, 0, "path")?;
            fs::remove_file(&path)?;
            Ok(Value::Null)
        }
        "mkdir" => {
            let path = arg_str(args, 0, "path")?;
            let recursive = args
                .get(1)
                .and_then(|o| o.get("recursive"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if recursive {
                fs::create_dir_all(&path)?;
            } else {
                fs::create_dir(&path)?;
            }
            Ok(Value::Null)
        }
        "rmdir" => {
            let path = arg_str(args, 0, "path")?;
            fs::remove_dir(&path)?;
            Ok(Value::Null)
        }
        "rm" => {
            let path = arg_str(args, 0, "path")?;
            let meta = fs::symlink_metadata(&path)?;
            if meta.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
            Ok(Value::Null)
        }
        "rename" => {
            let from = arg_str(args, 0, "path")?;
            let to = arg_str(args, 1, "path")?;
            fs::rename(&from, &to)?;
            Ok(Value::Null)
        }
        "copyFile" => {
            let from = arg_str(args, 0, "path")?;
            let to = arg_str(args, 1, "path")?;
            fs::copy(&from, &to)?;
            Ok(Value::Null)
        }
        "createReadStream" => {
            let path = arg_str(args, 0, "path")?;
            let file = File::open(&path)?;
            Ok(json!({ "fd": stash_file(file) }))
        }
        "createWriteStream" => {
            let path = arg_str(args, 0, "path")?;
            let file = OpenOptions::new().create(true).write(true).open(&path)?;
            Ok(json!({ "fd": stash_file(file) }))
        }
        other => Err(HostError::type_error(format!("unknown fs member {other}"))),
    }
}

fn payload_bytes(v: &Value) -> Vec<u8> {
    match v {
        Value::String(s) => s.clone().into_bytes(),
        other => other.to_string().into_bytes(),
    }
}

fn open_with_flags(path: &str, flags: &str) -> Result<File, HostError> {
    let mut opts = OpenOptions::new();
    match flags {
        "r" => opts.read(true),
        "r+" => opts.read(true).write(true),
        "w" => opts.write(true).create(true).truncate(true),
        "w+" => opts.read(true).write(true).create(true).truncate(true),
        "a" => opts.append(true).create(true),
        "a+" => opts.read(true).append(true).create(true),
        other => return Err(HostError::type_error(format!("unknown flags {other}"))),
    };
    Ok(opts.open(path)?)
}

fn invoke_proc(member: &str, args: &[Value]) -> HostResult {
    match member {
        "spawn" | "execFile" | "fork" => {
            let file = arg_str(args, 0, "file")?;
            let argv = arg_argv(args, 1);
            let child = Command::new(&file)
                .args(&argv)
                .stdin(Stdio::null())
                .spawn()?;
            Ok(json!({ "pid": child.id() }))
        }
        "spawnSync" | "execFileSync" => {
            let file = arg_str(args, 0, "file")?;
            let argv = arg_argv(args, 1);
            let output = Command::new(&file).args(&argv).stdin(Stdio::null()).output()?;
            Ok(json!({
                "status": output.status.code(),
                "stdout": String::from_utf8_lossy(&output.stdout).into_owned(),
            }))
        }
        "exec" => {
            let command = arg_str(args, 0, "command")?;
            let child = Command::new("sh")
                .arg("-c")
                .arg(&command)
                .stdin(Stdio::null())
                .spawn()?;
            Ok(json!({ "pid": child.id() }))
        }
        "execSync" => {
            let command = arg_str(args, 0, "command")?;
            let output = Command::new("sh")
                .arg("-c")
                .arg(&command)
                .stdin(Stdio::null())
                .output()?;
            if !output.status.success() {
                return Err(HostError::new(
                    "Error",
                    format!("command failed with status {:?}", output.status.code()),
                ));
            }
            Ok(Value::String(
                String::from_utf8_lossy(&output.stdout).into_owned(),
            ))
        }
        other => Err(HostError::type_error(format!(
            "unknown child_process member {other}"
        ))),
    }
}

fn invoke_dns(args: &[Value]) -> HostResult {
    let host = arg_str(args, 0, "host")?;
    let addrs = (host.as_str(), 0u16)
        .to_socket_addrs()
        .map_err(|e| HostError::new("Error", format!("getaddrinfo failed: {e}")))?;
    let mut seen = Vec::new();
    for addr in addrs {
        let ip = addr.ip().to_string();
        if !seen.contains(&ip) {
            seen.push(ip);
        }
    }
    Ok(json!(seen))
}

/// `(port, host)` or `({port, host})` connection target
fn net_target(args: &[Value]) -> Result<(String, u16), HostError> {
    match args.first() {
        Some(Value::Object(opts)) => {
            let host = opts
                .get("host")
                .and_then(Value::as_str)
                .unwrap_or("localhost")
                .to_string();
            let port = opts
                .get("port")
                .and_then(Value::as_u64)
                .ok_or_else(|| HostError::type_error("options.port required"))? as u16;
            Ok((host, port))
        }
        Some(Value::Number(n)) => {
            let port = n
                .as_u64()
                .ok_or_else(|| HostError::type_error("port must be a positive number"))?
                as u16;
            let host = args
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or("localhost")
                .to_string();
            Ok((host, port))
        }
        _ => Err(HostError::type_error("expected (port, host) or options")),
    }
}

fn connect_to(host: &str, port: u16) -> Result<TcpStream, HostError> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| HostError::new("Error", format!("getaddrinfo failed: {e}")))?
        .next()
        .ok_or_else(|| HostError::new("Error", format!("no address for {host}")))?;
    TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
        .map_err(|e| HostError::new("Error", format!("connect {host}:{port} failed: {e}")))
}

fn invoke_net(args: &[Value]) -> HostResult {
    let (host, port) = net_target(args)?;
    let stream = connect_to(&host, port)?;
    let local = stream.local_addr().map(|a| a.to_string()).unwrap_or_default();
    Ok(json!({ "connected": true, "localAddress": local }))
}

/// Parsed HTTP submission target
struct HttpTarget {
    host: String,
    port: u16,
    path: String,
    method: String,
}

fn http_target(args: &[Value], default_port: u16) -> Result<HttpTarget, HostError> {
    match args.first() {
        Some(Value::String(href)) => {
            let (host, port, path) = split_href(href, default_port)
                .ok_or_else(|| HostError::type_error(format!("unparseable URL {href}")))?;
            Ok(HttpTarget {
                host,
                port,
                path,
                method: "GET".to_string(),
            })
        }
        Some(Value::Object(opts)) => {
            let host = opts
                .get("hostname")
                .or_else(|| opts.get("host"))
                .and_then(Value::as_str)
                .unwrap_or("localhost")
                .to_string();
            let port = opts.get("port").and_then(Value::as_u64).unwrap_or(default_port as u64) as u16;
            let path = opts
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or("/")
                .to_string();
            let method = opts
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or("GET")
                .to_string();
            Ok(HttpTarget { host, port, path, method })
        }
        _ => Err(HostError::type_error("expected URL or request options")),
    }
}

/// Split `scheme://[user@]host[:port]/path` into components
pub fn split_href(href: &str, default_port: u16) -> Option<(String, u16, String)> {
    let rest = href.split_once("://").map(|(_, r)| r).unwrap_or(href);
    let (authority, path) = match rest.find(['/', '?', '#']) {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let authority = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
    if authority.is_empty() {
        return None;
    }
    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        // IPv6 literal: [::1]:8080
        let (host, tail) = bracketed.split_once(']')?;
        let port = tail
            .strip_prefix(':')
            .and_then(|p| p.parse().ok())
            .unwrap_or(default_port);
        (host.to_string(), port)
    } else {
        match authority.rsplit_once(':') {
            Some((h, p)) => match p.parse() {
                Ok(port) => (h.to_string(), port),
                Err(_) => (authority.to_string(), default_port),
            },
            None => (authority.to_string(), default_port),
        }
    };
    Some((host, port, path.to_string()))
}

fn invoke_http(args: &[Value], default_port: u16, plaintext: bool) -> HostResult {
    let target = http_target(args, default_port)?;
    let stream = connect_to(&target.host, target.port)?;
    if !plaintext {
        // TLS handshake is out of scope; the connection itself is the event
        return Ok(json!({ "connected": true }));
    }
    let mut stream = stream;
    let head = format!(
        "{} {} HTTP/1.0\r\nHost: {}\r\nConnection: close\r\n\r\n",
        target.method, target.path, target.host
    );
    stream
        .write_all(head.as_bytes())
        .map_err(|e| HostError::new("Error", format!("request write failed: {e}")))?;
    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .map_err(|e| HostError::new("Error", format!("response read failed: {e}")))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok());
    Ok(json!({ "status": status }))
}
