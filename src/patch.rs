//! The patch table: instrumented dispatch over host APIs
//!
//! Monkey-patching is modeled explicitly: every registry member has a
//! dispatch slot holding either the agent's wrapper (marked) or whatever
//! a tampering program put there instead (unmarked). Wrappers capture the
//! attribution context at entry, invoke the original, emit exactly one
//! record after completion, and pass the outcome through unchanged.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use serde_json::Value;

use crate::attribution;
use crate::event::{self, CallResult};
use crate::hostapi::{self, HostError, HostResult};
use crate::registry::{self, ApiSpec};
use crate::sink::EventSink;

/// A callable dispatch target
pub type HostFn = Arc<dyn Fn(&[Value]) -> HostResult + Send + Sync>;

struct Slot {
    func: HostFn,
    /// the wrapper marker: set only for functions this table installed
    marked: bool,
}

/// Dispatch table over the instrumented API surface
pub struct PatchTable {
    slots: RwLock<HashMap<(&'static str, &'static str), Slot>>,
}

impl PatchTable {
    /// Install wrappers for every registry entry. Replacement is a plain
    /// slot assignment per member; a member that fails to wrap is left
    /// un-instrumented rather than aborting the pass.
    pub fn install(sink: Arc<EventSink>) -> Arc<Self> {
        let mut slots = HashMap::new();
        for spec in registry::ENTRIES {
            let original: HostFn = Arc::new(move |args: &[Value]| hostapi::invoke(spec, args));
            let wrapped = wrap(spec, original, Arc::clone(&sink));
            slots.insert(
                (spec.namespace, spec.member),
                Slot {
                    func: wrapped,
                    marked: true,
                },
            );
        }
        Arc::new(Self {
            slots: RwLock::new(slots),
        })
    }

    /// Synchronous dispatch: the record is emitted strictly after the
    /// call completes, so `result` reflects thrown errors.
    pub fn call(&self, namespace: &str, member: &str, args: &[Value]) -> HostResult {
        let func = self.slot_fn(namespace, member)?;
        func(args)
    }

    /// Callback-style dispatch: the record is emitted at completion,
    /// before the continuation observes the outcome.
    pub fn call_with_callback<F>(&self, namespace: &str, member: &str, args: &[Value], cb: F)
    where
        F: FnOnce(HostResult),
    {
        cb(self.call(namespace, member, args));
    }

    /// Promise-style dispatch: the operation resolves off-thread and the
    /// record is emitted at resolution, attributed to the identity
    /// captured here at entry.
    pub fn call_promise(
        self: &Arc<Self>,
        namespace: &str,
        member: &str,
        args: Vec<Value>,
    ) -> Pending {
        let entry_pkg = attribution::identify();
        let table = Arc::clone(self);
        let namespace = namespace.to_string();
        let member = member.to_string();
        let handle = std::thread::spawn(move || {
            let _scope = attribution::enter_package(&entry_pkg);
            table.call(&namespace, &member, &args)
        });
        Pending { handle }
    }

    /// Overwrite a dispatch slot with an arbitrary function, losing the
    /// wrapper marker. This is what a tampering program does.
    pub fn replace(&self, namespace: &str, member: &str, func: HostFn) {
        if let Some(key) = registry::find(namespace, member).map(|s| (s.namespace, s.member)) {
            if let Ok(mut slots) = self.slots.write() {
                slots.insert(key, Slot { func, marked: false });
            }
        }
    }

    /// Does the member's current dispatch target carry the wrapper marker?
    pub fn is_marked(&self, namespace: &str, member: &str) -> bool {
        self.slots
            .read()
            .map(|slots| {
                slots
                    .get(&key_of(namespace, member))
                    .map(|s| s.marked)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    fn slot_fn(&self, namespace: &str, member: &str) -> Result<HostFn, HostError> {
        let slots = self
            .slots
            .read()
            .map_err(|_| HostError::new("Error", "dispatch table poisoned"))?;
        slots
            .get(&key_of(namespace, member))
            .map(|s| Arc::clone(&s.func))
            .ok_or_else(|| {
                HostError::type_error(format!("{namespace}.{member} is not instrumented"))
            })
    }
}

fn key_of(namespace: &str, member: &str) -> (&'static str, &'static str) {
    registry::find(namespace, member)
        .map(|s| (s.namespace, s.member))
        .unwrap_or(("", ""))
}

/// A promise-style call in flight
pub struct Pending {
    handle: JoinHandle<HostResult>,
}

impl Pending {
    /// Block until resolution; the record has already been emitted by
    /// the time this returns.
    pub fn wait(self) -> HostResult {
        self.handle
            .join()
            .unwrap_or_else(|_| Err(HostError::new("Error", "operation panicked")))
    }
}

fn wrap(spec: &'static ApiSpec, original: HostFn, sink: Arc<EventSink>) -> HostFn {
    let op = spec.op();
    Arc::new(move |args: &[Value]| {
        let (pkg, stack) = attribution::identify_with_stack();
        let result = original(args);
        // formatter/sink failures must never reach the observed call
        let _ = catch_unwind(AssertUnwindSafe(|| {
            emit(&sink, spec, &op, pkg.clone(), stack.clone(), args, &result);
        }));
        result
    })
}

fn emit(
    sink: &EventSink,
    spec: &ApiSpec,
    op: &str,
    pkg: String,
    stack: Option<String>,
    args: &[Value],
    result: &HostResult,
) {
    let summary = event::summarize(spec.shape, args);
    let (call_result, error) = match result {
        Ok(_) => (CallResult::Ok, None),
        Err(e) => (CallResult::Error, Some(e.to_error_info())),
    };
    let record = sink.record(pkg, op, spec.category, summary, call_result, error, stack);
    sink.write(&record);
}
