//! Bounded execution of pack code.
//!
//! A [PackSandbox] owns the current thread's V8 isolate, a watchdog and the code of every loaded
//! pack. Every call into pack code is wrapped with a wall-clock timeout, the isolate's heap
//! ceiling and the capabilities of its [CallKind]. Failures of pack code are returned as
//! [CallFailure] values; only failures of the execution environment itself are errors.

pub mod acl;
pub mod host;
pub mod pool;


use std::{
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use v8wrapper::{CatchToResult, ESScriptOrigin, ExceptionError, TlsIsolate, Watchdog};

use crate::config::SandboxLimits;
use host::{Capabilities, HostGate, HostPolicy};

pub const SETUP_EXPORT: &str = "setup";
pub const DETECTOR_PREFIX: &str = "detect_";
pub const TRANSFORM_EXPORT: &str = "transform_cell";

/// Everything needed to create a sandbox on any thread.
#[derive(Clone, Debug, Default)]
pub struct SandboxSettings {
    pub limits: SandboxLimits,
    pub host: HostPolicy,
}

/// The kinds of call made into pack code, each with its own limits and capabilities.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallKind {
    /// Running the pack's top level code.
    Load,
    Setup,
    Detect,
    Transform,
}

impl CallKind {
    /// Only `setup` may perform I/O.
    pub fn capabilities(self) -> Capabilities {
        match self {
            CallKind::Setup => Capabilities::ALL,
            CallKind::Load | CallKind::Detect | CallKind::Transform => Capabilities::NONE,
        }
    }

    pub fn timeout(self, limits: &SandboxLimits) -> Duration {
        match self {
            CallKind::Load => limits.load_timeout(),
            CallKind::Setup => limits.setup_timeout(),
            CallKind::Detect | CallKind::Transform => limits.call_timeout(),
        }
    }
}

/// A function exported by a loaded pack.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum EntryPoint {
    Setup,
    /// Index into [PackManifest::detectors].
    Detector(usize),
    Transform,
}

impl EntryPoint {
    pub fn kind(self) -> CallKind {
        match self {
            EntryPoint::Setup => CallKind::Setup,
            EntryPoint::Detector(_) => CallKind::Detect,
            EntryPoint::Transform => CallKind::Transform,
        }
    }
}

/// The entry points of a pack, discovered once when it is loaded.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct PackManifest {
    pub has_setup: bool,
    /// Names of the `detect_*` exports, sorted.
    pub detectors: Vec<String>,
    pub has_transform: bool,
}

impl PackManifest {
    pub fn entry_name(&self, entry: EntryPoint) -> &str {
        match entry {
            EntryPoint::Setup => SETUP_EXPORT,
            EntryPoint::Detector(index) => self
                .detectors
                .get(index)
                .map(String::as_str)
                .unwrap_or(DETECTOR_PREFIX),
            EntryPoint::Transform => TRANSFORM_EXPORT,
        }
    }
}

/// Why one call into pack code failed.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum CallFailure {
    #[error("{0}")]
    Exception(String),
    #[error("exceeded its time limit of {0} ms")]
    Timeout(u64),
    #[error("exceeded the heap limit")]
    MemoryLimit,
    #[error("sandbox violation: {0}")]
    Violation(String),
    #[error("invalid return value: {0}")]
    InvalidReturn(String),
}

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    Exception,
    Timeout,
    MemoryLimit,
    SandboxViolation,
    InvalidReturn,
}

impl CallFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            CallFailure::Exception(_) => FailureKind::Exception,
            CallFailure::Timeout(_) => FailureKind::Timeout,
            CallFailure::MemoryLimit => FailureKind::MemoryLimit,
            CallFailure::Violation(_) => FailureKind::SandboxViolation,
            CallFailure::InvalidReturn(_) => FailureKind::InvalidReturn,
        }
    }
}

pub type CallOutcome = std::result::Result<serde_json::Value, CallFailure>;

/// Invokes entry points of loaded packs by index. The seam between the engine's algorithms and
/// the sandbox.
pub trait PackInvoker {
    /// Calls `entry` of the pack at `pack` with a single `input` argument. The outer error is
    /// reserved for failures of the execution environment.
    fn invoke(
        &mut self,
        pack: usize,
        entry: EntryPoint,
        input: &serde_json::Value,
    ) -> Result<CallOutcome>;
}

/// A pack accepted by [PackSandbox::load].
struct LoadedCode {
    resource_name: String,
    code: String,
    manifest: PackManifest,
}

/// One evaluation of a pack's top level code in its own context.
struct Realm {
    context: v8::Global<v8::Context>,
    gate: Rc<HostGate>,
    setup: Option<v8::Global<v8::Function>>,
    detectors: Vec<v8::Global<v8::Function>>,
    transform: Option<v8::Global<v8::Function>>,
}

impl Realm {
    fn entry(&self, entry: EntryPoint) -> Option<&v8::Global<v8::Function>> {
        match entry {
            EntryPoint::Setup => self.setup.as_ref(),
            EntryPoint::Detector(index) => self.detectors.get(index),
            EntryPoint::Transform => self.transform.as_ref(),
        }
    }
}

/// Failure from inside a single isolate call, before it is classified.
enum RawFailure {
    Exception(ExceptionError),
    Input(String),
    Return(String),
}

/// Runs packs on the current thread. Not [Send]: create one per worker thread.
///
/// Every call evaluates the pack's top level code afresh in a new context, so nothing a call
/// writes to globals, closures or module-level objects is visible to any later call.
pub struct PackSandbox {
    packs: Vec<LoadedCode>,
    watchdog: Watchdog,
    limits: SandboxLimits,
    policy: Arc<HostPolicy>,
    _isolate: TlsIsolate,
}

impl PackSandbox {
    /// Creates the current thread's isolate. Fails if the thread already has one.
    pub fn new(settings: &SandboxSettings) -> Result<Self> {
        let isolate = TlsIsolate::for_current_thread_with_limits(v8wrapper::IsolateLimits {
            max_heap_bytes: Some(settings.limits.max_heap_bytes),
        })
        .context("creating sandbox isolate")?;
        let handle = v8wrapper::try_with_isolate(|guard| guard.thread_safe_handle())?;
        let watchdog = Watchdog::new(handle)?;

        Ok(Self {
            packs: Vec::new(),
            watchdog,
            limits: settings.limits.clone(),
            policy: Arc::new(settings.host.clone()),
            _isolate: isolate,
        })
    }

    /// Number of packs loaded so far. The next [PackSandbox::load] receives this index.
    pub fn pack_count(&self) -> usize {
        self.packs.len()
    }

    /// Runs a pack's top level code in a fresh context and discovers its entry points. On success
    /// the pack is callable through [PackInvoker::invoke] at index [PackSandbox::pack_count] as it
    /// was before this call.
    pub fn load(
        &mut self,
        resource_name: &str,
        code: &str,
    ) -> Result<std::result::Result<PackManifest, CallFailure>> {
        let outcome = self.instantiate(resource_name, code)?;
        Ok(outcome.map(|(_, manifest)| {
            self.packs.push(LoadedCode {
                resource_name: resource_name.to_string(),
                code: code.to_string(),
                manifest: manifest.clone(),
            });
            manifest
        }))
    }

    /// Evaluates top level code in a new context, under the load limits and without
    /// capabilities.
    fn instantiate(
        &self,
        resource_name: &str,
        code: &str,
    ) -> Result<std::result::Result<(Realm, PackManifest), CallFailure>> {
        let kind = CallKind::Load;
        let timeout = kind.timeout(&self.limits);
        let gate = Rc::new(HostGate::new(self.policy.clone()));
        gate.begin(kind.capabilities(), Instant::now() + timeout);

        let guard = self.watchdog.arm(timeout);
        let result = v8wrapper::try_with_isolate(|tls_isolate| {
            compile_pack(tls_isolate, gate.clone(), resource_name, code)
        });
        let fired = guard.disarm();
        let heap_exceeded = v8wrapper::try_with_isolate(|guard| guard.take_heap_limit_exceeded())?;
        let violation = gate.end();

        Ok(classify(
            result?.map_err(RawFailure::Exception),
            heap_exceeded,
            fired,
            violation,
            timeout,
        ))
    }

    fn call(
        &self,
        pack: usize,
        entry: EntryPoint,
        input: &serde_json::Value,
    ) -> Result<CallOutcome> {
        let loaded = self
            .packs
            .get(pack)
            .ok_or_else(|| anyhow!("no pack loaded at index {pack}"))?;
        let exported = match entry {
            EntryPoint::Setup => loaded.manifest.has_setup,
            EntryPoint::Detector(index) => index < loaded.manifest.detectors.len(),
            EntryPoint::Transform => loaded.manifest.has_transform,
        };
        if !exported {
            bail!("pack at index {pack} does not export {entry:?}");
        }
        let name = loaded.manifest.entry_name(entry);

        let realm = match self.instantiate(&loaded.resource_name, &loaded.code)? {
            Ok((realm, manifest)) if manifest == loaded.manifest => realm,
            Ok(_) => {
                return Ok(Err(CallFailure::Exception(format!(
                    "top level code of {} exported different functions when evaluated again",
                    loaded.resource_name
                ))));
            }
            Err(failure) => return Ok(Err(failure)),
        };
        let function = realm
            .entry(entry)
            .ok_or_else(|| anyhow!("{name} is missing from a fresh context of pack {pack}"))?;

        let kind = entry.kind();
        let timeout = kind.timeout(&self.limits);
        realm
            .gate
            .begin(kind.capabilities(), Instant::now() + timeout);

        let guard = self.watchdog.arm(timeout);
        let result = v8wrapper::try_with_isolate(|tls_isolate| {
            call_function(tls_isolate, &realm.context, function, input)
        });
        let fired = guard.disarm();
        let heap_exceeded = v8wrapper::try_with_isolate(|guard| guard.take_heap_limit_exceeded())?;
        let violation = realm.gate.end();

        let outcome = classify(result?, heap_exceeded, fired, violation, timeout);
        if let Err(failure) = &outcome {
            log::debug!("{name} of pack {pack} failed: {failure}");
        }
        Ok(outcome)
    }
}

impl PackInvoker for PackSandbox {
    fn invoke(
        &mut self,
        pack: usize,
        entry: EntryPoint,
        input: &serde_json::Value,
    ) -> Result<CallOutcome> {
        self.call(pack, entry, input)
    }
}

fn compile_pack(
    tls_isolate: &mut v8wrapper::TlsIsolateGuard,
    gate: Rc<HostGate>,
    resource_name: &str,
    code: &str,
) -> v8wrapper::ExceptionResult<(Realm, PackManifest)> {
    let context = tls_isolate.new_ctx();
    v8::scope!(let scope, tls_isolate.isolate());
    let ctx = v8::Local::new(scope, &context);
    ctx.set_slot(gate.clone());
    v8::scope_with_context!(let scope, scope, ctx);
    v8::tc_scope!(let try_catch, scope);

    host::install(try_catch, ctx)?;
    v8wrapper::run_script(try_catch, &ESScriptOrigin::named(resource_name), code)?;

    let global = ctx.global(try_catch);
    let mut names = v8wrapper::own_property_names(try_catch, global)?;
    names.sort();

    let mut manifest = PackManifest::default();
    let mut setup = None;
    let mut detectors = Vec::new();
    let mut transform = None;
    for name in names {
        let is_detector = name.len() > DETECTOR_PREFIX.len() && name.starts_with(DETECTOR_PREFIX);
        if !is_detector && name != SETUP_EXPORT && name != TRANSFORM_EXPORT {
            continue;
        }
        let name_v8 = v8wrapper::new_v8_string(try_catch, &name)?;
        let value = global
            .get(try_catch, name_v8.cast())
            .to_exception_result(try_catch)?;
        let Ok(function) = value.try_cast::<v8::Function>() else {
            log::debug!("Ignoring non-function global {name:?} in {resource_name}.");
            continue;
        };
        let function = v8::Global::new(try_catch, function);

        if is_detector {
            detectors.push(function);
            manifest.detectors.push(name);
        } else if name == SETUP_EXPORT {
            setup = Some(function);
            manifest.has_setup = true;
        } else {
            transform = Some(function);
            manifest.has_transform = true;
        }
    }

    Ok((
        Realm {
            context,
            gate,
            setup,
            detectors,
            transform,
        },
        manifest,
    ))
}

fn call_function(
    tls_isolate: &mut v8wrapper::TlsIsolateGuard,
    context: &v8::Global<v8::Context>,
    function: &v8::Global<v8::Function>,
    input: &serde_json::Value,
) -> std::result::Result<serde_json::Value, RawFailure> {
    v8::scope!(let scope, tls_isolate.isolate());
    let ctx = v8::Local::new(scope, context);
    v8::scope_with_context!(let scope, scope, ctx);
    v8::tc_scope!(let try_catch, scope);

    // Each call converts the input afresh, so pack code cannot modify engine-owned values.
    let input_v8 =
        serde_v8::to_v8(try_catch, input).map_err(|err| RawFailure::Input(err.to_string()))?;
    let function = v8::Local::new(try_catch, function);
    let global = ctx.global(try_catch);
    let result_v8 = function
        .call(try_catch, global.cast(), &[input_v8])
        .to_exception_result(try_catch)
        .map_err(RawFailure::Exception)?;

    serde_v8::from_v8::<serde_json::Value>(try_catch, result_v8)
        .map_err(|err| RawFailure::Return(err.to_string()))
}

/// Decides the outcome of a call. A call that returned normally only fails if it attempted a
/// denied host operation. A call that failed is attributed to the heap ceiling, then the
/// watchdog, then any denied host operation, before its own exception.
fn classify<T>(
    result: std::result::Result<T, RawFailure>,
    heap_exceeded: bool,
    timed_out: bool,
    violation: Option<String>,
    timeout: Duration,
) -> std::result::Result<T, CallFailure> {
    match result {
        Ok(value) => match violation {
            Some(violation) => Err(CallFailure::Violation(violation)),
            None => Ok(value),
        },
        Err(_) if heap_exceeded => Err(CallFailure::MemoryLimit),
        Err(_) if timed_out => Err(CallFailure::Timeout(timeout.as_millis() as u64)),
        Err(_) if violation.is_some() => Err(CallFailure::Violation(violation.unwrap_or_default())),
        Err(RawFailure::Exception(err)) => Err(CallFailure::Exception(err.to_string())),
        Err(RawFailure::Input(message)) => Err(CallFailure::Exception(format!(
            "could not pass input to pack: {message}"
        ))),
        Err(RawFailure::Return(message)) => Err(CallFailure::InvalidReturn(message)),
    }
}
