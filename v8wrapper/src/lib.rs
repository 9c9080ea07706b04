//! Provides thread-local instances of [v8::Isolate]s, along with the limits and helpers needed to
//! run untrusted scripts inside them.

pub mod watchdog;

#[cfg(test)]
mod test;

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};

pub use watchdog::{WatchGuard, Watchdog};

static INIT_V8: std::sync::OnceLock<()> = std::sync::OnceLock::new();

/// Initialises [v8]. Must be called before any other functions in [v8] or this crate. Can safely
/// be called multiple times. Must be called from the main thread.
pub fn init_v8() {
    INIT_V8.get_or_init(|| {
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform);
        v8::V8::initialize();
    });
}

/// Initialises [v8]. Must be called before any other functions in [v8] or this crate. Can safely
/// be called multiple times. May be called from any thread, but provides fewer security
/// protections, and so is appropriate to call from tests.
pub fn init_v8_for_testing() {
    INIT_V8.get_or_init(|| {
        let platform = v8::new_unprotected_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform);
        v8::V8::initialize();
    });
}

/// Origin of some code.
#[derive(Debug)]
pub struct ESScriptOrigin {
    pub resource_name: String,
    pub resource_line_offset: i32,
    pub resource_column_offset: i32,
    pub script_id: i32,
}

impl ESScriptOrigin {
    /// Creates an origin for a named classic script.
    pub fn named<S: Into<String>>(resource_name: S) -> Self {
        Self {
            resource_name: resource_name.into(),
            ..Default::default()
        }
    }

    pub fn make_origin<'scope, 'iso>(
        &self,
        scope: &mut v8::PinScope<'scope, 'iso>,
    ) -> Option<v8::ScriptOrigin<'scope>> {
        let resource_name_v8: v8::Local<v8::Value> =
            v8::String::new(scope, &self.resource_name)?.cast();
        Some(v8::ScriptOrigin::new(
            scope,
            resource_name_v8,
            self.resource_line_offset,
            self.resource_column_offset,
            false,
            self.script_id,
            None,
            false,
            false,
            false,
            None,
        ))
    }
}

impl Default for ESScriptOrigin {
    fn default() -> Self {
        Self {
            resource_name: Default::default(),
            resource_line_offset: Default::default(),
            resource_column_offset: Default::default(),
            script_id: -1,
        }
    }
}

/// Resource limits applied to an isolate when it is created.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IsolateLimits {
    /// Maximum V8 heap size in bytes. `None` leaves V8's own default in place.
    pub max_heap_bytes: Option<usize>,
}

thread_local! {
    static ISOLATE: std::cell::RefCell<Option<TlsIsolateGuard>> = const {
        std::cell::RefCell::new(None)
    };
}

/// Upon creation creates a [v8::OwnedIsolate] for the current thread, and destroys it upon [Drop].
pub struct TlsIsolate(
    // Uses the `PhantomData *const` to implicitly mark as neither [Send] nor [Sync] until
    // https://github.com/rust-lang/rust/issues/68318 is resolved.
    std::marker::PhantomData<*const ()>,
);

impl TlsIsolate {
    /// Creates a [TlsIsolate] for the current thread, which enables calls to [try_with_isolate]
    /// until it is dropped.
    ///
    /// This explicitly manages the lifetime of the thread local [v8::OwnedIsolate].
    pub fn for_current_thread() -> Result<Self> {
        Self::for_current_thread_with_limits(IsolateLimits::default())
    }

    /// As [TlsIsolate::for_current_thread], but applies the given limits to the isolate.
    pub fn for_current_thread_with_limits(limits: IsolateLimits) -> Result<Self> {
        ISOLATE.try_with(|isolate_refcell| {
            if isolate_refcell.borrow().is_some() {
                bail!("TlsIsolate already exists for this thread");
            }
            isolate_refcell.replace(Some(TlsIsolateGuard::new(limits)));
            Ok(Self(std::marker::PhantomData))
        })?
    }
}

impl Drop for TlsIsolate {
    fn drop(&mut self) {
        let result = ISOLATE.try_with(|isolate_refcell| {
            let _ = isolate_refcell.borrow_mut().take();
        });
        if let Err(err) = result {
            log::warn!("Could not drop TlsIsolate: {err}.");
        }
    }
}

/// Runs the given lambda with the thread's local v8 isolate.
pub fn try_with_isolate<F, R>(f: F) -> Result<R, TlsIsolateError>
where
    F: FnOnce(&mut TlsIsolateGuard) -> R,
{
    ISOLATE
        .try_with(|isolate| -> Result<R, TlsIsolateError> {
            let mut isolate_opt_ref = isolate.borrow_mut();
            let isolate_ref = isolate_opt_ref.as_mut().ok_or(TlsIsolateError::NotExist)?;
            Ok(f(isolate_ref))
        })
        .map_err(TlsIsolateError::AccessError)
        .and_then(|r| r)
}

pub struct TlsIsolateGuard {
    // Declared before `heap_guard` so that the isolate (and with it the near heap limit callback
    // that points into `heap_guard`) is destroyed first.
    isolate: v8::OwnedIsolate,
    heap_guard: Option<Box<HeapGuard>>,
}

impl TlsIsolateGuard {
    fn new(limits: IsolateLimits) -> Self {
        let mut params = v8::CreateParams::default();
        if let Some(max_heap_bytes) = limits.max_heap_bytes {
            params = params.heap_limits(0, max_heap_bytes);
        }
        let mut isolate = v8::Isolate::new(params);

        let heap_guard = limits.max_heap_bytes.map(|max_heap_bytes| {
            let guard = Box::new(HeapGuard {
                handle: isolate.thread_safe_handle(),
                max_heap_bytes,
                exceeded: AtomicBool::new(false),
            });
            let data = &*guard as *const HeapGuard as *mut std::ffi::c_void;
            isolate.add_near_heap_limit_callback(near_heap_limit_callback, data);
            guard
        });

        Self {
            isolate,
            heap_guard,
        }
    }

    pub fn isolate(&mut self) -> &mut v8::OwnedIsolate {
        &mut self.isolate
    }

    /// Returns a handle that other threads may use to terminate execution in this isolate.
    pub fn thread_safe_handle(&self) -> v8::IsolateHandle {
        self.isolate.thread_safe_handle()
    }

    pub fn new_ctx(&mut self) -> v8::Global<v8::Context> {
        v8::scope!(let scope, &mut self.isolate);
        let ctx = v8::Context::new(scope, v8::ContextOptions::default());
        v8::Global::new(scope, ctx)
    }

    /// Reports whether the heap ceiling was reached since the last call, and if so, collects
    /// garbage and restores the original ceiling so that later scripts are held to it again.
    ///
    /// Must only be called when no script is running in the isolate.
    pub fn take_heap_limit_exceeded(&mut self) -> bool {
        let Some(guard) = self.heap_guard.as_ref() else {
            return false;
        };
        if !guard.exceeded.swap(false, Ordering::SeqCst) {
            return false;
        }

        let max_heap_bytes = guard.max_heap_bytes;
        let data = &**guard as *const HeapGuard as *mut std::ffi::c_void;
        self.isolate
            .remove_near_heap_limit_callback(near_heap_limit_callback, max_heap_bytes);
        self.isolate.cancel_terminate_execution();
        self.isolate.low_memory_notification();
        self.isolate
            .add_near_heap_limit_callback(near_heap_limit_callback, data);
        true
    }
}

/// State shared with the near heap limit callback of one isolate.
struct HeapGuard {
    handle: v8::IsolateHandle,
    max_heap_bytes: usize,
    exceeded: AtomicBool,
}

/// Terminates the running script instead of letting V8 abort the process, granting enough
/// headroom for the termination to unwind.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` was registered by `TlsIsolateGuard` and points at a `HeapGuard` that is
    // dropped only after the isolate that invokes this callback.
    let guard = unsafe { &*(data as *const HeapGuard) };
    guard.exceeded.store(true, Ordering::SeqCst);
    guard.handle.terminate_execution();
    current_heap_limit.saturating_mul(2)
}

/// Describes the cause of an error with [try_with_isolate].
#[derive(Debug)]
pub enum TlsIsolateError {
    /// Error accessing the thread local.
    AccessError(std::thread::AccessError),
    /// [TlsIsolate] does not exist for the current thread.
    NotExist,
}

impl std::fmt::Display for TlsIsolateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsIsolateError::AccessError(_) => write!(f, "AccessError"),
            TlsIsolateError::NotExist => {
                write!(f, "TlsIsolate does not exist on the current thread")
            }
        }
    }
}

impl std::error::Error for TlsIsolateError {}

/// Wraps [v8::String::new], translating any thrown exception into an [ExceptionResult].
pub fn new_v8_string<'scope, 'iso>(
    scope: &mut v8::PinScope<'scope, 'iso>,
    value: &str,
) -> ExceptionResult<v8::Local<'scope, v8::String>> {
    v8::tc_scope!(let try_catch, scope);
    v8::String::new(try_catch, value).to_exception_result(try_catch)
}

/// Compiles and runs a classic script in the current context, returning its completion value.
/// Top level `function` and `var` declarations become properties of the context's global object.
pub fn run_script<'scope, 'iso>(
    scope: &mut v8::PinScope<'scope, 'iso>,
    origin: &ESScriptOrigin,
    source: &str,
) -> ExceptionResult<v8::Local<'scope, v8::Value>> {
    v8::tc_scope!(let try_catch, scope);
    let source_v8 = v8::String::new(try_catch, source).to_exception_result(try_catch)?;
    let origin_v8 = origin
        .make_origin(try_catch)
        .to_exception_result(try_catch)?;
    let script = v8::Script::compile(try_catch, source_v8, Some(&origin_v8))
        .to_exception_result(try_catch)?;
    script.run(try_catch).to_exception_result(try_catch)
}

/// Returns the names of the enumerable "own" properties of `object`.
pub fn own_property_names<'scope, 'iso>(
    scope: &mut v8::PinScope<'scope, 'iso>,
    object: v8::Local<'_, v8::Object>,
) -> ExceptionResult<Vec<String>> {
    v8::tc_scope!(let try_catch, scope);
    let keys = object
        .get_own_property_names(try_catch, v8::GetPropertyNamesArgs::default())
        .to_exception_result(try_catch)?;
    let mut names = Vec::with_capacity(keys.length() as usize);
    for index in 0..keys.length() {
        let key = keys
            .get_index(try_catch, index)
            .to_exception_result(try_catch)?;
        names.push(key.to_rust_string_lossy(try_catch));
    }
    Ok(names)
}

pub type ExceptionResult<T> = std::result::Result<T, ExceptionError>;

#[derive(Debug)]
pub enum ExceptionError {
    NothingCaught,
    Caught(ExceptionErrorDetail),
}

#[derive(Debug, Default)]
pub struct ExceptionErrorDetail {
    exception: Option<String>,
    msg: Option<String>,
    resource_name: Option<String>,
    line_number: Option<usize>,
    terminated: bool,
}

impl ExceptionError {
    /// True when the exception was caused by execution being terminated (for example by a
    /// [Watchdog] or the heap ceiling) rather than thrown by the script.
    pub fn is_termination(&self) -> bool {
        matches!(self, ExceptionError::Caught(detail) if detail.terminated)
    }

    fn capture<'scope, 'iso, 'obj, 'pin>(
        try_catch: &mut v8::PinnedRef<'pin, v8::TryCatch<'scope, 'obj, v8::HandleScope<'iso>>>,
    ) -> Self {
        if !try_catch.has_caught() {
            return ExceptionError::NothingCaught;
        }

        let mut detail = ExceptionErrorDetail {
            terminated: try_catch.has_terminated(),
            ..Default::default()
        };
        if let Some(exc) = try_catch.exception() {
            detail.exception = Some(exc.to_rust_string_lossy(try_catch));
        }

        if let Some(message) = try_catch.message() {
            detail.msg = Some(message.get(try_catch).to_rust_string_lossy(try_catch));
            detail.line_number = message.get_line_number(try_catch);
            detail.resource_name = message
                .get_script_resource_name(try_catch)
                .map(|v| v.to_rust_string_lossy(try_catch));
        }

        Self::Caught(detail)
    }
}

impl std::fmt::Display for ExceptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExceptionError::NothingCaught => {
                write!(
                    f,
                    "expected JavaScript exception but none caught, this is likely a bug at the callsite"
                )
            }
            ExceptionError::Caught(detail) => {
                if detail.terminated {
                    write!(f, "JavaScript execution terminated ")?;
                } else if let Some(exception) = &detail.exception {
                    write!(f, "JavaScript exception <{exception}> ")?;
                } else {
                    write!(f, "JavaScript exception of unknown type ")?;
                }

                match (detail.line_number, &detail.resource_name) {
                    (Some(line_number), Some(resource_name)) => {
                        write!(f, "at {resource_name}:{line_number}")
                    }
                    (None, Some(resource_name)) => write!(f, "in {resource_name}"),
                    (Some(line_number), None) => write!(f, "at {line_number}:?"),
                    _ => write!(f, "at unknown location"),
                }
            }
        }
    }
}

impl std::error::Error for ExceptionError {}

pub trait CatchToResult<T> {
    /// Method to convert a value (typically an [Option<v8::Local>]) to an [ExceptionResult] by
    /// catching an exception with the [v8::TryCatch] when the value is [None]. This is appropriate
    /// to use whenever the C++ v8 API would return a `MaybeLocal` in its place, implying that an
    /// exception might have been raised.
    ///
    /// The [v8::TryCatch] given must have been used as the scope in the operation that produced
    /// the [Option].
    fn to_exception_result<'scope, 'iso, 'obj, 'pin>(
        self,
        try_catch: &mut v8::PinnedRef<'pin, v8::TryCatch<'scope, 'obj, v8::HandleScope<'iso>>>,
    ) -> ExceptionResult<T>;
}

impl<T> CatchToResult<T> for Option<T> {
    fn to_exception_result<'scope, 'iso, 'obj, 'pin>(
        self,
        try_catch: &mut v8::PinnedRef<'pin, v8::TryCatch<'scope, 'obj, v8::HandleScope<'iso>>>,
    ) -> ExceptionResult<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(ExceptionError::capture(try_catch)),
        }
    }
}
