//! The `host` object installed into every pack context. It is the only route from pack code to
//! I/O, and each operation is checked against the capabilities of the call in progress.

use std::{
    cell::{Cell, RefCell},
    io::Read,
    path::{Path, PathBuf},
    rc::Rc,
    sync::Arc,
    time::Instant,
};

use v8wrapper::{CatchToResult, ExceptionResult};

use super::acl::{self, NetworkAcl};

/// Where host operations may reach, shared by every sandbox of a run.
#[derive(Clone, Debug, Default)]
pub struct HostPolicy {
    pub acl: NetworkAcl,
    pub read_roots: Vec<PathBuf>,
    pub max_read_bytes: usize,
}

/// Host operations granted to one call.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    pub network: bool,
    pub filesystem: bool,
}

impl Capabilities {
    pub const NONE: Capabilities = Capabilities {
        network: false,
        filesystem: false,
    };
    pub const ALL: Capabilities = Capabilities {
        network: true,
        filesystem: true,
    };
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum HostError {
    #[error("sandbox violation: {0}")]
    Denied(String),
    #[error("{0}")]
    Failed(String),
}

/// Per-context state consulted by the host callbacks. Stored in the context's slot.
pub(crate) struct HostGate {
    policy: Arc<HostPolicy>,
    capabilities: Cell<Capabilities>,
    deadline: Cell<Option<Instant>>,
    violation: RefCell<Option<String>>,
}

impl HostGate {
    pub fn new(policy: Arc<HostPolicy>) -> Self {
        Self {
            policy,
            capabilities: Cell::new(Capabilities::NONE),
            deadline: Cell::new(None),
            violation: RefCell::new(None),
        }
    }

    /// Grants `capabilities` until [HostGate::end]. Blocking host I/O is bounded by `deadline`.
    pub fn begin(&self, capabilities: Capabilities, deadline: Instant) {
        self.capabilities.set(capabilities);
        self.deadline.set(Some(deadline));
        self.violation.replace(None);
    }

    /// Revokes all capabilities, returning the first violation since [HostGate::begin].
    pub fn end(&self) -> Option<String> {
        self.capabilities.set(Capabilities::NONE);
        self.deadline.set(None);
        self.violation.replace(None)
    }

    fn deny(&self, message: String) -> HostError {
        let mut violation = self.violation.borrow_mut();
        if violation.is_none() {
            *violation = Some(message.clone());
        }
        HostError::Denied(message)
    }

    fn remaining(&self) -> Result<std::time::Duration, HostError> {
        let deadline = self
            .deadline
            .get()
            .ok_or_else(|| HostError::Failed("no call in progress".to_string()))?;
        deadline
            .checked_duration_since(Instant::now())
            .filter(|remaining| !remaining.is_zero())
            .ok_or_else(|| HostError::Failed("call deadline has passed".to_string()))
    }

    pub fn fetch_text(&self, url: &str) -> Result<String, HostError> {
        if !self.capabilities.get().network {
            return Err(self.deny(format!("network access to {url:?} outside setup")));
        }
        let (parsed, host) = acl::parse_fetch_url(url).map_err(|err| self.deny(err.to_string()))?;
        if !self.policy.acl.allows(&host) {
            return Err(self.deny(format!("host {host:?} is not in the allowed hosts")));
        }

        let remaining = self.remaining()?;
        let agent = ureq::AgentBuilder::new()
            .timeout(remaining)
            .redirects(0)
            .build();
        log::debug!("Fetching {url:?} for pack setup.");
        let response = agent
            .request_url("GET", &parsed)
            .call()
            .map_err(|err| HostError::Failed(format!("fetching {url:?}: {err}")))?;

        read_capped(response.into_reader(), self.policy.max_read_bytes)
            .map_err(|err| HostError::Failed(format!("reading response from {url:?}: {err}")))
    }

    pub fn read_text(&self, path: &str) -> Result<String, HostError> {
        if !self.capabilities.get().filesystem {
            return Err(self.deny(format!("filesystem access to {path:?} outside setup")));
        }
        let Some(first_root) = self.policy.read_roots.first() else {
            return Err(self.deny(format!("no read roots are configured, cannot read {path:?}")));
        };

        let requested = Path::new(path);
        let requested = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            first_root.join(requested)
        };
        let canonical = requested
            .canonicalize()
            .map_err(|err| HostError::Failed(format!("resolving {path:?}: {err}")))?;
        let permitted = self.policy.read_roots.iter().any(|root| {
            root.canonicalize()
                .map(|root| canonical.starts_with(root))
                .unwrap_or(false)
        });
        if !permitted {
            return Err(self.deny(format!("{path:?} is outside the read roots")));
        }

        let file = std::fs::File::open(&canonical)
            .map_err(|err| HostError::Failed(format!("opening {path:?}: {err}")))?;
        read_capped(file, self.policy.max_read_bytes)
            .map_err(|err| HostError::Failed(format!("reading {path:?}: {err}")))
    }
}

fn read_capped<R: Read>(reader: R, max_bytes: usize) -> Result<String, String> {
    let mut body = Vec::new();
    reader
        .take((max_bytes as u64).saturating_add(1))
        .read_to_end(&mut body)
        .map_err(|err| err.to_string())?;
    if body.len() > max_bytes {
        return Err(format!("content exceeds {max_bytes} bytes"));
    }
    String::from_utf8(body).map_err(|err| err.to_string())
}

/// Installs the `host` global into the current context.
pub(crate) fn install<'scope, 'iso>(
    scope: &mut v8::PinScope<'scope, 'iso>,
    context: v8::Local<'_, v8::Context>,
) -> ExceptionResult<()> {
    v8::tc_scope!(let try_catch, scope);
    let host = v8::Object::new(try_catch);

    let fetch_text = v8::Function::new(try_catch, fetch_text_callback).to_exception_result(try_catch)?;
    let name = v8wrapper::new_v8_string(try_catch, "fetchText")?;
    host.set(try_catch, name.cast(), fetch_text.cast())
        .to_exception_result(try_catch)?;

    let read_text = v8::Function::new(try_catch, read_text_callback).to_exception_result(try_catch)?;
    let name = v8wrapper::new_v8_string(try_catch, "readText")?;
    host.set(try_catch, name.cast(), read_text.cast())
        .to_exception_result(try_catch)?;

    let global = context.global(try_catch);
    let name = v8wrapper::new_v8_string(try_catch, "host")?;
    global
        .set(try_catch, name.cast(), host.cast())
        .to_exception_result(try_catch)?;
    Ok(())
}

fn current_gate(scope: &mut v8::PinScope) -> Option<Rc<HostGate>> {
    scope.get_current_context().get_slot::<HostGate>()
}

fn throw_error(scope: &mut v8::PinScope, message: &str) {
    if let Some(message) = v8::String::new(scope, message) {
        let exception = v8::Exception::error(scope, message);
        scope.throw_exception(exception);
    }
}

fn string_result(scope: &mut v8::PinScope, result: Result<String, HostError>, rv: &mut v8::ReturnValue) {
    match result {
        Ok(text) => match v8::String::new(scope, &text) {
            Some(text) => rv.set(text.cast()),
            None => throw_error(scope, "result is too large for a string"),
        },
        Err(err) => throw_error(scope, &err.to_string()),
    }
}

fn fetch_text_callback(
    scope: &mut v8::PinScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let Some(gate) = current_gate(scope) else {
        throw_error(scope, "host is not available in this context");
        return;
    };
    let url = args.get(0).to_rust_string_lossy(scope);
    let result = gate.fetch_text(&url);
    string_result(scope, result, &mut rv);
}

fn read_text_callback(
    scope: &mut v8::PinScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let Some(gate) = current_gate(scope) else {
        throw_error(scope, "host is not available in this context");
        return;
    };
    let path = args.get(0).to_rust_string_lossy(scope);
    let result = gate.read_text(&path);
    string_result(scope, result, &mut rv);
}
