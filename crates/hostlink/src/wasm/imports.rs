//! Host capabilities imported by the guest.
//!
//! Every capability is one [`Capability`] variant with a stable import name
//! and a fixed numeric signature. The whole table is registered on the
//! linker up front, so an unknown import fails at instantiation rather than
//! at call time.
//!
//! ## Argument conventions
//!
//! - Objects pass as `u32` handles into the instance's host object table.
//!   Handles passed *in* are borrowed unless the capability says it takes
//!   them; handles returned are owned by the guest.
//! - Strings pass as a `(ptr, len)` UTF-8 span. Strings returned to the guest
//!   are written through a `ret` pointer: `i32[ret / 4]` = ptr and
//!   `i32[ret / 4 + 1]` = len, with ptr 0 meaning "not a string".
//! - Numbers pass by value as `f64`.
//!
//! ## Failures
//!
//! Capabilities that can throw on the host side ([`Capability::catches`])
//! hand the thrown value to the guest's `__hostlink_exn_store` export and
//! return a zero value. If the guest has no exception store, or the failure
//! is a protocol violation (stale handle, bad UTF-8, out-of-bounds pointer),
//! the call traps.
//!
//! ```wat
//! (import "hostlink" "get_property" (func $get_property (param i32 i32 i32) (result i32)))
//! ```

use std::fmt;

use wasmtime::{AsContextMut, Caller, FuncType, Linker, ValType};

use super::runtime::{guest_error, WasmGuest, WasmHostState};
use crate::closure::GuestClosure;
use crate::codec::{self, EncodedString, GuestAllocator};
use crate::error::{BridgeError, Result};
use crate::host::{ConsoleLevel, HostEnvironment};
use crate::memory::GuestMemory;
use crate::value::HostValue;

use self::AbiType::{F64, I32};

/// Version of the handle/span conventions above.
pub const ABI_VERSION: u32 = 1;

/// Numeric types crossing the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiType {
    /// Handles, pointers, lengths, flags
    I32,
    /// Numbers
    F64,
}

impl fmt::Display for AbiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbiType::I32 => f.write_str("i32"),
            AbiType::F64 => f.write_str("f64"),
        }
    }
}

/// Parameter and result types of a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbiSignature {
    /// Parameter types
    pub params: &'static [AbiType],
    /// Result types (zero or one)
    pub results: &'static [AbiType],
}

impl AbiSignature {
    /// Whether a wasm function type has exactly this shape.
    pub fn matches(&self, ty: &FuncType) -> bool {
        fn same(abi: &[AbiType], wasm: impl ExactSizeIterator<Item = ValType>) -> bool {
            abi.len() == wasm.len()
                && abi.iter().zip(wasm).all(|(a, v)| {
                    matches!((a, v), (AbiType::I32, ValType::I32) | (AbiType::F64, ValType::F64))
                })
        }
        same(self.params, ty.params()) && same(self.results, ty.results())
    }
}

impl fmt::Display for AbiSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, ty) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", ty)?;
        }
        f.write_str(")")?;
        match self.results {
            [] => Ok(()),
            [ty] => write!(f, " -> {}", ty),
            many => {
                f.write_str(" -> (")?;
                for (i, ty) in many.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", ty)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Outcome of checking one guest import against the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportCheck {
    /// Import resolves to a capability with a matching signature
    Ok(Capability),
    /// No capability has this name
    Unknown,
    /// Name matches but the guest declared a different type
    SignatureMismatch {
        /// Capability with that name
        capability: Capability,
        /// The signature the host provides
        expected: AbiSignature,
    },
}

/// Check one import declared by a guest.
pub fn check_import(name: &str, ty: &FuncType) -> ImportCheck {
    match Capability::from_name(name) {
        None => ImportCheck::Unknown,
        Some(capability) if capability.signature().matches(ty) => ImportCheck::Ok(capability),
        Some(capability) => ImportCheck::SignatureMismatch {
            capability,
            expected: capability.signature(),
        },
    }
}

/// Host capabilities available to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// `(h)`: release a handle
    ObjectDropRef,
    /// `(h) -> h`: duplicate a handle
    ObjectCloneRef,
    /// `(ptr, len) -> h`: host string from a UTF-8 span
    StringNew,
    /// `(n) -> h`: host number
    NumberNew,
    /// `(ret, h)`: flag at `i32[ret/4]`, value at `f64[ret/8 + 1]`
    NumberGet,
    /// `(ret, h)`: span of a host string, ptr 0 if not a string
    StringGet,
    /// `(h) -> bool`
    IsUndefined,
    /// `(ptr, len) -> h`: parse JSON text
    JsonParse,
    /// `(ret, h)`: debug rendering of a value
    DebugString,
    /// `(ptr, len)`: abort the current call with a guest error
    Throw,
    /// `(ptr, len) -> h`: new `Error` with a message
    ErrorNew,
    /// `(ret, h)`: stack text of an error
    ErrorStack,
    /// `(a, b, dtor, trampoline) -> h`: wrap a guest closure
    ClosureNew,
    /// `(h) -> bool`: take a closure handle and drop one reference;
    /// true if it was the last
    CbDrop,
    /// `() -> version`
    AbiVersion,
    /// `(ptr, len) -> h`: global binding
    Global,
    /// `(obj, key) -> h`: property read with a handle key
    Get,
    /// `(obj, key, value)`: property write; takes `key` and `value`
    Set,
    /// `(obj, ptr, len) -> h`
    GetProperty,
    /// `(obj, ptr, len, value)`: takes `value`
    SetProperty,
    /// `(obj, ptr, len) -> n`, NaN if not a number
    GetPropertyF64,
    /// `(obj, ptr, len, n)`
    SetPropertyF64,
    /// `(ret, obj, ptr, len)`
    GetPropertyString,
    /// `(obj, kptr, klen, vptr, vlen)`
    SetPropertyString,
    /// `(h, ptr, len) -> bool`: `instanceof` by class name
    InstanceOf,
    /// `(obj, ptr, len, args, nargs) -> h`: args are handles in guest memory
    CallMethod,
    /// `(obj, ptr, len, args, nargs) -> h`: args are f64s in guest memory
    CallMethodF64,
    /// `(ptr, len) -> h`: function from source text
    NewFunction,
    /// `(f, this) -> h`
    CallFunction,
    /// `(level, h)`: arrays log their elements
    ConsoleLog,
    /// `(ptr, len)`: log an error and free the span
    ConsoleErrorOwned,
    /// `(callback, ms) -> id`
    SetTimeout,
    /// `(callback) -> id`
    RequestAnimationFrame,
    /// `(target, ptr, len, callback)`
    AddEventListener,
    /// `(target, ptr, len, callback)`
    RemoveEventListener,
    /// `() -> ms`
    Now,
}

impl Capability {
    /// Every capability, in registration order.
    pub const ALL: &'static [Capability] = &[
        Capability::ObjectDropRef,
        Capability::ObjectCloneRef,
        Capability::StringNew,
        Capability::NumberNew,
        Capability::NumberGet,
        Capability::StringGet,
        Capability::IsUndefined,
        Capability::JsonParse,
        Capability::DebugString,
        Capability::Throw,
        Capability::ErrorNew,
        Capability::ErrorStack,
        Capability::ClosureNew,
        Capability::CbDrop,
        Capability::AbiVersion,
        Capability::Global,
        Capability::Get,
        Capability::Set,
        Capability::GetProperty,
        Capability::SetProperty,
        Capability::GetPropertyF64,
        Capability::SetPropertyF64,
        Capability::GetPropertyString,
        Capability::SetPropertyString,
        Capability::InstanceOf,
        Capability::CallMethod,
        Capability::CallMethodF64,
        Capability::NewFunction,
        Capability::CallFunction,
        Capability::ConsoleLog,
        Capability::ConsoleErrorOwned,
        Capability::SetTimeout,
        Capability::RequestAnimationFrame,
        Capability::AddEventListener,
        Capability::RemoveEventListener,
        Capability::Now,
    ];

    /// Import name.
    pub fn name(self) -> &'static str {
        match self {
            Capability::ObjectDropRef => "object_drop_ref",
            Capability::ObjectCloneRef => "object_clone_ref",
            Capability::StringNew => "string_new",
            Capability::NumberNew => "number_new",
            Capability::NumberGet => "number_get",
            Capability::StringGet => "string_get",
            Capability::IsUndefined => "is_undefined",
            Capability::JsonParse => "json_parse",
            Capability::DebugString => "debug_string",
            Capability::Throw => "throw",
            Capability::ErrorNew => "error_new",
            Capability::ErrorStack => "error_stack",
            Capability::ClosureNew => "closure_new",
            Capability::CbDrop => "cb_drop",
            Capability::AbiVersion => "abi_version",
            Capability::Global => "global",
            Capability::Get => "get",
            Capability::Set => "set",
            Capability::GetProperty => "get_property",
            Capability::SetProperty => "set_property",
            Capability::GetPropertyF64 => "get_property_f64",
            Capability::SetPropertyF64 => "set_property_f64",
            Capability::GetPropertyString => "get_property_string",
            Capability::SetPropertyString => "set_property_string",
            Capability::InstanceOf => "instance_of",
            Capability::CallMethod => "call_method",
            Capability::CallMethodF64 => "call_method_f64",
            Capability::NewFunction => "new_function",
            Capability::CallFunction => "call_function",
            Capability::ConsoleLog => "console_log",
            Capability::ConsoleErrorOwned => "console_error_owned",
            Capability::SetTimeout => "set_timeout",
            Capability::RequestAnimationFrame => "request_animation_frame",
            Capability::AddEventListener => "add_event_listener",
            Capability::RemoveEventListener => "remove_event_listener",
            Capability::Now => "now",
        }
    }

    /// Look a capability up by import name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }

    /// Numeric signature.
    pub fn signature(self) -> AbiSignature {
        let (params, results): (&'static [AbiType], &'static [AbiType]) = match self {
            Capability::ObjectDropRef => (&[I32], &[]),
            Capability::ObjectCloneRef | Capability::IsUndefined | Capability::CbDrop => (&[I32], &[I32]),
            Capability::RequestAnimationFrame => (&[I32], &[I32]),
            Capability::StringNew
            | Capability::JsonParse
            | Capability::ErrorNew
            | Capability::Global
            | Capability::NewFunction
            | Capability::Get
            | Capability::CallFunction
            | Capability::SetTimeout => (&[I32, I32], &[I32]),
            Capability::NumberNew => (&[F64], &[I32]),
            Capability::NumberGet
            | Capability::StringGet
            | Capability::DebugString
            | Capability::ErrorStack
            | Capability::Throw
            | Capability::ConsoleLog
            | Capability::ConsoleErrorOwned => (&[I32, I32], &[]),
            Capability::ClosureNew => (&[I32, I32, I32, I32], &[I32]),
            Capability::AbiVersion => (&[], &[I32]),
            Capability::Set => (&[I32, I32, I32], &[]),
            Capability::GetProperty | Capability::InstanceOf => (&[I32, I32, I32], &[I32]),
            Capability::SetProperty
            | Capability::GetPropertyString
            | Capability::AddEventListener
            | Capability::RemoveEventListener => (&[I32, I32, I32, I32], &[]),
            Capability::GetPropertyF64 => (&[I32, I32, I32], &[F64]),
            Capability::SetPropertyF64 => (&[I32, I32, I32, F64], &[]),
            Capability::SetPropertyString => (&[I32, I32, I32, I32, I32], &[]),
            Capability::CallMethod | Capability::CallMethodF64 => (&[I32, I32, I32, I32, I32], &[I32]),
            Capability::Now => (&[], &[F64]),
        };
        AbiSignature { params, results }
    }

    /// Whether host failures are routed to the guest's exception store
    /// instead of trapping.
    pub fn catches(self) -> bool {
        matches!(
            self,
            Capability::JsonParse
                | Capability::Global
                | Capability::Get
                | Capability::Set
                | Capability::GetProperty
                | Capability::SetProperty
                | Capability::GetPropertyF64
                | Capability::SetPropertyF64
                | Capability::GetPropertyString
                | Capability::SetPropertyString
                | Capability::CallMethod
                | Capability::CallMethodF64
                | Capability::NewFunction
                | Capability::CallFunction
                | Capability::SetTimeout
                | Capability::RequestAnimationFrame
                | Capability::AddEventListener
                | Capability::RemoveEventListener
        )
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a shim did not produce a value.
enum CallError {
    /// The host threw
    Host(HostValue),
    /// Protocol violation or guest failure; always traps
    Bridge(BridgeError),
}

impl From<BridgeError> for CallError {
    fn from(e: BridgeError) -> Self {
        CallError::Bridge(e)
    }
}

type CallResult<T> = std::result::Result<T, CallError>;

type Ctx<'a, H> = Caller<'a, WasmHostState<H>>;

macro_rules! shim {
    ($linker:ident, $module:ident, $cap:ident, $body:ident($($arg:ident: $ty:ty),*) -> $ret:ty) => {
        $linker.func_wrap(
            $module,
            $cap.name(),
            move |mut caller: Ctx<'_, H>, $($arg: $ty),*| -> wasmtime::Result<$ret> {
                tracing::trace!(capability = $cap.name(), "host call");
                let result = $body(&mut caller, $($arg),*);
                finish(&mut caller, $cap, result)
            },
        )
    };
}

/// Register every capability under `module`.
pub(crate) fn register<H: HostEnvironment + 'static>(linker: &mut Linker<WasmHostState<H>>, module: &str) -> Result<()> {
    for &cap in Capability::ALL {
        register_capability(linker, module, cap)
            .map_err(|e| BridgeError::WasmError(format!("failed to register {}: {}", cap.name(), e)))?;
    }
    tracing::debug!(module, count = Capability::ALL.len(), "registered host capabilities");
    Ok(())
}

fn register_capability<H: HostEnvironment + 'static>(
    linker: &mut Linker<WasmHostState<H>>,
    module: &str,
    cap: Capability,
) -> wasmtime::Result<()> {
    match cap {
        Capability::ObjectDropRef => shim!(linker, module, cap, object_drop_ref(h: u32) -> ()),
        Capability::ObjectCloneRef => shim!(linker, module, cap, object_clone_ref(h: u32) -> u32),
        Capability::StringNew => shim!(linker, module, cap, string_new(ptr: u32, len: u32) -> u32),
        Capability::NumberNew => shim!(linker, module, cap, number_new(n: f64) -> u32),
        Capability::NumberGet => shim!(linker, module, cap, number_get(ret: u32, h: u32) -> ()),
        Capability::StringGet => shim!(linker, module, cap, string_get(ret: u32, h: u32) -> ()),
        Capability::IsUndefined => shim!(linker, module, cap, is_undefined(h: u32) -> u32),
        Capability::JsonParse => shim!(linker, module, cap, json_parse(ptr: u32, len: u32) -> u32),
        Capability::DebugString => shim!(linker, module, cap, debug_string(ret: u32, h: u32) -> ()),
        Capability::Throw => shim!(linker, module, cap, throw(ptr: u32, len: u32) -> ()),
        Capability::ErrorNew => shim!(linker, module, cap, error_new(ptr: u32, len: u32) -> u32),
        Capability::ErrorStack => shim!(linker, module, cap, error_stack(ret: u32, h: u32) -> ()),
        Capability::ClosureNew => {
            shim!(linker, module, cap, closure_new(a: u32, b: u32, dtor: u32, trampoline: u32) -> u32)
        }
        Capability::CbDrop => shim!(linker, module, cap, cb_drop(h: u32) -> u32),
        Capability::AbiVersion => shim!(linker, module, cap, abi_version() -> u32),
        Capability::Global => shim!(linker, module, cap, global(ptr: u32, len: u32) -> u32),
        Capability::Get => shim!(linker, module, cap, get(obj: u32, key: u32) -> u32),
        Capability::Set => shim!(linker, module, cap, set(obj: u32, key: u32, value: u32) -> ()),
        Capability::GetProperty => shim!(linker, module, cap, get_property(obj: u32, ptr: u32, len: u32) -> u32),
        Capability::SetProperty => {
            shim!(linker, module, cap, set_property(obj: u32, ptr: u32, len: u32, value: u32) -> ())
        }
        Capability::GetPropertyF64 => {
            shim!(linker, module, cap, get_property_f64(obj: u32, ptr: u32, len: u32) -> f64)
        }
        Capability::SetPropertyF64 => {
            shim!(linker, module, cap, set_property_f64(obj: u32, ptr: u32, len: u32, n: f64) -> ())
        }
        Capability::GetPropertyString => {
            shim!(linker, module, cap, get_property_string(ret: u32, obj: u32, ptr: u32, len: u32) -> ())
        }
        Capability::SetPropertyString => shim!(
            linker, module, cap,
            set_property_string(obj: u32, kptr: u32, klen: u32, vptr: u32, vlen: u32) -> ()
        ),
        Capability::InstanceOf => shim!(linker, module, cap, instance_of(h: u32, ptr: u32, len: u32) -> u32),
        Capability::CallMethod => shim!(
            linker, module, cap,
            call_method(obj: u32, ptr: u32, len: u32, args: u32, nargs: u32) -> u32
        ),
        Capability::CallMethodF64 => shim!(
            linker, module, cap,
            call_method_f64(obj: u32, ptr: u32, len: u32, args: u32, nargs: u32) -> u32
        ),
        Capability::NewFunction => shim!(linker, module, cap, new_function(ptr: u32, len: u32) -> u32),
        Capability::CallFunction => shim!(linker, module, cap, call_function(f: u32, this: u32) -> u32),
        Capability::ConsoleLog => shim!(linker, module, cap, console_log(level: i32, h: u32) -> ()),
        Capability::ConsoleErrorOwned => {
            shim!(linker, module, cap, console_error_owned(ptr: u32, len: u32) -> ())
        }
        Capability::SetTimeout => shim!(linker, module, cap, set_timeout(callback: u32, ms: i32) -> i32),
        Capability::RequestAnimationFrame => {
            shim!(linker, module, cap, request_animation_frame(callback: u32) -> i32)
        }
        Capability::AddEventListener => shim!(
            linker, module, cap,
            add_event_listener(target: u32, ptr: u32, len: u32, callback: u32) -> ()
        ),
        Capability::RemoveEventListener => shim!(
            linker, module, cap,
            remove_event_listener(target: u32, ptr: u32, len: u32, callback: u32) -> ()
        ),
        Capability::Now => shim!(linker, module, cap, now() -> f64),
    }?;
    Ok(())
}

/// Turn a shim outcome into a wasm result: values pass through, host throws
/// go to the exception store, everything else traps.
fn finish<H: 'static, T: Default>(caller: &mut Ctx<'_, H>, cap: Capability, result: CallResult<T>) -> wasmtime::Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(CallError::Bridge(e)) => {
            tracing::debug!(capability = cap.name(), "bridge failure: {}", e);
            Err(e.into())
        }
        Err(CallError::Host(thrown)) if cap.catches() => {
            store_exception(caller, cap, thrown)?;
            Ok(T::default())
        }
        Err(CallError::Host(thrown)) => Err(BridgeError::UncaughtHostException {
            capability: cap.name(),
            message: thrown.debug_string(),
        }
        .into()),
    }
}

fn store_exception<H: 'static>(caller: &mut Ctx<'_, H>, cap: Capability, thrown: HostValue) -> Result<()> {
    let exn_store = caller.data().exports.as_ref().and_then(|e| e.exn_store.clone());
    let Some(exn_store) = exn_store else {
        return Err(BridgeError::UncaughtHostException {
            capability: cap.name(),
            message: thrown.debug_string(),
        });
    };

    tracing::warn!(capability = cap.name(), "host exception: {}", thrown.debug_string());
    let state = caller.data_mut();
    let handle = state.bridge.add(thrown);
    state.bridge.note_exception();
    exn_store.call(&mut *caller, handle).map_err(guest_error)
}

// ============================================================================
// Helpers
// ============================================================================

fn guest<'a, H: 'static>(caller: &'a mut Ctx<'_, H>) -> Result<WasmGuest<'a, H>> {
    WasmGuest::new(caller.as_context_mut())
}

fn read_str<H: 'static>(caller: &mut Ctx<'_, H>, ptr: u32, len: u32) -> Result<String> {
    codec::decode(&mut guest(caller)?, ptr, len)
}

fn value<H: 'static>(caller: &Ctx<'_, H>, h: u32) -> Result<HostValue> {
    caller.data().bridge.get(h)
}

fn give<H: 'static>(caller: &mut Ctx<'_, H>, value: HostValue) -> u32 {
    caller.data_mut().bridge.add(value)
}

fn host<'a, H: 'static>(caller: &'a mut Ctx<'_, H>) -> &'a mut H {
    &mut caller.data_mut().host
}

fn write_span<H: 'static>(caller: &mut Ctx<'_, H>, ret: u32, span: Option<EncodedString>) -> Result<()> {
    let (ptr, len) = span.map_or((0, 0), |s| (s.ptr, s.len));
    let mut guest = guest(caller)?;
    let mut view = guest.i32_view();
    view.set(ret / 4, ptr as i32)?;
    view.set(ret / 4 + 1, len as i32)
}

fn return_string<H: 'static>(caller: &mut Ctx<'_, H>, ret: u32, text: Option<&str>) -> Result<()> {
    let span = match text {
        Some(text) => Some(codec::encode(&mut guest(caller)?, text)?),
        None => None,
    };
    write_span(caller, ret, span)
}

fn closure_call<H: 'static>(caller: &mut Ctx<'_, H>, function: &HostValue, arg: HostValue) -> Result<()> {
    let Some(closure) = function.as_closure() else {
        return Err(BridgeError::TypeMismatch {
            expected: "closure",
            found: function.type_name(),
        });
    };
    closure.check_callable()?;
    let state = caller.data_mut();
    let arg = state.bridge.add(arg);
    state.bridge.note_invocation();
    closure.invoke(&mut guest(caller)?, arg)
}

// ============================================================================
// Intrinsics
// ============================================================================

fn object_drop_ref<H: 'static>(caller: &mut Ctx<'_, H>, h: u32) -> CallResult<()> {
    Ok(caller.data_mut().bridge.drop_handle(h)?)
}

fn object_clone_ref<H: 'static>(caller: &mut Ctx<'_, H>, h: u32) -> CallResult<u32> {
    let value = value(caller, h)?;
    Ok(give(caller, value))
}

fn string_new<H: 'static>(caller: &mut Ctx<'_, H>, ptr: u32, len: u32) -> CallResult<u32> {
    let text = read_str(caller, ptr, len)?;
    Ok(give(caller, HostValue::String(text)))
}

fn number_new<H: 'static>(caller: &mut Ctx<'_, H>, n: f64) -> CallResult<u32> {
    Ok(give(caller, HostValue::Number(n)))
}

fn number_get<H: 'static>(caller: &mut Ctx<'_, H>, ret: u32, h: u32) -> CallResult<()> {
    let number = value(caller, h)?.as_number();
    let mut guest = guest(caller)?;
    guest.f64_view().set(ret / 8 + 1, number.unwrap_or(0.0))?;
    guest.i32_view().set(ret / 4, number.is_some() as i32)?;
    Ok(())
}

fn string_get<H: 'static>(caller: &mut Ctx<'_, H>, ret: u32, h: u32) -> CallResult<()> {
    let value = value(caller, h)?;
    Ok(return_string(caller, ret, value.as_str())?)
}

fn is_undefined<H: 'static>(caller: &mut Ctx<'_, H>, h: u32) -> CallResult<u32> {
    Ok(matches!(value(caller, h)?, HostValue::Undefined) as u32)
}

fn json_parse<H: 'static>(caller: &mut Ctx<'_, H>, ptr: u32, len: u32) -> CallResult<u32> {
    let text = read_str(caller, ptr, len)?;
    let json = serde_json::from_str::<serde_json::Value>(&text)
        .map_err(|e| CallError::Host(HostValue::error("SyntaxError", e.to_string())))?;
    Ok(give(caller, HostValue::from_json(json)))
}

fn debug_string<H: 'static>(caller: &mut Ctx<'_, H>, ret: u32, h: u32) -> CallResult<()> {
    let text = value(caller, h)?.debug_string();
    Ok(return_string(caller, ret, Some(&text))?)
}

fn throw<H: 'static>(caller: &mut Ctx<'_, H>, ptr: u32, len: u32) -> CallResult<()> {
    let message = read_str(caller, ptr, len)?;
    Err(BridgeError::GuestThrow(message).into())
}

fn error_new<H: 'static>(caller: &mut Ctx<'_, H>, ptr: u32, len: u32) -> CallResult<u32> {
    let message = read_str(caller, ptr, len)?;
    Ok(give(caller, HostValue::error("Error", message)))
}

fn error_stack<H: 'static>(caller: &mut Ctx<'_, H>, ret: u32, h: u32) -> CallResult<()> {
    let stack = match value(caller, h)?.property("stack") {
        HostValue::String(stack) => stack,
        _ => "Error\n    at <host>".to_string(),
    };
    Ok(return_string(caller, ret, Some(&stack))?)
}

fn closure_new<H: 'static>(caller: &mut Ctx<'_, H>, a: u32, b: u32, dtor: u32, trampoline: u32) -> CallResult<u32> {
    let closure = GuestClosure::wrap(a, b, dtor, trampoline);
    Ok(give(caller, HostValue::Closure(closure)))
}

fn cb_drop<H: 'static>(caller: &mut Ctx<'_, H>, h: u32) -> CallResult<u32> {
    let value = caller.data_mut().bridge.take(h)?;
    let closure = value.as_closure().ok_or(BridgeError::TypeMismatch {
        expected: "closure",
        found: value.type_name(),
    })?;
    Ok(closure.release()? as u32)
}

fn abi_version<H: 'static>(_caller: &mut Ctx<'_, H>) -> CallResult<u32> {
    Ok(ABI_VERSION)
}

// ============================================================================
// Properties and globals
// ============================================================================

fn global<H: HostEnvironment + 'static>(caller: &mut Ctx<'_, H>, ptr: u32, len: u32) -> CallResult<u32> {
    let name = read_str(caller, ptr, len)?;
    let value = host(caller).global(&name).map_err(CallError::Host)?;
    Ok(give(caller, value))
}

fn get<H: HostEnvironment + 'static>(caller: &mut Ctx<'_, H>, obj: u32, key: u32) -> CallResult<u32> {
    let target = value(caller, obj)?;
    let key = value(caller, key)?.to_property_key();
    let value = host(caller).get(&target, &key).map_err(CallError::Host)?;
    Ok(give(caller, value))
}

fn set<H: HostEnvironment + 'static>(caller: &mut Ctx<'_, H>, obj: u32, key: u32, value: u32) -> CallResult<()> {
    let target = self::value(caller, obj)?;
    let bridge = &mut caller.data_mut().bridge;
    // both handles are consumed, so check both before releasing either
    let key_value = bridge.get(key)?;
    let value_value = bridge.get(value)?;
    bridge.drop_handle(key)?;
    if value != key {
        bridge.drop_handle(value)?;
    }
    host(caller).set(&target, &key_value.to_property_key(), value_value).map_err(CallError::Host)
}

fn get_property<H: HostEnvironment + 'static>(caller: &mut Ctx<'_, H>, obj: u32, ptr: u32, len: u32) -> CallResult<u32> {
    let target = value(caller, obj)?;
    let key = read_str(caller, ptr, len)?;
    let value = host(caller).get(&target, &key).map_err(CallError::Host)?;
    Ok(give(caller, value))
}

fn set_property<H: HostEnvironment + 'static>(
    caller: &mut Ctx<'_, H>,
    obj: u32,
    ptr: u32,
    len: u32,
    value: u32,
) -> CallResult<()> {
    let target = self::value(caller, obj)?;
    let key = read_str(caller, ptr, len)?;
    let value = caller.data_mut().bridge.take(value)?;
    host(caller).set(&target, &key, value).map_err(CallError::Host)
}

fn get_property_f64<H: HostEnvironment + 'static>(caller: &mut Ctx<'_, H>, obj: u32, ptr: u32, len: u32) -> CallResult<f64> {
    let target = value(caller, obj)?;
    let key = read_str(caller, ptr, len)?;
    let value = host(caller).get(&target, &key).map_err(CallError::Host)?;
    Ok(value.as_number().unwrap_or(f64::NAN))
}

fn set_property_f64<H: HostEnvironment + 'static>(
    caller: &mut Ctx<'_, H>,
    obj: u32,
    ptr: u32,
    len: u32,
    n: f64,
) -> CallResult<()> {
    let target = value(caller, obj)?;
    let key = read_str(caller, ptr, len)?;
    host(caller)
        .set(&target, &key, HostValue::Number(n))
        .map_err(CallError::Host)
}

fn get_property_string<H: HostEnvironment + 'static>(
    caller: &mut Ctx<'_, H>,
    ret: u32,
    obj: u32,
    ptr: u32,
    len: u32,
) -> CallResult<()> {
    let target = value(caller, obj)?;
    let key = read_str(caller, ptr, len)?;
    let value = host(caller).get(&target, &key).map_err(CallError::Host)?;
    Ok(return_string(caller, ret, value.as_str())?)
}

fn set_property_string<H: HostEnvironment + 'static>(
    caller: &mut Ctx<'_, H>,
    obj: u32,
    kptr: u32,
    klen: u32,
    vptr: u32,
    vlen: u32,
) -> CallResult<()> {
    let target = value(caller, obj)?;
    let key = read_str(caller, kptr, klen)?;
    let text = read_str(caller, vptr, vlen)?;
    host(caller)
        .set(&target, &key, HostValue::String(text))
        .map_err(CallError::Host)
}

fn instance_of<H: HostEnvironment + 'static>(caller: &mut Ctx<'_, H>, h: u32, ptr: u32, len: u32) -> CallResult<u32> {
    let target = value(caller, h)?;
    let class = read_str(caller, ptr, len)?;
    Ok(caller.data().host.instance_of(&target, &class) as u32)
}

// ============================================================================
// Calls
// ============================================================================

fn call_method<H: HostEnvironment + 'static>(
    caller: &mut Ctx<'_, H>,
    obj: u32,
    ptr: u32,
    len: u32,
    args: u32,
    nargs: u32,
) -> CallResult<u32> {
    let target = value(caller, obj)?;
    let method = read_str(caller, ptr, len)?;
    let handles = {
        let mut guest = guest(caller)?;
        let view = guest.i32_view();
        (0..nargs)
            .map(|i| view.get(args / 4 + i).map(|h| h as u32))
            .collect::<Result<Vec<_>>>()?
    };
    let args = handles
        .into_iter()
        .map(|h| value(caller, h))
        .collect::<Result<Vec<_>>>()?;

    let result = host(caller)
        .call_method(&target, &method, &args)
        .map_err(CallError::Host)?;
    Ok(give(caller, result))
}

fn call_method_f64<H: HostEnvironment + 'static>(
    caller: &mut Ctx<'_, H>,
    obj: u32,
    ptr: u32,
    len: u32,
    args: u32,
    nargs: u32,
) -> CallResult<u32> {
    let target = value(caller, obj)?;
    let method = read_str(caller, ptr, len)?;
    let args = {
        let mut guest = guest(caller)?;
        let view = guest.f64_view();
        (0..nargs)
            .map(|i| view.get(args / 8 + i).map(HostValue::Number))
            .collect::<Result<Vec<_>>>()?
    };

    let result = host(caller)
        .call_method(&target, &method, &args)
        .map_err(CallError::Host)?;
    Ok(give(caller, result))
}

fn new_function<H: HostEnvironment + 'static>(caller: &mut Ctx<'_, H>, ptr: u32, len: u32) -> CallResult<u32> {
    let source = read_str(caller, ptr, len)?;
    let function = host(caller).compile_function(&source).map_err(CallError::Host)?;
    Ok(give(caller, function))
}

fn call_function<H: HostEnvironment + 'static>(caller: &mut Ctx<'_, H>, f: u32, this: u32) -> CallResult<u32> {
    let function = value(caller, f)?;
    let this = value(caller, this)?;
    if function.as_closure().is_some() {
        // guest closures return nothing across this ABI
        closure_call(caller, &function, this)?;
        return Ok(0);
    }
    let result = host(caller)
        .call_function(&function, &this)
        .map_err(CallError::Host)?;
    Ok(give(caller, result))
}

// ============================================================================
// Console, timers, events
// ============================================================================

fn console_log<H: HostEnvironment + 'static>(caller: &mut Ctx<'_, H>, level: i32, h: u32) -> CallResult<()> {
    let level = ConsoleLevel::from_abi(level).unwrap_or(ConsoleLevel::Log);
    let value = value(caller, h)?;
    let elements = value
        .as_object()
        .filter(|obj| obj.read().is_array())
        .map(|obj| obj.read().elements().to_vec());
    let args = elements.unwrap_or_else(|| vec![value]);
    host(caller).console(level, &args);
    Ok(())
}

fn console_error_owned<H: HostEnvironment + 'static>(caller: &mut Ctx<'_, H>, ptr: u32, len: u32) -> CallResult<()> {
    let text = read_str(caller, ptr, len)?;
    host(caller).console(ConsoleLevel::Error, &[HostValue::String(text)]);
    guest(caller)?.free(ptr, len)?;
    Ok(())
}

fn set_timeout<H: HostEnvironment + 'static>(caller: &mut Ctx<'_, H>, callback: u32, ms: i32) -> CallResult<i32> {
    let callback = value(caller, callback)?;
    host(caller).set_timeout(callback, ms).map_err(CallError::Host)
}

fn request_animation_frame<H: HostEnvironment + 'static>(caller: &mut Ctx<'_, H>, callback: u32) -> CallResult<i32> {
    let callback = value(caller, callback)?;
    host(caller)
        .request_animation_frame(callback)
        .map_err(CallError::Host)
}

fn add_event_listener<H: HostEnvironment + 'static>(
    caller: &mut Ctx<'_, H>,
    target: u32,
    ptr: u32,
    len: u32,
    callback: u32,
) -> CallResult<()> {
    let target = value(caller, target)?;
    let event_type = read_str(caller, ptr, len)?;
    let callback = value(caller, callback)?;
    host(caller)
        .add_event_listener(&target, &event_type, callback)
        .map_err(CallError::Host)
}

fn remove_event_listener<H: HostEnvironment + 'static>(
    caller: &mut Ctx<'_, H>,
    target: u32,
    ptr: u32,
    len: u32,
    callback: u32,
) -> CallResult<()> {
    let target = value(caller, target)?;
    let event_type = read_str(caller, ptr, len)?;
    let callback = value(caller, callback)?;
    host(caller)
        .remove_event_listener(&target, &event_type, &callback)
        .map(drop)
        .map_err(CallError::Host)
}

fn now<H: HostEnvironment + 'static>(caller: &mut Ctx<'_, H>) -> CallResult<f64> {
    Ok(caller.data().host.now())
}
