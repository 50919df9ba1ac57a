//! Integration tests driving the bridge through a real wasmtime guest.
//!
//! The guest is `tests/fixtures/bridge_guest.wat`: a bump allocator, one
//! closure trampoline/destructor pair and counters the tests read back.

use hostlink::wasm::{WasmConfig, WasmInstance, WasmSandbox};
use hostlink::{BridgeError, ClosureLifecycle, ConsoleLevel, HeadlessHost, HostValue};

const GUEST_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/bridge_guest.wat");

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("hostlink=debug")
        .try_init();
}

fn instance() -> WasmInstance<HeadlessHost> {
    init_tracing();
    let sandbox = WasmSandbox::new(WasmConfig::default()).expect("failed to create sandbox");
    let module = sandbox.load_module(GUEST_PATH).expect("failed to load guest");
    sandbox.instantiate_headless(&module).expect("failed to instantiate")
}

fn counter(instance: &mut WasmInstance<HeadlessHost>, name: &str) -> u32 {
    instance.call::<(), u32>(name, ()).expect("counter call failed").value
}

#[test]
fn test_load_guest_module() {
    let sandbox = WasmSandbox::new(WasmConfig::default()).expect("failed to create sandbox");
    let module = sandbox.load_module(GUEST_PATH).expect("failed to load guest");

    assert_eq!(module.name(), "bridge_guest");
    let exports: Vec<&str> = module.exports().collect();
    assert!(exports.contains(&"__hostlink_malloc"));
    assert!(exports.contains(&"__hostlink_exn_store"));
    assert!(exports.contains(&"log_hello"));
    assert_eq!(module.function_imports().len(), 11);
}

#[test]
fn test_console_log_from_guest() {
    let mut instance = instance();
    let live_before = instance.stats().live_handles;

    instance.call::<(), ()>("log_hello", ()).expect("log_hello failed");

    let console = instance.host().console_entries();
    assert_eq!(console.len(), 1);
    assert_eq!(console[0].level, ConsoleLevel::Log);
    assert_eq!(console[0].text, "hello from wasm");
    assert_eq!(instance.stats().live_handles, live_before);
}

#[test]
fn test_string_round_trip_through_guest() {
    let mut instance = instance();
    let text = "abc€€€";

    let span = instance.pass_string(text).expect("pass_string failed");
    assert_eq!(span.len as usize, text.len());
    assert!(span.capacity >= span.len);
    assert_eq!(instance.read_string(span.ptr, span.len).unwrap(), text);

    let h = instance
        .call::<(u32, u32), u32>("echo", (span.ptr, span.len))
        .expect("echo failed")
        .value;
    assert_eq!(instance.value(h).unwrap(), HostValue::string(text));
}

#[test]
fn test_empty_string_and_call_str() {
    let mut instance = instance();

    let h = instance.call_str::<u32>("echo", "").expect("echo failed").value;
    assert_eq!(instance.take_value(h).unwrap(), HostValue::string(""));
    assert!(instance.value(h).is_err());
}

#[test]
fn test_invalid_utf8_traps() {
    let mut instance = instance();
    let err = instance.call::<(), u32>("bad_utf8", ()).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidUtf8 { ptr: 80, len: 2, .. }), "got {:?}", err);
}

#[test]
fn test_guest_throw_traps() {
    let mut instance = instance();
    let err = instance.call::<(), ()>("fail", ()).unwrap_err();
    assert!(matches!(err, BridgeError::GuestThrow(ref msg) if msg == "boom"), "got {:?}", err);
}

#[test]
fn test_handles_are_generation_checked() {
    let mut instance = instance();
    let live_before = instance.stats().live_handles;

    let h = instance.call::<f64, u32>("number", 2.5).unwrap().value;
    assert_eq!(instance.stats().live_handles, live_before + 1);
    assert_eq!(instance.value(h).unwrap(), HostValue::Number(2.5));

    instance.call::<u32, ()>("drop_ref", h).unwrap();
    assert_eq!(instance.stats().live_handles, live_before);

    // the slot is reused under a new generation
    let reused = instance.call::<f64, u32>("number", 7.0).unwrap().value;
    assert_ne!(reused, h);
    assert_eq!(reused & 0x00ff_ffff, h & 0x00ff_ffff);

    let err = instance.call::<u32, ()>("drop_ref", h).unwrap_err();
    assert!(matches!(err, BridgeError::StaleHandle { .. }), "got {:?}", err);
    assert_eq!(instance.value(reused).unwrap(), HostValue::Number(7.0));
}

#[test]
fn test_closure_invoked_twice_then_released() {
    let mut instance = instance();
    let h = instance.call::<(), u32>("make_closure", ()).unwrap().value;
    let closure = instance.value(h).unwrap();

    instance.invoke_closure(&closure, HostValue::Number(1.0)).unwrap();
    instance.invoke_closure(&closure, HostValue::Number(2.0)).unwrap();
    assert_eq!(counter(&mut instance, "calls"), 2);
    assert_eq!(counter(&mut instance, "last_env"), 42);

    let arg = counter(&mut instance, "last_arg");
    assert_eq!(instance.value(arg).unwrap(), HostValue::Number(2.0));
    assert_eq!(counter(&mut instance, "destroyed"), 0);

    assert!(instance.release_closure(&closure).unwrap());
    assert_eq!(counter(&mut instance, "destroyed"), 1);

    let err = instance.invoke_closure(&closure, HostValue::Null).unwrap_err();
    assert!(matches!(err, BridgeError::ClosureDestroyed));
    assert_eq!(counter(&mut instance, "destroyed"), 1);

    let stats = instance.stats();
    assert_eq!(stats.closures_invoked, 2);
    assert_eq!(stats.closures_finalized, 1);
}

#[test]
fn test_guest_drop_hands_back_environment() {
    let mut instance = instance();
    let h = instance.call::<(), u32>("make_closure", ()).unwrap().value;
    let closure = instance.value(h).unwrap();

    // last reference: the guest frees the environment itself
    assert_eq!(instance.call::<u32, u32>("drop_closure", h).unwrap().value, 1);
    assert_eq!(counter(&mut instance, "destroyed"), 0);
    assert!(instance.value(h).is_err());

    let err = instance.invoke_closure(&closure, HostValue::Null).unwrap_err();
    assert!(matches!(err, BridgeError::ClosureDestroyed));
}

#[test]
fn test_rejected_invocation_does_not_leak_argument() {
    let mut instance = instance();
    let h = instance.call::<(), u32>("make_closure", ()).unwrap().value;
    let closure = instance.value(h).unwrap();
    assert_eq!(instance.call::<u32, u32>("drop_closure", h).unwrap().value, 1);
    let live_before = instance.stats().live_handles;

    for _ in 0..5 {
        let err = instance.invoke_closure(&closure, HostValue::string("evt")).unwrap_err();
        assert!(matches!(err, BridgeError::ClosureDestroyed), "got {:?}", err);
    }
    assert_eq!(instance.stats().live_handles, live_before);
    assert_eq!(instance.stats().closures_invoked, 0);
    assert_eq!(counter(&mut instance, "calls"), 0);
}

#[test]
fn test_failing_frame_does_not_drop_later_frames() {
    let mut instance = instance();
    let broken = instance.call::<(), u32>("broken_closure", ()).unwrap().value;
    let good = instance.call::<(), u32>("make_closure", ()).unwrap().value;
    instance.call::<u32, i32>("animate", broken).unwrap();
    instance.call::<u32, i32>("animate", good).unwrap();
    assert_eq!(instance.host().pending_frames(), 2);

    assert!(instance.advance(16.0).is_err());
    assert_eq!(counter(&mut instance, "calls"), 1);
    assert_eq!(instance.host().pending_frames(), 0);
}

#[test]
fn test_failing_listener_does_not_stop_dispatch() {
    let mut instance = instance();
    let broken = instance.call::<(), u32>("broken_closure", ()).unwrap().value;
    let good = instance.call::<(), u32>("make_closure", ()).unwrap().value;
    instance.call::<u32, ()>("listen", broken).unwrap();
    instance.call::<u32, ()>("listen", good).unwrap();

    let window = instance.host().window();
    let event = HeadlessHost::event("MouseEvent", [("clientX", HostValue::Number(1.0))]);
    assert!(instance.dispatch_event(&window, "click", event).is_err());
    assert_eq!(counter(&mut instance, "calls"), 1);
}

#[test]
fn test_broken_trampoline_keeps_closure_alive() {
    let mut instance = instance();
    let h = instance.call::<(), u32>("broken_closure", ()).unwrap().value;
    let closure = instance.value(h).unwrap();

    assert!(instance.invoke_closure(&closure, HostValue::Null).is_err());
    let lifecycle = closure.as_closure().map(|c| c.lifecycle());
    assert_eq!(lifecycle, Some(ClosureLifecycle::Live(1)));
}

#[test]
fn test_event_listener_dispatch() {
    let mut instance = instance();
    let h = instance.call::<(), u32>("make_closure", ()).unwrap().value;
    instance.call::<u32, ()>("listen", h).unwrap();
    assert_eq!(instance.host().listener_count(), 1);

    let window = instance.host().window();
    let event = HeadlessHost::event("MouseEvent", [("clientX", HostValue::Number(3.0))]);

    assert_eq!(instance.dispatch_event(&window, "click", event.clone()).unwrap(), 1);
    assert_eq!(instance.dispatch_event(&window, "keydown", event.clone()).unwrap(), 0);
    assert_eq!(counter(&mut instance, "calls"), 1);

    let arg = counter(&mut instance, "last_arg");
    assert_eq!(instance.value(arg).unwrap(), event);
}

#[test]
fn test_animation_frame_gets_timestamp() {
    let mut instance = instance();
    let h = instance.call::<(), u32>("make_closure", ()).unwrap().value;
    let id = instance.call::<u32, i32>("animate", h).unwrap().value;
    assert!(id > 0);
    assert_eq!(instance.host().pending_frames(), 1);

    assert_eq!(instance.advance(16.0).unwrap(), 1);
    let arg = counter(&mut instance, "last_arg");
    assert_eq!(instance.value(arg).unwrap(), HostValue::Number(16.0));

    // frames are one-shot
    assert_eq!(instance.advance(16.0).unwrap(), 0);
    assert_eq!(counter(&mut instance, "calls"), 1);
}

#[test]
fn test_host_exception_goes_to_store() {
    let mut instance = instance();

    let result = instance.call::<(), u32>("missing_method", ()).unwrap().value;
    assert_eq!(result, 0);

    let exn = counter(&mut instance, "exception");
    let thrown = instance.value(exn).unwrap();
    assert_eq!(thrown.property("name"), HostValue::string("TypeError"));
    assert_eq!(instance.stats().exceptions_stored, 1);
    assert!(instance.host().calls().is_empty());
}

#[test]
fn test_host_exception_without_store_traps() {
    init_tracing();
    let sandbox = WasmSandbox::new(WasmConfig::default()).unwrap();
    let module = sandbox
        .load_module_bytes(
            "no_store",
            r#"(module
                 (import "hostlink" "global" (func $global (param i32 i32) (result i32)))
                 (memory (export "memory") 1)
                 (data (i32.const 0) "alert")
                 (func (export "run") (result i32)
                   (call $global (i32.const 0) (i32.const 5))))"#,
        )
        .unwrap();
    let mut instance = sandbox.instantiate_headless(&module).unwrap();

    let err = instance.call::<(), u32>("run", ()).unwrap_err();
    match err {
        BridgeError::UncaughtHostException { capability, message } => {
            assert_eq!(capability, "global");
            assert!(message.contains("ReferenceError"), "message: {}", message);
        }
        other => panic!("expected uncaught host exception, got {:?}", other),
    }
}

#[test]
fn test_memory_growth_rebuilds_views() {
    let mut instance = instance();

    let first = instance.pass_string("before growth").unwrap();
    let rebuilds = instance.stats().view_rebuilds;
    assert!(rebuilds >= 1);

    let old_pages = instance.call::<u32, i32>("grow", 2).unwrap().value;
    assert_eq!(old_pages, 1);
    assert_eq!(instance.memory_size().unwrap(), 3 * 65536);

    let second = instance.pass_string("after growth").unwrap();
    assert!(instance.stats().view_rebuilds > rebuilds);
    assert_eq!(instance.read_string(first.ptr, first.len).unwrap(), "before growth");
    assert_eq!(instance.read_string(second.ptr, second.len).unwrap(), "after growth");
}

#[test]
fn test_fuel_limit_applies_to_guest() {
    let sandbox = WasmSandbox::new(WasmConfig::minimal()).unwrap();
    let module = sandbox.load_module(GUEST_PATH).unwrap();
    let mut instance = sandbox.instantiate_headless(&module).unwrap();

    let result = instance.call::<(), ()>("log_hello", ()).unwrap();
    assert!(result.fuel_consumed.is_some());
    assert!(instance.remaining_fuel().is_some());
}
