//! Tests for sandbox configuration and the capability table.

use super::*;
use crate::error::BridgeError;
use crate::host::ViewportConfig;
use crate::value::HostValue;

use std::collections::HashSet;
use wasmtime::{Engine, FuncType, ValType};

#[test]
fn test_wasm_config_default() {
    let config = WasmConfig::default();
    assert_eq!(config.max_memory, 256 * 1024 * 1024);
    assert_eq!(config.import_module, "hostlink");
    assert!(!config.link_wasi);
    assert!(config.enable_simd);
    assert!(config.fuel_limit.is_none());
}

#[test]
fn test_wasm_config_minimal() {
    let config = WasmConfig::minimal();
    assert_eq!(config.max_memory, 64 * 1024 * 1024);
    assert!(config.fuel_limit.is_some());
}

#[test]
fn test_wasm_config_development() {
    let config = WasmConfig::development();
    assert!(config.link_wasi);
    assert!(config.capabilities.stdout);
    assert!(config.capabilities.stderr);
    assert_eq!(config.optimization_level, 0);
}

#[test]
fn test_wasm_config_builder() {
    let config = WasmConfig::default()
        .import_module("env")
        .max_memory(1 << 20)
        .fuel_limit(500)
        .optimize(9)
        .viewport(ViewportConfig {
            inner_width: 320.0,
            ..Default::default()
        });

    assert_eq!(config.import_module, "env");
    assert_eq!(config.max_memory, 1 << 20);
    assert_eq!(config.fuel_limit, Some(500));
    assert_eq!(config.optimization_level, 2);
    assert_eq!(config.viewport.inner_width, 320.0);
}

#[test]
fn test_wasi_capabilities_builder() {
    let caps = WasiCapabilities::none()
        .stdout(true)
        .env("DEBUG", "1")
        .arg("--verbose");

    assert!(caps.stdout);
    assert!(!caps.stderr);
    assert_eq!(caps.env_vars.len(), 1);
    assert_eq!(caps.args.len(), 1);
}

#[test]
fn test_config_from_json_fills_defaults() {
    let config = WasmConfig::from_json(r#"{ "fuel_limit": 1000, "viewport": { "inner_width": 1280 } }"#).unwrap();
    assert_eq!(config.fuel_limit, Some(1000));
    assert_eq!(config.viewport.inner_width, 1280.0);
    assert_eq!(config.viewport.inner_height, 600.0);
    assert_eq!(config.import_module, DEFAULT_IMPORT_MODULE);
}

#[test]
fn test_config_json_roundtrip() {
    let config = WasmConfig::development().import_module("ui");
    let json = serde_json::to_string(&config).unwrap();
    assert_eq!(WasmConfig::from_json(&json).unwrap(), config);
}

#[test]
fn test_config_validation() {
    assert!(matches!(
        WasmConfig::from_json(r#"{ "import_module": "" }"#),
        Err(BridgeError::ConfigError(_))
    ));
    assert!(matches!(
        WasmConfig::from_json(r#"{ "import_module": "wasi_snapshot_preview1" }"#),
        Err(BridgeError::ConfigError(_))
    ));
    assert!(matches!(WasmConfig::from_json("{ nope"), Err(BridgeError::Json(_))));
}

#[test]
fn test_config_from_missing_file() {
    assert!(matches!(
        WasmConfig::from_json_file("/nonexistent/hostlink.json"),
        Err(BridgeError::Io(_))
    ));
}

#[test]
fn test_sandbox_creation() {
    let sandbox = WasmSandbox::new(WasmConfig::default());
    assert!(sandbox.is_ok());
    assert!(WasmSandbox::new(WasmConfig::default().max_memory(0)).is_err());
}

#[test]
fn test_capability_names_unique() {
    let names: HashSet<_> = Capability::ALL.iter().map(|c| c.name()).collect();
    assert_eq!(names.len(), Capability::ALL.len());
    for &cap in Capability::ALL {
        assert_eq!(Capability::from_name(cap.name()), Some(cap));
    }
    assert_eq!(Capability::from_name("eval"), None);
}

#[test]
fn test_capability_signatures() {
    assert_eq!(Capability::GetProperty.signature().to_string(), "(i32, i32, i32) -> i32");
    assert_eq!(Capability::SetPropertyF64.signature().to_string(), "(i32, i32, i32, f64)");
    assert_eq!(Capability::Now.signature().to_string(), "() -> f64");
    assert_eq!(Capability::NumberNew.signature().to_string(), "(f64) -> i32");
    for &cap in Capability::ALL {
        assert!(cap.signature().results.len() <= 1, "{} returns at most one value", cap);
    }
}

#[test]
fn test_catching_capabilities() {
    assert!(Capability::CallMethod.catches());
    assert!(Capability::JsonParse.catches());
    assert!(Capability::Global.catches());
    assert!(!Capability::Throw.catches());
    assert!(!Capability::ObjectDropRef.catches());
    assert!(!Capability::ConsoleLog.catches());
}

#[test]
fn test_check_import() {
    let engine = Engine::default();
    let good = FuncType::new(&engine, [ValType::I32, ValType::I32, ValType::I32], [ValType::I32]);
    let bad = FuncType::new(&engine, [ValType::I32], [ValType::I32]);

    assert_eq!(check_import("get_property", &good), ImportCheck::Ok(Capability::GetProperty));
    assert!(matches!(
        check_import("get_property", &bad),
        ImportCheck::SignatureMismatch {
            capability: Capability::GetProperty,
            ..
        }
    ));
    assert_eq!(check_import("alert", &good), ImportCheck::Unknown);
}

#[test]
fn test_guest_without_memory_rejected() {
    let sandbox = WasmSandbox::new(WasmConfig::default()).unwrap();
    let module = sandbox.load_module_bytes("empty", "(module)").unwrap();
    let err = sandbox.instantiate_headless(&module).err().unwrap();
    assert!(matches!(err, BridgeError::MissingExport(name) if name == "memory"));
}

#[test]
fn test_missing_allocator_reported_when_needed() {
    let sandbox = WasmSandbox::new(WasmConfig::default()).unwrap();
    let module = sandbox
        .load_module_bytes("bare", r#"(module (memory (export "memory") 1))"#)
        .unwrap();
    let mut instance = sandbox.instantiate_headless(&module).unwrap();

    let err = instance.pass_string("hi").unwrap_err();
    assert!(matches!(err, BridgeError::MissingExport(name) if name == MALLOC_EXPORT));
    assert_eq!(instance.memory_size().unwrap(), 65536);
}

#[test]
fn test_unknown_import_fails_instantiation() {
    let sandbox = WasmSandbox::new(WasmConfig::default()).unwrap();
    let module = sandbox
        .load_module_bytes(
            "bad",
            r#"(module
                 (import "hostlink" "eval" (func (param i32 i32)))
                 (memory (export "memory") 1))"#,
        )
        .unwrap();
    assert!(matches!(
        sandbox.instantiate_headless(&module),
        Err(BridgeError::WasmError(_))
    ));
}

#[test]
fn test_abi_version_import() {
    let sandbox = WasmSandbox::new(WasmConfig::default()).unwrap();
    let module = sandbox
        .load_module_bytes(
            "version",
            r#"(module
                 (import "hostlink" "abi_version" (func $abi_version (result i32)))
                 (memory (export "memory") 1)
                 (func (export "version") (result i32) call $abi_version))"#,
        )
        .unwrap();
    let mut instance = sandbox.instantiate_headless(&module).unwrap();
    let result = instance.call::<(), i32>("version", ()).unwrap();
    assert_eq!(result.value as u32, ABI_VERSION);
}

#[test]
fn test_custom_import_module() {
    let sandbox = WasmSandbox::new(WasmConfig::default().import_module("env")).unwrap();
    let module = sandbox
        .load_module_bytes(
            "env",
            r#"(module
                 (import "env" "now" (func $now (result f64)))
                 (memory (export "memory") 1)
                 (func (export "clock") (result f64) call $now))"#,
        )
        .unwrap();
    let mut instance = sandbox.instantiate_headless(&module).unwrap();
    instance.host_mut().advance(250.0);
    assert_eq!(instance.call::<(), f64>("clock", ()).unwrap().value, 250.0);
}

#[test]
fn test_set_with_stale_value_keeps_key() {
    let sandbox = WasmSandbox::new(WasmConfig::default()).unwrap();
    let module = sandbox
        .load_module_bytes(
            "setter",
            r#"(module
                 (import "hostlink" "set" (func $set (param i32 i32 i32)))
                 (memory (export "memory") 1)
                 (func (export "set") (param i32 i32 i32)
                   (call $set (local.get 0) (local.get 1) (local.get 2))))"#,
        )
        .unwrap();
    let mut instance = sandbox.instantiate_headless(&module).unwrap();

    let window = instance.host().window();
    let target = instance.add_value(window.clone());
    let key = instance.add_value(HostValue::string("answer"));
    let stale = instance.add_value(HostValue::Number(42.0));
    instance.drop_value(stale).unwrap();

    let err = instance.call::<(u32, u32, u32), ()>("set", (target, key, stale)).unwrap_err();
    assert!(matches!(err, BridgeError::StaleHandle { .. }), "got {:?}", err);
    assert_eq!(instance.value(key).unwrap(), HostValue::string("answer"));

    let value = instance.add_value(HostValue::Number(42.0));
    instance.call::<(u32, u32, u32), ()>("set", (target, key, value)).unwrap();
    assert!(instance.value(key).is_err());
    assert!(instance.value(value).is_err());
    assert_eq!(window.property("answer"), HostValue::Number(42.0));
}
