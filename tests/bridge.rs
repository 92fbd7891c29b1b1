use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use pyhook::{
    BridgeConfig, BufferData, CallDescriptor, ElementType, Error, ErrorKind, NativeValue,
    NumericBuffer, RuntimeHandle,
};
use pyo3::prelude::*;
use tempfile::tempdir;

const ARRAYS: &str = "bridge_samples.arrays";
const PROBE: &str = "bridge_samples.probe";

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures")
}

fn runtime() -> RuntimeHandle {
    let runtime =
        RuntimeHandle::with_config(BridgeConfig::empty().with_search_path_root(fixtures()));
    runtime.start().expect("runtime should start");
    runtime
}

fn call(
    runtime: &RuntimeHandle,
    module: &str,
    function: &str,
    args: Vec<NativeValue>,
) -> NativeValue {
    runtime
        .call_with(module, function, args)
        .unwrap_or_else(|e| panic!("{module}.{function} failed: {e}"))
}

fn call_error(
    runtime: &RuntimeHandle,
    module: &str,
    function: &str,
    args: Vec<NativeValue>,
) -> Error {
    match runtime.call_with(module, function, args) {
        Ok(value) => panic!("expected {module}.{function} to fail, got {value}"),
        Err(err) => err,
    }
}

#[test]
fn adds_arrays_element_wise() {
    let runtime = runtime();
    let sum = call(
        &runtime,
        ARRAYS,
        "add_arrays",
        vec![vec![1.0, 2.0, 3.0].into(), vec![4.0, 5.0, 6.0].into()],
    );
    assert_eq!(sum.as_f64_vec(), Some(vec![5.0, 7.0, 9.0]));
}

#[test]
fn multiplies_matrices() {
    let runtime = runtime();
    let product = call(
        &runtime,
        ARRAYS,
        "matrix_multiply",
        vec![
            vec![vec![1i64, 2], vec![3, 4]].into(),
            vec![vec![5i64, 6], vec![7, 8]].into(),
        ],
    );
    assert_eq!(
        product.as_f64_rows(),
        Some(vec![vec![19.0, 22.0], vec![43.0, 50.0]])
    );
}

#[test]
fn computes_statistics_into_a_map() {
    let runtime = runtime();
    let stats = call(
        &runtime,
        ARRAYS,
        "array_statistics",
        vec![vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0].into()],
    );
    let field = |key: &str| stats.get(key).and_then(NativeValue::as_f64).unwrap();
    assert_eq!(field("mean"), 3.5);
    assert_eq!(field("min"), 1.0);
    assert_eq!(field("max"), 6.0);
    assert!((field("std") - 1.707_825_127_659_933).abs() < 1e-6);
    assert_eq!(stats.get("count"), Some(&NativeValue::Int(6)));
}

#[test]
fn scalar_results_convert_directly() {
    let runtime = runtime();
    let dot = call(
        &runtime,
        ARRAYS,
        "dot_product",
        vec![vec![1.0, 2.0, 3.0].into(), vec![4.0, 5.0, 6.0].into()],
    );
    assert_eq!(dot, NativeValue::Float(32.0));
}

#[test]
fn missing_module_is_module_not_found() {
    let runtime = runtime();
    let err = call_error(&runtime, "pyhook_definitely_missing", "f", vec![]);
    assert_eq!(err.kind(), ErrorKind::ModuleNotFound);
    let msg = err.to_string();
    assert!(
        msg.starts_with("Failed to import pyhook_definitely_missing.f: "),
        "{msg}"
    );
    assert!(msg.contains("No module named 'pyhook_definitely_missing'"), "{msg}");
}

#[test]
fn missing_function_is_attribute_not_found() {
    let runtime = runtime();
    let err = call_error(&runtime, PROBE, "no_such_function", vec![]);
    assert_eq!(err.kind(), ErrorKind::AttributeNotFound);
    let msg = err.to_string();
    assert!(
        msg.starts_with("Failed to get attribute bridge_samples.probe.no_such_function: "),
        "{msg}"
    );
    assert!(msg.contains("AttributeError"), "{msg}");
}

#[test]
fn exceptions_inside_the_function_are_translated() {
    let runtime = runtime();
    let err = call_error(&runtime, PROBE, "fail", vec!["boom".into()]);
    assert_eq!(err.kind(), ErrorKind::ForeignExecution);
    let msg = err.to_string();
    assert!(msg.starts_with("Failed to call bridge_samples.probe.fail: "), "{msg}");
    assert!(msg.contains("ValueError: boom"), "{msg}");
    assert!(!err.is_fatal());

    // The runtime stays usable after a translated failure.
    assert_eq!(call(&runtime, PROBE, "nothing", vec![]), NativeValue::None);
}

#[test]
fn exception_at_import_time_fails_resolution() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("pyhook_broken_module.py"),
        "raise RuntimeError('cannot load me')\n",
    )
    .unwrap();
    let runtime = runtime();
    runtime.add_search_path(dir.path()).unwrap();

    let err = call_error(&runtime, "pyhook_broken_module", "f", vec![]);
    assert_eq!(err.kind(), ErrorKind::ModuleNotFound);
    assert!(err.to_string().contains("RuntimeError: cannot load me"), "{err}");
}

#[test]
fn ragged_rows_fail_before_the_call() {
    let runtime = runtime();
    let ragged: NativeValue = vec![vec![1.0, 2.0], vec![3.0]].into();
    let err = call_error(&runtime, ARRAYS, "matrix_multiply", vec![ragged.clone(), ragged]);
    assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
    match err {
        Error::ShapeMismatch { index, .. } => assert_eq!(index, 0),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn rows_with_mixed_element_types_are_argument_conversion_errors() {
    let runtime = runtime();
    let rows = NativeValue::Sequence(vec![vec![1i64, 2].into(), vec![3.0, 4.0].into()]);
    let err = call_error(&runtime, PROBE, "echo", vec![rows]);
    assert_eq!(err.kind(), ErrorKind::ArgumentConversion);
}

#[test]
fn partly_numeric_rows_travel_as_plain_lists() {
    let runtime = runtime();
    let rows = [
        NativeValue::Sequence(vec![
            vec![1i64, 2].into(),
            NativeValue::Sequence(vec![3i64.into(), "x".into()]),
        ]),
        NativeValue::Sequence(vec![
            NativeValue::Sequence(vec![1i64.into(), "a".into()]),
            NativeValue::Sequence(vec![2i64.into(), "b".into()]),
        ]),
    ];
    for value in rows {
        let echoed = call(&runtime, PROBE, "echo", vec![value.clone()]);
        assert_eq!(echoed, value);
    }
}

#[test]
fn arguments_are_passed_positionally_in_order() {
    let runtime = runtime();
    let joined = call(
        &runtime,
        PROBE,
        "concat",
        vec!["a".into(), 1i64.into(), "b".into(), true.into()],
    );
    assert_eq!(joined, NativeValue::from("a1bTrue"));
    assert_eq!(call(&runtime, PROBE, "count_args", vec![]), NativeValue::Int(0));
    assert_eq!(
        call(&runtime, PROBE, "count_args", vec![1i64.into(), NativeValue::None, "x".into()]),
        NativeValue::Int(3)
    );
}

#[test]
fn optional_arguments_use_none_not_sentinels() {
    let runtime = runtime();
    let unset = call(&runtime, PROBE, "workers", vec![None::<i64>.into()]);
    assert_eq!(unset, NativeValue::from("default"));
    let zero = call(&runtime, PROBE, "workers", vec![Some(0i64).into()]);
    assert_eq!(zero, NativeValue::Int(0));
}

#[test]
fn numeric_buffers_round_trip_bit_for_bit() {
    let runtime = runtime();
    let buffers = vec![
        NumericBuffer::from_rows(&[vec![1.5f64, -0.0, f64::MAX], vec![1e-300, 2.0, 3.0]]).unwrap(),
        NumericBuffer::from_vec(vec![0.1f32, 1.0e-7, -3.25]),
        NumericBuffer::from_rows(&[vec![i64::MIN, 0], vec![1, i64::MAX]]).unwrap(),
        NumericBuffer::from_vec(vec![i32::MIN, -1, 0, i32::MAX]),
        NumericBuffer::from_rows(&[vec![0u8, 255], vec![7, 8]]).unwrap(),
    ];
    for buffer in buffers {
        let back = call(&runtime, PROBE, "echo", vec![buffer.clone().into()]);
        assert_eq!(back, NativeValue::Buffer(buffer));
    }
}

#[test]
fn uniform_sequences_arrive_as_shaped_buffers() {
    let runtime = runtime();
    let matrix: NativeValue = vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]].into();
    let shape = call(&runtime, ARRAYS, "buffer_shape", vec![matrix]);
    assert_eq!(shape, NativeValue::from(vec![2i64, 3]));

    let echoed = call(&runtime, PROBE, "echo", vec![vec![1i64, 2, 3].into()]);
    let buffer = echoed.as_buffer().expect("ints travel as a buffer");
    assert_eq!(buffer.element(), ElementType::I64);
    assert_eq!(buffer.as_slice::<i64>(), Some(&[1, 2, 3][..]));
}

#[test]
fn buffers_built_in_python_keep_shape_and_element_type() {
    let runtime = runtime();
    let result = call(
        &runtime,
        ARRAYS,
        "make_buffer",
        vec!["i".into(), vec![2i64, 2].into(), vec![1i64, 2, 3, 4].into()],
    );
    let buffer = result.as_buffer().expect("memoryview converts to a buffer");
    assert_eq!(buffer.shape(), &[2, 2]);
    assert_eq!(buffer.data(), &BufferData::I32(vec![1, 2, 3, 4]));
    assert_eq!(buffer.get(&[1, 0]), Some(NativeValue::Int(3)));
}

#[test]
fn structured_values_round_trip() {
    let runtime = runtime();
    let mut inner = BTreeMap::new();
    inner.insert("flag".to_owned(), NativeValue::Bool(false));
    inner.insert("missing".to_owned(), NativeValue::None);
    let mut map = BTreeMap::new();
    map.insert("name".to_owned(), NativeValue::from("resnet18"));
    map.insert("tags".to_owned(), NativeValue::from(vec!["a", "b"]));
    map.insert("nested".to_owned(), NativeValue::Map(inner));
    map.insert("ratio".to_owned(), NativeValue::Float(0.25));
    let value = NativeValue::Map(map);

    assert_eq!(call(&runtime, PROBE, "echo", vec![value.clone()]), value);
    assert_eq!(
        call(&runtime, PROBE, "pair", vec![]),
        NativeValue::Sequence(vec![NativeValue::Int(1), NativeValue::from("two")])
    );
}

#[test]
fn lists_of_records_convert_element_wise() {
    let runtime = runtime();
    let records = call(&runtime, PROBE, "records", vec![]);
    let records = records.as_sequence().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].get("name"), Some(&NativeValue::from("a")));
    assert_eq!(records[0].get("score"), Some(&NativeValue::Float(1.5)));
    assert_eq!(records[1].get("score"), Some(&NativeValue::Int(2)));
}

#[test]
fn unconvertible_results_are_reported() {
    let runtime = runtime();
    for function in ["big_int", "opaque", "int_keys"] {
        let err = call_error(&runtime, PROBE, function, vec![]);
        assert_eq!(err.kind(), ErrorKind::ResultConversion, "{function}: {err}");
        assert!(err
            .to_string()
            .starts_with(&format!("Failed to convert result of bridge_samples.probe.{function}: ")));
    }
}

#[test]
fn module_attributes_are_readable() {
    let runtime = runtime();
    assert_eq!(
        runtime.get_attr(PROBE, "VERSION").unwrap(),
        NativeValue::from("1.2.3")
    );
    let err = runtime.get_attr(PROBE, "MISSING").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AttributeNotFound);
}

#[test]
fn imported_modules_are_usable_handles() {
    let runtime = runtime();
    let module = runtime.import_module(ARRAYS).unwrap();
    assert_eq!(module.label(), ARRAYS);

    let dot = module.getattr("dot_product").unwrap();
    assert_eq!(dot.label(), "bridge_samples.arrays.dot_product");
    let result = dot
        .call(&[NativeValue::from(vec![1.0, 0.0]), NativeValue::from(vec![2.0, 5.0])])
        .unwrap();
    assert_eq!(result, NativeValue::Float(2.0));

    let err = module.getattr("nope").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AttributeNotFound);

    let err = runtime.import_module("pyhook_definitely_missing").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModuleNotFound);
    assert!(err
        .to_string()
        .starts_with("Failed to import pyhook_definitely_missing: "));

    assert!(runtime.is_module_available("json"));
    assert!(!runtime.is_module_available("pyhook_definitely_missing"));
}

#[test]
fn foreign_handles_expose_the_bound_object() {
    let runtime = runtime();
    let version = runtime.import_module(PROBE).unwrap().getattr("VERSION").unwrap();
    assert_eq!(version.to_native().unwrap(), NativeValue::from("1.2.3"));
    let length = version.with_bound(|obj| obj.len().unwrap()).unwrap();
    assert_eq!(length, 5);
}

#[test]
fn calls_start_the_runtime_implicitly() {
    let runtime =
        RuntimeHandle::with_config(BridgeConfig::empty().with_search_path_root(fixtures()));
    assert!(!runtime.is_initialized());
    let value = runtime
        .call(&CallDescriptor::new("math", "sqrt").arg(16.0))
        .unwrap();
    assert_eq!(value, NativeValue::Float(4.0));
    assert!(runtime.is_initialized());
    assert_eq!(runtime.search_path_root(), Some(fixtures()));
}

#[test]
fn concurrent_callers_are_serialized_safely() {
    let runtime = Arc::new(runtime());
    let workers: Vec<_> = (0..8)
        .map(|i| {
            let runtime = Arc::clone(&runtime);
            thread::spawn(move || {
                for j in 0..20 {
                    let x = f64::from(i * 100 + j);
                    let sum = runtime
                        .call_with(
                            ARRAYS,
                            "add_arrays",
                            vec![NativeValue::from(vec![x, 1.0]), NativeValue::from(vec![1.0, x])],
                        )
                        .unwrap();
                    assert_eq!(sum.as_f64_vec(), Some(vec![x + 1.0, x + 1.0]));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
}
