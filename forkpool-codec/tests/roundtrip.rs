//! Round-trip properties of the dry/undry codec

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use forkpool_codec::{
    dry, undry_args, undry_value, CodecError, DryRegistry, DryType, RegexValue, StreamHandle,
    Value,
};

fn round_trip(values: &[Value]) -> Vec<Value> {
    let registry = DryRegistry::new();
    let payload = dry(values).expect("dry");
    undry_args(&payload, &registry).expect("undry")
}

#[test]
fn acyclic_tree_round_trips_deep_equal() {
    let leaf = Value::object();
    leaf.set("name", Value::from("leaf"));
    leaf.set("count", Value::Int(42));
    leaf.set("ratio", Value::Float(0.5));
    leaf.set("flag", Value::Bool(true));
    leaf.set("nothing", Value::Null);
    let root = Value::array(vec![
        leaf,
        Value::from("text with ~ marker"),
        Value::Int(-7),
    ]);

    let out = round_trip(&[root.clone()]);
    assert_eq!(out.len(), 1);
    assert!(Value::deep_eq(&root, &out[0]), "{:?} != {:?}", root, out[0]);
}

#[test]
fn cycle_round_trips_identity_equal() {
    let a = Value::object();
    a.set("self", a.clone());

    let out = round_trip(&[a]);
    let decoded = &out[0];
    let inner = decoded.get("self").expect("self key");
    assert!(Value::same_object(decoded, &inner));
}

#[test]
fn shared_reference_is_preserved_not_copied() {
    let shared = Value::object();
    shared.set("payload", Value::Int(9));
    let root = Value::object();
    root.set("left", shared.clone());
    root.set("right", shared);

    let out = round_trip(&[root]);
    let decoded = &out[0];
    let left = decoded.get("left").expect("left");
    let right = decoded.get("right").expect("right");
    assert!(Value::same_object(&left, &right));
    assert_eq!(left.get("payload").unwrap().as_i64(), Some(9));
}

#[test]
fn mutual_cycle_between_siblings() {
    let a = Value::object();
    let b = Value::object();
    a.set("other", b.clone());
    b.set("other", a.clone());
    let root = Value::array(vec![a, b]);

    let out = round_trip(&[root]);
    let decoded = &out[0];
    let a2 = decoded.at(0).unwrap();
    let b2 = decoded.at(1).unwrap();
    assert!(Value::same_object(&a2.get("other").unwrap(), &b2));
    assert!(Value::same_object(&b2.get("other").unwrap(), &a2));
}

#[test]
fn infinities_survive_and_never_become_null() {
    let out = round_trip(&[Value::Float(f64::INFINITY), Value::Float(f64::NEG_INFINITY)]);
    assert_eq!(out[0].as_f64(), Some(f64::INFINITY));
    assert_eq!(out[1].as_f64(), Some(f64::NEG_INFINITY));
}

#[test]
fn dates_and_regexes_round_trip() {
    let date = Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 0).unwrap();
    let regex = RegexValue::new("ab+c", "i");
    let out = round_trip(&[Value::Date(date), Value::Regex(regex.clone())]);

    match &out[0] {
        Value::Date(decoded) => assert_eq!(*decoded, date),
        other => panic!("expected date, got {:?}", other),
    }
    match &out[1] {
        Value::Regex(decoded) => assert_eq!(*decoded, regex),
        other => panic!("expected regex, got {:?}", other),
    }
}

#[test]
fn buffers_round_trip_by_side_list_index() {
    let bytes = Bytes::from_static(b"\x00\x01binary");
    let out = round_trip(&[Value::Buffer(bytes.clone())]);
    match &out[0] {
        Value::Buffer(decoded) => assert_eq!(decoded, &bytes),
        other => panic!("expected buffer, got {:?}", other),
    }
}

#[test]
fn buffer_slice_is_not_confused_with_its_parent() {
    let full = Bytes::from_static(b"hello");
    let prefix = full.slice(0..2);
    let payload = dry(&[Value::Buffer(full.clone()), Value::Buffer(prefix.clone())]).expect("dry");
    // Same backing storage, different extents: two side-list entries
    assert_eq!(payload.buffers.len(), 2);

    let out = undry_args(&payload, &DryRegistry::new()).expect("undry");
    match (&out[0], &out[1]) {
        (Value::Buffer(a), Value::Buffer(b)) => {
            assert_eq!(a, &full);
            assert_eq!(b, &prefix);
        }
        other => panic!("expected two buffers, got {:?}", other),
    }
}

#[test]
fn repeated_buffer_ships_once() {
    let bytes = Bytes::from_static(b"shared");
    let payload = dry(&[Value::Buffer(bytes.clone()), Value::Buffer(bytes.clone())]).expect("dry");
    assert_eq!(payload.buffers.len(), 1);

    let out = undry_args(&payload, &DryRegistry::new()).expect("undry");
    assert!(Value::same_object(&out[0], &out[1]));
}

#[test]
fn streams_are_preserved_by_reference() {
    let stream = StreamHandle::from_bytes(Bytes::from_static(b"flow"));
    let out = round_trip(&[Value::Stream(stream.clone())]);
    match &out[0] {
        Value::Stream(decoded) => assert!(StreamHandle::same_stream(decoded, &stream)),
        other => panic!("expected stream, got {:?}", other),
    }
}

#[derive(Debug)]
struct Point {
    x: i64,
    y: i64,
}

impl DryType for Point {
    fn dry_name(&self) -> &str {
        "Point"
    }

    fn to_dry(&self) -> Value {
        let carried = Value::object();
        carried.set("x", Value::Int(self.x));
        carried.set("y", Value::Int(self.y));
        carried
    }
}

fn point_registry() -> DryRegistry {
    let mut registry = DryRegistry::new();
    registry.register("Point", |carried| {
        Value::custom(Point {
            x: carried.get("x").and_then(|v| v.as_i64()).unwrap_or(0),
            y: carried.get("y").and_then(|v| v.as_i64()).unwrap_or(0),
        })
    });
    registry
}

#[test]
fn custom_type_round_trips_through_its_hook() {
    let registry = point_registry();
    let payload = dry(&[Value::custom(Point { x: 3, y: -4 })]).unwrap();
    let out = undry_args(&payload, &registry).unwrap();

    match &out[0] {
        Value::Custom(custom) => {
            assert_eq!(custom.dry_name(), "Point");
            let dried = custom.to_dry();
            assert_eq!(dried.get("x").unwrap().as_i64(), Some(3));
            assert_eq!(dried.get("y").unwrap().as_i64(), Some(-4));
        }
        other => panic!("expected reconstructed custom value, got {:?}", other),
    }
}

#[test]
fn custom_typed_root_is_returned_directly() {
    let registry = point_registry();
    let payload = forkpool_codec::dry_value(&Value::custom(Point { x: 1, y: 2 })).unwrap();
    let out = undry_value(&payload.text, &[], &[], &registry).unwrap();
    match out {
        Value::Custom(custom) => assert_eq!(custom.dry_name(), "Point"),
        other => panic!("expected custom root, got {:?}", other),
    }
}

#[test]
fn unrecognized_custom_tag_degrades_to_carried_value() {
    // Encoded with a Point, decoded with a registry that never heard of it
    let payload = dry(&[Value::custom(Point { x: 5, y: 6 })]).unwrap();
    let out = undry_args(&payload, &DryRegistry::new()).unwrap();
    // The raw carried value comes back unchanged, not an error
    assert_eq!(out[0].get("x").unwrap().as_i64(), Some(5));
}

#[test]
fn unresolvable_backref_is_a_serialization_error() {
    let registry = DryRegistry::new();
    let result = undry_value(r#"{"a":"~0~nope"}"#, &[], &[], &registry);
    match result {
        Err(CodecError::BadBackref { path }) => assert_eq!(path, "0~nope"),
        other => panic!("expected BadBackref, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn remote_error_round_trips_as_builtin() {
    let error = forkpool_codec::RemoteError::with_stack("went wrong", "trace line");
    let out = round_trip(&[Value::custom(error)]);
    let decoded = forkpool_codec::as_remote_error(&out[0]).expect("remote error");
    assert_eq!(decoded.message, "went wrong");
    assert_eq!(decoded.stack.as_deref(), Some("trace line"));
}

#[test]
fn plain_iso_string_decodes_as_date() {
    let out = round_trip(&[Value::from("2023-01-02T03:04:05.000Z")]);
    assert!(matches!(out[0], Value::Date(_)));
}
