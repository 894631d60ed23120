//! Edge-case tests for write-compute merging under log replay and for lag math.

use replicore_core::lag::{offset_lag, over_threshold};
use replicore_core::write_compute::{decode_value, encode_value};
use replicore_core::{apply_update, FieldKind, ValueSchema, WriteComputeRecord};
use serde_json::{json, Value};

fn schema() -> ValueSchema {
    ValueSchema::new()
        .with_field("firstName", FieldKind::Scalar, json!(""))
        .with_field("lastName", FieldKind::Scalar, json!(""))
        .with_field("followers", FieldKind::List, json!([]))
}

// ---------------------------------------------------------------
// Replay after rewind
// ---------------------------------------------------------------

/// A rewind re-delivers a suffix of the log. Replaying the suffix over the
/// already-merged value must land on the same bytes as a single pass.
#[test]
fn replayed_suffix_reproduces_stored_bytes() {
    let log = vec![
        WriteComputeRecord::new().set("firstName", json!("f1")),
        WriteComputeRecord::new().list_add("followers", vec![json!("a"), json!("b")]),
        WriteComputeRecord::new()
            .no_op("firstName")
            .set("lastName", json!("l1")),
        WriteComputeRecord::new().list_remove("followers", vec![json!("a")]),
    ];

    let mut single_pass: Option<Value> = None;
    for update in &log {
        single_pass = Some(apply_update(&schema(), single_pass.as_ref(), update).unwrap());
    }

    let mut replayed = single_pass.clone();
    for update in &log[2..] {
        replayed = Some(apply_update(&schema(), replayed.as_ref(), update).unwrap());
    }

    let a = encode_value(single_pass.as_ref().unwrap()).unwrap();
    let b = encode_value(replayed.as_ref().unwrap()).unwrap();
    assert_eq!(a, b);
    assert_eq!(decode_value(&a).unwrap()["followers"], json!(["b"]));
}

#[test]
fn empty_update_keeps_value() {
    let current = json!({"firstName": "x", "lastName": "y", "followers": []});
    let merged = apply_update(&schema(), Some(&current), &WriteComputeRecord::new()).unwrap();
    assert_eq!(merged, current);
}

#[test]
fn stored_fields_outside_schema_survive_merge() {
    let current = json!({"firstName": "x", "legacy": 1});
    let update = WriteComputeRecord::new().set("lastName", json!("y"));
    let merged = apply_update(&schema(), Some(&current), &update).unwrap();
    assert_eq!(merged["legacy"], json!(1));
    assert_eq!(merged["lastName"], json!("y"));
}

// ---------------------------------------------------------------
// Lag math
// ---------------------------------------------------------------

#[test]
fn lag_never_negative() {
    for (latest, consumed) in [(0, 0), (0, 10), (10, 0), (u64::MAX, 0), (0, u64::MAX)] {
        let lag = offset_lag(latest, consumed);
        assert!(lag <= latest);
        assert_eq!(over_threshold(lag, 1000), lag.saturating_sub(1000));
    }
}
