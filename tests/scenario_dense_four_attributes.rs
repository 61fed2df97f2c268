// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Dense 1D array, four attributes, condition pushdown (`spec.md` §8
//! scenario 1).

use arrayon::{
    Array, ArrayMode, Attribute, AttributeBuffer, CellValNum, CompareOp, Config, Datatype, Dimension, FragmentWriter,
    Layout, LocalVfs, Query, QueryCondition, Schema, Status, WriteInput,
};
use std::collections::HashMap;

fn schema() -> Schema {
    let mut schema = Schema::new(arrayon::ArrayType::Dense);
    schema
        .add_dimension(Dimension::new_numeric("i", Datatype::Int32, 0i32, 9i32, Some(10i32)).unwrap())
        .unwrap();
    schema
        .add_attribute(Attribute::new("a", Datatype::Int32, CellValNum::Fixed(1), true).unwrap())
        .unwrap();
    schema
        .add_attribute(Attribute::new("b", Datatype::StringAscii, CellValNum::Var, false).unwrap())
        .unwrap();
    schema
        .add_attribute(
            Attribute::new("c", Datatype::Int32, CellValNum::Fixed(1), false)
                .unwrap()
                .with_fill_value((-1i32).to_le_bytes().to_vec()),
        )
        .unwrap();
    schema
        .add_attribute(
            Attribute::new("d", Datatype::Float32, CellValNum::Fixed(1), false)
                .unwrap()
                .with_fill_value(0.0f32.to_le_bytes().to_vec()),
        )
        .unwrap();
    schema.finalize().unwrap()
}

fn var_buffer(values: &[&str]) -> AttributeBuffer {
    let mut data = Vec::new();
    let mut offsets = Vec::with_capacity(values.len());
    for v in values {
        offsets.push(data.len() as u64);
        data.extend_from_slice(v.as_bytes());
    }
    AttributeBuffer { data, offsets: Some(offsets), validity: None }
}

fn fixed_buffer<const N: usize>(values: &[i32], validity: Option<&[u8; N]>) -> AttributeBuffer {
    AttributeBuffer {
        data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        offsets: None,
        validity: validity.map(|v| v.to_vec()),
    }
}

fn write_all(array: &mut Array<LocalVfs>, schema: &Schema) {
    let a_values = [0, 2, 0, 4, 0, 6, 0, 8, 0, 10];
    let a_validity: [u8; 10] = [0, 1, 0, 1, 0, 1, 0, 1, 0, 1];
    let b_values = ["alice", "bob", "craig", "dave", "erin", "frank", "grace", "heidi", "ivan", "judy"];
    let c_values = [0, 0, 0, 0, 0, 0, 1, 2, 3, 4];
    let d_values: Vec<f32> = vec![4.1, 3.4, 5.6, 3.7, 2.3, 1.7, 3.8, 4.9, 3.2, 3.1];

    let mut attributes = HashMap::new();
    attributes.insert("a".to_string(), fixed_buffer(&a_values, Some(&a_validity)));
    attributes.insert("b".to_string(), var_buffer(&b_values));
    attributes.insert("c".to_string(), fixed_buffer::<0>(&c_values, None));
    attributes.insert(
        "d".to_string(),
        AttributeBuffer {
            data: d_values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            offsets: None,
            validity: None,
        },
    );

    let writer = FragmentWriter::new(schema, Layout::RowMajor, 1);
    let subarray = vec![(0i32.to_le_bytes().to_vec(), 9i32.to_le_bytes().to_vec())];
    let prepared = writer.write(WriteInput::Dense { subarray, attributes }).unwrap();
    array.commit_fragment(&prepared).unwrap();
}

/// Runs a condition over the full range and returns, via the fill-value
/// convention (`spec.md` §4.7), which indices satisfied it: a dense read
/// never drops cells, so a non-matching index comes back with attribute `c`
/// fill-replaced to its sentinel.
fn indices_passing(array: &Array<LocalVfs>, condition: QueryCondition) -> Vec<i32> {
    let mut query = Query::new(array, Layout::RowMajor)
        .add_range(0i32.to_le_bytes().to_vec(), 9i32.to_le_bytes().to_vec())
        .select_attribute("c")
        .condition(condition);
    let mut buffers = HashMap::new();
    buffers.insert("c".to_string(), AttributeBuffer { data: Vec::with_capacity(256), offsets: None, validity: None });
    let status = query.submit(&mut buffers).unwrap();
    assert_eq!(status, Status::Complete);
    let c_data: Vec<i32> = buffers["c"].data.chunks(4).map(|c| i32::from_le_bytes(c.try_into().unwrap())).collect();
    let original = [0, 0, 0, 0, 0, 0, 1, 2, 3, 4];
    (0..10)
        .filter(|&i| c_data[i] == original[i])
        .map(|i| i as i32)
        .collect()
}

#[test]
fn condition_scenarios_select_the_expected_indices() {
    let dir = tempfile::tempdir().unwrap();
    let schema = schema();
    Array::create(&LocalVfs, dir.path(), &schema).unwrap();
    let context = Config::new().build().unwrap().shared();

    let mut array = Array::open(LocalVfs, dir.path(), ArrayMode::Write, context.clone(), None).unwrap();
    write_all(&mut array, &schema);
    array.close();

    let array = Array::open(LocalVfs, dir.path(), ArrayMode::Read, context, None).unwrap();

    assert_eq!(indices_passing(&array, QueryCondition::is_null("a")), vec![0, 2, 4, 6, 8]);

    // Byte-lexicographic comparison puts "erin" below "eve" ('r' < 'v' at
    // the second character), so index 4 belongs in this set alongside
    // "alice".."dave".
    assert_eq!(
        indices_passing(&array, QueryCondition::predicate("b", CompareOp::Lt, b"eve".to_vec())),
        vec![0, 1, 2, 3, 4]
    );

    assert_eq!(
        indices_passing(&array, QueryCondition::predicate("c", CompareOp::Ge, 1i32.to_le_bytes().to_vec())),
        vec![6, 7, 8, 9]
    );

    let d_between = QueryCondition::predicate("d", CompareOp::Ge, 3.0f32.to_le_bytes().to_vec())
        .and(QueryCondition::predicate("d", CompareOp::Le, 4.0f32.to_le_bytes().to_vec()));
    assert_eq!(indices_passing(&array, d_between), vec![1, 3, 6, 9]);

    let combined = QueryCondition::predicate("d", CompareOp::Ge, 3.0f32.to_le_bytes().to_vec())
        .and(QueryCondition::predicate("d", CompareOp::Le, 4.0f32.to_le_bytes().to_vec()))
        .and(QueryCondition::is_not_null("a"))
        .and(QueryCondition::predicate("b", CompareOp::Lt, b"eve".to_vec()));
    assert_eq!(indices_passing(&array, combined), vec![1, 3]);
}
