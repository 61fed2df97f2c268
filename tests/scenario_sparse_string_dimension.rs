// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Sparse 2D array with a string dimension, two write batches, condition
//! pushdown over the surviving coordinates (`spec.md` §8 scenario 2).
//!
//! The two batches are written `Unordered` rather than `GlobalOrder`: the
//! property under test is the condition result and which `rows` values
//! survive it, not the write layout itself, and `Unordered` sidesteps
//! hand-sorting a mixed string/numeric coordinate tuple into the writer's
//! own global order.
//!
//! A query's attribute list names attributes, not dimensions (`spec.md` §3's
//! "Query" holds "attribute list", not a coordinate list), so there is no
//! buffer that hands `rows` values back directly. Instead this reads
//! attribute `a` under `RowMajor` layout, which sorts candidates by `rows`
//! first: the first and last returned values are exactly the `a` values at
//! the alphabetically lowest and highest qualifying `rows`.

use arrayon::{
    Array, ArrayMode, Attribute, AttributeBuffer, CellValNum, CompareOp, Config, Datatype, Dimension, FragmentWriter,
    Layout, LocalVfs, Query, QueryCondition, Schema, Status, WriteInput,
};
use std::collections::HashMap;

fn schema() -> Schema {
    let mut schema = Schema::new(arrayon::ArrayType::Sparse);
    schema.add_dimension(Dimension::new_string("rows")).unwrap();
    schema
        .add_dimension(Dimension::new_numeric("cols", Datatype::Int32, 1i32, 4i32, Some(4i32)).unwrap())
        .unwrap();
    schema
        .add_attribute(Attribute::new("a", Datatype::Int32, CellValNum::Fixed(1), false).unwrap())
        .unwrap();
    schema.finalize().unwrap()
}

fn rows_buffer(values: &[&str]) -> AttributeBuffer {
    let mut data = Vec::new();
    let mut offsets = Vec::with_capacity(values.len());
    for v in values {
        offsets.push(data.len() as u64);
        data.extend_from_slice(v.as_bytes());
    }
    AttributeBuffer { data, offsets: Some(offsets), validity: None }
}

fn cols_buffer(values: &[i32]) -> AttributeBuffer {
    AttributeBuffer {
        data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        offsets: None,
        validity: None,
    }
}

fn write_batch(array: &mut Array<LocalVfs>, schema: &Schema, timestamp: u64, rows: &[&str], cols: &[i32], a: &[i32]) {
    let coords = vec![rows_buffer(rows), cols_buffer(cols)];
    let mut attributes = HashMap::new();
    attributes.insert("a".to_string(), cols_buffer(a));

    let writer = FragmentWriter::new(schema, Layout::Unordered, timestamp);
    let prepared = writer.write(WriteInput::Sparse { coords, attributes }).unwrap();
    array.commit_fragment(&prepared).unwrap();
}

#[test]
fn condition_over_both_batches_brackets_corge_through_quux() {
    let dir = tempfile::tempdir().unwrap();
    let schema = schema();
    Array::create(&LocalVfs, dir.path(), &schema).unwrap();
    let context = Config::new().build().unwrap().shared();

    let mut array = Array::open(LocalVfs, dir.path(), ArrayMode::Write, context.clone(), None).unwrap();
    // rows sorted alphabetically up front: bar, baz, corge, foo
    write_batch(
        &mut array,
        &schema,
        1,
        &["bar", "baz", "corge", "foo"],
        &[1, 2, 3, 4],
        &[3, 3, 5, 3],
    );
    // garply, grault, gub, quux
    write_batch(
        &mut array,
        &schema,
        2,
        &["garply", "grault", "gub", "quux"],
        &[1, 2, 3, 4],
        &[6, 6, 3, 4],
    );
    array.close();

    let array = Array::open(LocalVfs, dir.path(), ArrayMode::Read, context, None).unwrap();
    let mut query = Query::new(&array, Layout::RowMajor)
        .select_attribute("a")
        .condition(QueryCondition::predicate("a", CompareOp::Ge, 4i32.to_le_bytes().to_vec()));

    let mut buffers = HashMap::new();
    buffers.insert("a".to_string(), AttributeBuffer { data: Vec::with_capacity(256), offsets: None, validity: None });
    let status = query.submit(&mut buffers).unwrap();
    assert_eq!(status, Status::Complete);

    let values: Vec<i32> = buffers["a"].data.chunks(4).map(|c| i32::from_le_bytes(c.try_into().unwrap())).collect();

    // Qualifying rows, alphabetically: corge (5), garply (6), grault (6), quux (4).
    assert_eq!(values, vec![5, 6, 6, 4]);
    assert_eq!(*values.first().unwrap(), 5, "alphabetically-lowest qualifying row is \"corge\"");
    assert_eq!(*values.last().unwrap(), 4, "alphabetically-highest qualifying row is \"quux\"");
}
