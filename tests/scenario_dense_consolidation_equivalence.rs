// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Dense array consolidation is a read no-op (`spec.md` §8 scenario 5): a
//! 4x4 domain written as three overlapping dense fragments reads back
//! identically before and after consolidating.

use arrayon::{
    Array, ArrayMode, Attribute, AttributeBuffer, CellValNum, Config, Consolidator, ConsolidationConfig, Datatype,
    Dimension, FragmentWriter, Layout, LocalVfs, Query, Schema, Status, WriteInput,
};
use std::collections::HashMap;

fn schema() -> Schema {
    let mut schema = Schema::new(arrayon::ArrayType::Dense);
    schema
        .add_dimension(Dimension::new_numeric("x", Datatype::Int32, 1i32, 4i32, Some(1i32)).unwrap())
        .unwrap();
    schema
        .add_dimension(Dimension::new_numeric("y", Datatype::Int32, 1i32, 4i32, Some(1i32)).unwrap())
        .unwrap();
    schema
        .add_attribute(
            Attribute::new("a", Datatype::Int32, CellValNum::Fixed(1), false)
                .unwrap()
                .with_fill_value((-1i32).to_le_bytes().to_vec()),
        )
        .unwrap();
    schema.finalize().unwrap()
}

fn write_box(array: &mut Array<LocalVfs>, schema: &Schema, timestamp: u64, x: (i32, i32), y: (i32, i32), values: &[i32]) {
    let subarray = vec![
        (x.0.to_le_bytes().to_vec(), x.1.to_le_bytes().to_vec()),
        (y.0.to_le_bytes().to_vec(), y.1.to_le_bytes().to_vec()),
    ];
    let mut attributes = HashMap::new();
    attributes.insert(
        "a".to_string(),
        AttributeBuffer { data: values.iter().flat_map(|v| v.to_le_bytes()).collect(), offsets: None, validity: None },
    );
    let writer = FragmentWriter::new(schema, Layout::RowMajor, timestamp);
    let prepared = writer.write(WriteInput::Dense { subarray, attributes }).unwrap();
    array.commit_fragment(&prepared).unwrap();
}

fn read_full_domain(array: &Array<LocalVfs>) -> Vec<i32> {
    let mut query = Query::new(array, Layout::RowMajor)
        .add_range(1i32.to_le_bytes().to_vec(), 4i32.to_le_bytes().to_vec())
        .add_range(1i32.to_le_bytes().to_vec(), 4i32.to_le_bytes().to_vec())
        .select_attribute("a");
    let mut buffers = HashMap::new();
    buffers.insert("a".to_string(), AttributeBuffer { data: Vec::with_capacity(4096), offsets: None, validity: None });
    let status = query.submit(&mut buffers).unwrap();
    assert_eq!(status, Status::Complete);
    buffers["a"].data.chunks(4).map(|c| i32::from_le_bytes(c.try_into().unwrap())).collect()
}

#[test]
fn consolidation_does_not_change_what_a_full_scan_reads() {
    let dir = tempfile::tempdir().unwrap();
    let schema = schema();
    Array::create(&LocalVfs, dir.path(), &schema).unwrap();
    let context = Config::new().build().unwrap().shared();

    let mut array = Array::open(LocalVfs, dir.path(), ArrayMode::Write, context.clone(), None).unwrap();
    // ([1..2], [1..4]): row-major over x in {1,2}, y in {1,2,3,4}
    write_box(&mut array, &schema, 1, (1, 2), (1, 4), &[1, 2, 3, 4, 5, 6, 7, 8]);
    // ([2..3], [2..3])
    write_box(&mut array, &schema, 2, (2, 3), (2, 3), &[90, 91, 92, 93]);
    // two singleton writes: (1,1) and (3,4)
    write_box(&mut array, &schema, 3, (1, 1), (1, 1), &[1000]);
    write_box(&mut array, &schema, 4, (3, 4), (3, 4), &[2000, 2001, 2002, 2003]);
    array.close();

    let array = Array::open(LocalVfs, dir.path(), ArrayMode::Read, context.clone(), None).unwrap();
    let before = read_full_domain(&array);
    array.close();

    let mut array = Array::open(LocalVfs, dir.path(), ArrayMode::Consolidate, context.clone(), None).unwrap();
    let rounds = Consolidator::new(&mut array, ConsolidationConfig::new()).run().unwrap();
    assert!(rounds > 0);
    array.close();

    let array = Array::open(LocalVfs, dir.path(), ArrayMode::Read, context, None).unwrap();
    let after = read_full_domain(&array);

    assert_eq!(before, after);
}
