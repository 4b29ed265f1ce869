//! End-to-end scenarios: programs executed through the public connection
//! API against in-memory and file-backed databases.

use minidb::btree::cursor::{Cursor, SeekResult};
use minidb::record;
use minidb::vm::insn::{Insn, Opcode, P4};
use minidb::{Connection, SqlValue, StepResult};

fn op(opcode: Opcode, p1: i32, p2: i32, p3: i32) -> Insn {
    Insn::new(opcode, p1, p2, p3)
}

/// Collects every row a program produces.
fn query(conn: &mut Connection, program: Vec<Insn>) -> Vec<Vec<SqlValue>> {
    let mut stmt = conn.prepare(program);
    let mut rows = vec![];
    while stmt.step().expect("statement should not fail") == StepResult::Row {
        rows.push(stmt.row().to_vec());
    }
    rows
}

/// A scan program: rowid plus the first `ncols` columns of every row.
fn scan_program(root: i32, ncols: i32) -> Vec<Insn> {
    let mut program = vec![
        op(Opcode::OpenRead, 0, root, ncols),
        op(Opcode::Rewind, 0, 0, 0), // patched below
    ];
    program.push(op(Opcode::Rowid, 0, 1, 0));
    for col in 0..ncols {
        program.push(op(Opcode::Column, 0, col, 2 + col));
    }
    program.push(op(Opcode::ResultRow, 1, 1 + ncols, 0));
    program.push(op(Opcode::Next, 0, 2, 0));
    program.push(op(Opcode::Close, 0, 0, 0));
    program.push(op(Opcode::Halt, 0, 0, 0));
    let halt = program.len() as i32 - 1;
    program[1].p2 = halt;
    program
}

#[test]
fn test_single_row_read() {
    let mut conn = Connection::open_in_memory(4096).unwrap();
    let root = conn.create_table_tree().unwrap();
    {
        let mut cursor = Cursor::new(root);
        let payload = record::encode(&[
            SqlValue::Int(42),
            SqlValue::Text("hello".to_string()),
        ]);
        cursor.insert(conn.pager(), 1, &payload).unwrap();
    }
    let rows = query(
        &mut conn,
        vec![
            op(Opcode::OpenRead, 0, root as i32, 2),
            op(Opcode::Rewind, 0, 7, 0),
            op(Opcode::Column, 0, 0, 1),
            op(Opcode::Column, 0, 1, 2),
            op(Opcode::ResultRow, 1, 2, 0),
            op(Opcode::Next, 0, 2, 0),
            op(Opcode::Close, 0, 0, 0),
            op(Opcode::Halt, 0, 0, 0),
        ],
    );
    assert_eq!(
        rows,
        vec![vec![SqlValue::Int(42), SqlValue::Text("hello".to_string())]]
    );
}

#[test]
fn test_ordered_scan_after_unordered_inserts() {
    let mut conn = Connection::open_in_memory(4096).unwrap();
    let root = conn.create_table_tree().unwrap();
    {
        let mut cursor = Cursor::new(root);
        for (rowid, word) in [(5, "five"), (2, "two"), (8, "eight"), (1, "one"), (9, "nine")] {
            let payload = record::encode(&[SqlValue::Text(word.to_string())]);
            cursor.insert(conn.pager(), rowid, &payload).unwrap();
        }
    }
    let rows = query(&mut conn, scan_program(root as i32, 1));
    let expect: Vec<Vec<SqlValue>> = [
        (1, "one"),
        (2, "two"),
        (5, "five"),
        (8, "eight"),
        (9, "nine"),
    ]
    .iter()
    .map(|(id, w)| vec![SqlValue::Int(*id), SqlValue::Text(w.to_string())])
    .collect();
    assert_eq!(rows, expect);
}

#[test]
fn test_seek_semantics() {
    let mut conn = Connection::open_in_memory(4096).unwrap();
    let root = conn.create_table_tree().unwrap();
    let mut cursor = Cursor::new(root);
    for (rowid, word) in [(5, "five"), (2, "two"), (8, "eight"), (1, "one"), (9, "nine")] {
        let payload = record::encode(&[SqlValue::Text(word.to_string())]);
        cursor.insert(conn.pager(), rowid, &payload).unwrap();
    }

    assert_eq!(cursor.seek_rowid(conn.pager(), 3).unwrap(), SeekResult::NotFound);
    assert_eq!(cursor.rowid(conn.pager()).unwrap(), 5);

    assert_eq!(cursor.seek_rowid(conn.pager(), 10).unwrap(), SeekResult::NotFound);
    assert_eq!(cursor.rowid(conn.pager()).unwrap(), 9);

    assert_eq!(cursor.seek_rowid(conn.pager(), 2).unwrap(), SeekResult::Found);
    let payload = cursor.payload(conn.pager()).unwrap();
    assert_eq!(
        record::decode(&payload).unwrap(),
        vec![SqlValue::Text("two".to_string())]
    );

    // The same misses through the VM's seek instructions.
    let rows = query(
        &mut conn,
        vec![
            op(Opcode::OpenRead, 0, root as i32, 1),
            op(Opcode::Integer, 3, 1, 0),
            op(Opcode::SeekGE, 0, 7, 1), // first rowid >= 3 is 5
            op(Opcode::Rowid, 0, 2, 0),
            op(Opcode::Integer, 4, 1, 0),
            op(Opcode::SeekLE, 0, 7, 1), // last rowid <= 4 is 2
            op(Opcode::Rowid, 0, 3, 0),
            op(Opcode::ResultRow, 2, 2, 0),
            op(Opcode::Halt, 0, 0, 0),
        ],
    );
    assert_eq!(rows, vec![vec![SqlValue::Int(5), SqlValue::Int(2)]]);
}

#[test]
fn test_aggregates() {
    let mut conn = Connection::open_in_memory(4096).unwrap();
    // sum of 10, 20, 30 and a count that skips a NULL.
    let rows = query(
        &mut conn,
        vec![
            op(Opcode::Integer, 10, 1, 0),
            op(Opcode::AggStep, 0, 1, 0).with_p4(P4::Text("sum".to_string())).with_p5(1),
            op(Opcode::AggStep, 0, 1, 1).with_p4(P4::Text("count".to_string())).with_p5(1),
            op(Opcode::Integer, 20, 1, 0),
            op(Opcode::AggStep, 0, 1, 0).with_p4(P4::Text("sum".to_string())).with_p5(1),
            op(Opcode::AggStep, 0, 1, 1).with_p4(P4::Text("count".to_string())).with_p5(1),
            op(Opcode::Null, 0, 1, 0),
            op(Opcode::AggStep, 0, 1, 1).with_p4(P4::Text("count".to_string())).with_p5(1),
            op(Opcode::Integer, 30, 1, 0),
            op(Opcode::AggStep, 0, 1, 0).with_p4(P4::Text("sum".to_string())).with_p5(1),
            op(Opcode::AggFinal, 0, 2, 0).with_p4(P4::Text("sum".to_string())),
            op(Opcode::AggFinal, 0, 3, 1).with_p4(P4::Text("count".to_string())),
            op(Opcode::ResultRow, 2, 2, 0),
            op(Opcode::Halt, 0, 0, 0),
        ],
    );
    assert_eq!(rows, vec![vec![SqlValue::Int(60), SqlValue::Int(2)]]);
}

#[test]
fn test_scalar_function_pipeline() {
    let mut conn = Connection::open_in_memory(4096).unwrap();
    let rows = query(
        &mut conn,
        vec![
            op(Opcode::String, 0, 1, 0).with_p4(P4::Text("HeLLo".to_string())),
            op(Opcode::Function, 0, 1, 2)
                .with_p4(P4::Text("lower".to_string()))
                .with_p5(1),
            op(Opcode::Function, 0, 2, 3)
                .with_p4(P4::Text("upper".to_string()))
                .with_p5(1),
            op(Opcode::ResultRow, 3, 1, 0),
            op(Opcode::Halt, 0, 0, 0),
        ],
    );
    assert_eq!(rows, vec![vec![SqlValue::Text("HELLO".to_string())]]);
}

#[test]
fn test_blob_preserved_exactly() {
    let mut conn = Connection::open_in_memory(4096).unwrap();
    let root = conn.create_table_tree().unwrap();
    let blob = vec![0x00_u8, 0x01, 0xff, 0xfe, 0x00];
    {
        let mut cursor = Cursor::new(root);
        let payload = record::encode(&[SqlValue::Blob(blob.clone())]);
        cursor.insert(conn.pager(), 1, &payload).unwrap();
    }
    let rows = query(&mut conn, scan_program(root as i32, 1));
    assert_eq!(rows, vec![vec![SqlValue::Int(1), SqlValue::Blob(blob)]]);
}

#[test]
fn test_vm_insert_write_path() {
    // INSERT through the bytecode: NewRowid + MakeRecord + Insert in a loop
    // driven by a countdown register.
    let mut conn = Connection::open_in_memory(512).unwrap();
    let root = conn.create_table_tree().unwrap() as i32;
    let changes = conn
        .execute(vec![
            op(Opcode::OpenWrite, 0, root, 2),
            op(Opcode::Integer, 49, 1, 0),       // 1: countdown
            op(Opcode::NewRowid, 0, 0, 4),       // 2: loop head
            op(Opcode::Copy, 4, 2, 0),           // record col 0 = rowid
            op(Opcode::Multiply, 4, 4, 3),       // record col 1 = rowid^2... r3 = r4*r4
            op(Opcode::MakeRecord, 2, 2, 5),
            op(Opcode::Insert, 0, 5, 4),
            op(Opcode::IfPos, 1, 2, 1),          // loop 50 times
            op(Opcode::Close, 0, 0, 0),
            op(Opcode::Halt, 0, 0, 0),
        ])
        .unwrap();
    assert_eq!(changes, 50);

    let rows = query(&mut conn, scan_program(root, 2));
    assert_eq!(rows.len(), 50);
    for (i, row) in rows.iter().enumerate() {
        let id = (i + 1) as i64;
        assert_eq!(row[0], SqlValue::Int(id));
        assert_eq!(row[1], SqlValue::Int(id));
        assert_eq!(row[2], SqlValue::Int(id * id));
    }
}

#[test]
fn test_split_stress_scan_stays_ordered() {
    let _ = env_logger::builder().is_test(true).try_init();
    // Small pages force leaf and interior splits; the shuffled insert order
    // exercises splits away from the tree's right edge.
    let mut conn = Connection::open_in_memory(512).unwrap();
    let root = conn.create_table_tree().unwrap();
    let n: i64 = 800;
    {
        let mut cursor = Cursor::new(root);
        for i in 0..n {
            let rowid = (i * 13) % n + 1; // 13 is coprime with 800
            let payload = record::encode(&[
                SqlValue::Int(rowid * 2),
                SqlValue::Text(format!("{:040}", rowid)),
            ]);
            cursor.insert(conn.pager(), rowid, &payload).unwrap();
        }
    }
    let rows = query(&mut conn, scan_program(root as i32, 2));
    assert_eq!(rows.len(), n as usize);
    for (i, row) in rows.iter().enumerate() {
        let id = (i + 1) as i64;
        assert_eq!(row[0], SqlValue::Int(id));
        assert_eq!(row[1], SqlValue::Int(id * 2));
        assert_eq!(row[2], SqlValue::Text(format!("{:040}", id)));
    }
}

#[test]
fn test_reader_cursor_sees_write_through_other_cursor() {
    let mut conn = Connection::open_in_memory(4096).unwrap();
    let root = conn.create_table_tree().unwrap();
    {
        let mut cursor = Cursor::new(root);
        for rowid in [1_i64, 2, 4] {
            let payload = record::encode(&[SqlValue::Int(rowid * 10)]);
            cursor.insert(conn.pager(), rowid, &payload).unwrap();
        }
    }
    // Scan with cursor 0 while cursor 1 inserts rowid 3 after the first row.
    // The reader is knocked into a reseek and must still see every row in
    // order, including the new one.
    let root = root as i32;
    let rows = query(
        &mut conn,
        vec![
            op(Opcode::OpenRead, 0, root, 1),
            op(Opcode::OpenWrite, 1, root, 1),
            op(Opcode::Integer, 1, 5, 0),
            op(Opcode::Rewind, 0, 15, 0),
            op(Opcode::Rowid, 0, 1, 0),
            op(Opcode::ResultRow, 1, 1, 0),
            op(Opcode::IfNotZero, 5, 8, 0),
            op(Opcode::Goto, 0, 12, 0),
            op(Opcode::Integer, 30, 2, 0),
            op(Opcode::MakeRecord, 2, 1, 3),
            op(Opcode::Integer, 3, 4, 0),
            op(Opcode::Insert, 1, 3, 4),
            op(Opcode::Next, 0, 4, 0),
            op(Opcode::Close, 0, 0, 0),
            op(Opcode::Close, 1, 0, 0),
            op(Opcode::Halt, 0, 0, 0),
        ],
    );
    let got: Vec<i64> = rows.iter().map(|r| *r[0].as_int().unwrap()).collect();
    assert_eq!(got, vec![1, 2, 3, 4]);
}

#[test]
fn test_file_backed_database_survives_reopen() {
    let dir = std::env::temp_dir().join("minidb-engine-tests");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("survives_reopen.db");
    let path = path.to_string_lossy();
    let _ = std::fs::remove_file(path.as_ref());

    let root;
    {
        let mut conn = Connection::create(&path, 512).unwrap();
        root = conn.create_table_tree().unwrap();
        let mut cursor = Cursor::new(root);
        for rowid in 1..=100_i64 {
            let payload = record::encode(&[
                SqlValue::Text(format!("persisted-{:03}", rowid)),
                SqlValue::Real(rowid as f64 / 2.0),
            ]);
            cursor.insert(conn.pager(), rowid, &payload).unwrap();
        }
        conn.commit().unwrap();
    }
    {
        let mut conn = Connection::open(&path).unwrap();
        let rows = query(&mut conn, scan_program(root as i32, 2));
        assert_eq!(rows.len(), 100);
        assert_eq!(
            rows[41],
            vec![
                SqlValue::Int(42),
                SqlValue::Text("persisted-042".to_string()),
                SqlValue::Real(21.0),
            ]
        );
    }
    let _ = std::fs::remove_file(path.as_ref());
}

#[test]
fn test_delete_through_vm() {
    let mut conn = Connection::open_in_memory(4096).unwrap();
    let root = conn.create_table_tree().unwrap();
    {
        let mut cursor = Cursor::new(root);
        for rowid in 1..=6_i64 {
            let payload = record::encode(&[SqlValue::Int(rowid * 100)]);
            cursor.insert(conn.pager(), rowid, &payload).unwrap();
        }
    }
    // DELETE WHERE rowid = 4.
    let root = root as i32;
    let changes = conn
        .execute(vec![
            op(Opcode::OpenWrite, 0, root, 1),
            op(Opcode::Integer, 4, 1, 0),
            op(Opcode::SeekRowid, 0, 5, 1),
            op(Opcode::Delete, 0, 0, 0),
            op(Opcode::Close, 0, 0, 0),
            op(Opcode::Halt, 0, 0, 0),
        ])
        .unwrap();
    assert_eq!(changes, 1);
    let rows = query(&mut conn, scan_program(root, 1));
    let got: Vec<i64> = rows.iter().map(|r| *r[0].as_int().unwrap()).collect();
    assert_eq!(got, vec![1, 2, 3, 5, 6]);
}

#[test]
fn test_overflowing_row_through_vm() {
    // A row far larger than the page spills to an overflow chain and comes
    // back intact through Column.
    let mut conn = Connection::open_in_memory(512).unwrap();
    let root = conn.create_table_tree().unwrap();
    let big = "x".repeat(3000);
    {
        let mut cursor = Cursor::new(root);
        let payload = record::encode(&[SqlValue::Text(big.clone()), SqlValue::Int(7)]);
        cursor.insert(conn.pager(), 1, &payload).unwrap();
    }
    let rows = query(&mut conn, scan_program(root as i32, 2));
    assert_eq!(
        rows,
        vec![vec![
            SqlValue::Int(1),
            SqlValue::Text(big),
            SqlValue::Int(7)
        ]]
    );
}
