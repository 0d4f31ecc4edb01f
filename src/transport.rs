//! The scheduler-side event transport seam.
//!
//! Two kinds of writes leave the capsule: structured row inserts and
//! key/value writes. The transport is opaque and reliable; retries live
//! on the other side of this trait, so the methods are infallible here.

use std::collections::BTreeMap;

/// A structured row destined for a scheduler table.
pub type Row = BTreeMap<String, String>;

pub trait Transport: Send + Sync {
    fn insert_row(&self, table: &str, row: Row);

    fn write_kv(&self, uri: &str, value: serde_json::Value);
}

/// Build a row from string pairs.
pub fn row(columns: &[(&str, &str)]) -> Row {
    columns
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// A transport that drops everything, for detached operation.
pub struct NullTransport;

impl Transport for NullTransport {
    fn insert_row(&self, table: &str, _row: Row) {
        log::debug!("dropping row for table {table}: no transport attached");
    }

    fn write_kv(&self, uri: &str, _value: serde_json::Value) {
        log::debug!("dropping KV write for {uri}: no transport attached");
    }
}

#[cfg(feature = "test-helpers")]
pub use self::capture::CaptureTransport;

#[cfg(feature = "test-helpers")]
mod capture {
    use std::sync::Mutex;

    use super::*;

    /// Records every emitted row and KV write, for assertions.
    #[derive(Default)]
    pub struct CaptureTransport {
        pub rows: Mutex<Vec<(String, Row)>>,
        pub kv: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl CaptureTransport {
        pub fn rows_for(&self, table: &str) -> Vec<Row> {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| t == table)
                .map(|(_, row)| row.clone())
                .collect()
        }

        pub fn kv_for(&self, prefix: &str) -> Vec<(String, serde_json::Value)> {
            self.kv
                .lock()
                .unwrap()
                .iter()
                .filter(|(uri, _)| uri.starts_with(prefix))
                .cloned()
                .collect()
        }
    }

    impl Transport for CaptureTransport {
        fn insert_row(&self, table: &str, row: Row) {
            self.rows.lock().unwrap().push((table.to_string(), row));
        }

        fn write_kv(&self, uri: &str, value: serde_json::Value) {
            self.kv.lock().unwrap().push((uri.to_string(), value));
        }
    }
}
