//! Schema metadata updates driven by the control connection.
//!
//! Parsing schema rows into rich table/type models belongs to the metadata
//! module proper; what lives here is the update contract the control
//! connection drives, plus [`BufferedSchema`], a double-buffered snapshot
//! store. A bulk refresh clears the back buffer, writes every result into
//! it, then swaps back and front atomically, so concurrent readers on the
//! data plane never see a partially reloaded schema.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

use crate::rows::{ResultRows, Row};
use crate::version::ServerVersion;

/// The schema-update surface the control connection calls into.
///
/// `update_*` methods receive raw rows from the corresponding system
/// table; the store decides how much of them to interpret. Functions and
/// aggregates are dropped by their fully qualified name (see
/// [`full_function_name`]) because the argument types identify the
/// overload uniquely.
pub trait MetadataStore: Send + Sync {
    /// Begins a bulk refresh: clears the back buffer and directs subsequent
    /// updates into it.
    fn clear_and_update_back(&self, version: ServerVersion);

    fn update_keyspaces(&self, version: ServerVersion, rows: &ResultRows);
    fn update_tables(&self, version: ServerVersion, rows: &ResultRows);
    fn update_views(&self, version: ServerVersion, rows: &ResultRows);
    fn update_columns(&self, version: ServerVersion, rows: &ResultRows);
    fn update_indexes(&self, version: ServerVersion, rows: &ResultRows);
    fn update_user_types(&self, version: ServerVersion, rows: &ResultRows);
    fn update_functions(&self, version: ServerVersion, rows: &ResultRows);
    fn update_aggregates(&self, version: ServerVersion, rows: &ResultRows);

    /// Ends a bulk refresh: atomically publishes the back buffer.
    fn swap_to_back_and_update_front(&self);

    fn drop_keyspace(&self, keyspace: &str);
    fn drop_table_or_view(&self, keyspace: &str, name: &str);
    fn drop_user_type(&self, keyspace: &str, name: &str);
    fn drop_function(&self, keyspace: &str, full_name: &str);
    fn drop_aggregate(&self, keyspace: &str, full_name: &str);
}

/// Renders the fully qualified name of a function or aggregate overload,
/// e.g. `avg(int,bigint)`.
pub fn full_function_name(name: &str, arg_types: &[String]) -> String {
    format!("{}({})", name, arg_types.join(","))
}

/// A consistent view over the schema rows last read from the cluster.
///
/// Entries are keyed by the identifying columns of each logical table;
/// columns and indexes are grouped under their owning table.
#[derive(Clone, Debug, Default)]
pub struct SchemaSnapshot {
    pub version: ServerVersion,
    pub keyspaces: HashMap<String, Row>,
    pub tables: HashMap<(String, String), Row>,
    pub views: HashMap<(String, String), Row>,
    pub columns: HashMap<(String, String), Vec<Row>>,
    pub indexes: HashMap<(String, String), Vec<Row>>,
    pub user_types: HashMap<(String, String), Row>,
    pub functions: HashMap<(String, String), Row>,
    pub aggregates: HashMap<(String, String), Row>,
}

impl SchemaSnapshot {
    /// Column holding the table name: the legacy layout calls it
    /// `columnfamily_name`.
    fn table_name_column(version: ServerVersion) -> &'static str {
        if version >= ServerVersion::V3_0 {
            "table_name"
        } else {
            "columnfamily_name"
        }
    }

    fn signature_column(version: ServerVersion) -> &'static str {
        if version >= ServerVersion::V3_0 {
            "argument_types"
        } else {
            "signature"
        }
    }

    fn insert_named(
        into: &mut HashMap<(String, String), Row>,
        rows: &ResultRows,
        name_column: &str,
    ) {
        for row in &rows.rows {
            if let (Some(keyspace), Some(name)) = (row.text("keyspace_name"), row.text(name_column))
            {
                into.insert((keyspace.to_owned(), name.to_owned()), row.clone());
            }
        }
    }

    fn replace_grouped(
        into: &mut HashMap<(String, String), Vec<Row>>,
        rows: &ResultRows,
        table_column: &str,
    ) {
        let mut grouped: HashMap<(String, String), Vec<Row>> = HashMap::new();
        for row in &rows.rows {
            if let (Some(keyspace), Some(table)) =
                (row.text("keyspace_name"), row.text(table_column))
            {
                grouped
                    .entry((keyspace.to_owned(), table.to_owned()))
                    .or_default()
                    .push(row.clone());
            }
        }
        into.extend(grouped);
    }
}

/// Double-buffered [`MetadataStore`]: the published snapshot sits behind an
/// atomic pointer, the back buffer behind a mutex. Between
/// `clear_and_update_back` and `swap_to_back_and_update_front` all updates
/// land in the back buffer; outside a bulk refresh (targeted refreshes) an
/// update clones the front, applies, and republishes, so readers always see
/// either the previous snapshot or the complete new one.
#[derive(Debug, Default)]
pub struct BufferedSchema {
    front: ArcSwap<SchemaSnapshot>,
    back: Mutex<Arc<SchemaSnapshot>>,
    bulk_update: AtomicBool,
}

impl BufferedSchema {
    pub fn new() -> Self {
        BufferedSchema::default()
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<SchemaSnapshot> {
        self.front.load_full()
    }

    fn apply(&self, mutate: impl FnOnce(&mut SchemaSnapshot)) {
        if self.bulk_update.load(Ordering::Acquire) {
            let mut back = self.back.lock().unwrap();
            mutate(Arc::make_mut(&mut back));
        } else {
            let mut next = SchemaSnapshot::clone(&self.front.load());
            mutate(&mut next);
            self.front.store(Arc::new(next));
        }
    }
}

impl MetadataStore for BufferedSchema {
    fn clear_and_update_back(&self, version: ServerVersion) {
        let mut back = self.back.lock().unwrap();
        *back = Arc::new(SchemaSnapshot {
            version,
            ..SchemaSnapshot::default()
        });
        self.bulk_update.store(true, Ordering::Release);
    }

    fn update_keyspaces(&self, _version: ServerVersion, rows: &ResultRows) {
        self.apply(|snapshot| {
            for row in &rows.rows {
                if let Some(keyspace) = row.text("keyspace_name") {
                    snapshot.keyspaces.insert(keyspace.to_owned(), row.clone());
                }
            }
        });
    }

    fn update_tables(&self, version: ServerVersion, rows: &ResultRows) {
        self.apply(|snapshot| {
            SchemaSnapshot::insert_named(
                &mut snapshot.tables,
                rows,
                SchemaSnapshot::table_name_column(version),
            );
        });
    }

    fn update_views(&self, _version: ServerVersion, rows: &ResultRows) {
        self.apply(|snapshot| {
            SchemaSnapshot::insert_named(&mut snapshot.views, rows, "view_name");
        });
    }

    fn update_columns(&self, version: ServerVersion, rows: &ResultRows) {
        self.apply(|snapshot| {
            SchemaSnapshot::replace_grouped(
                &mut snapshot.columns,
                rows,
                SchemaSnapshot::table_name_column(version),
            );
        });
    }

    fn update_indexes(&self, _version: ServerVersion, rows: &ResultRows) {
        self.apply(|snapshot| {
            SchemaSnapshot::replace_grouped(&mut snapshot.indexes, rows, "table_name");
        });
    }

    fn update_user_types(&self, _version: ServerVersion, rows: &ResultRows) {
        self.apply(|snapshot| {
            SchemaSnapshot::insert_named(&mut snapshot.user_types, rows, "type_name");
        });
    }

    fn update_functions(&self, version: ServerVersion, rows: &ResultRows) {
        self.apply(|snapshot| {
            for row in &rows.rows {
                if let (Some(keyspace), Some(name)) =
                    (row.text("keyspace_name"), row.text("function_name"))
                {
                    let args = row
                        .text_list(SchemaSnapshot::signature_column(version))
                        .unwrap_or(&[]);
                    let key = (keyspace.to_owned(), full_function_name(name, args));
                    snapshot.functions.insert(key, row.clone());
                }
            }
        });
    }

    fn update_aggregates(&self, version: ServerVersion, rows: &ResultRows) {
        self.apply(|snapshot| {
            for row in &rows.rows {
                if let (Some(keyspace), Some(name)) =
                    (row.text("keyspace_name"), row.text("aggregate_name"))
                {
                    let args = row
                        .text_list(SchemaSnapshot::signature_column(version))
                        .unwrap_or(&[]);
                    let key = (keyspace.to_owned(), full_function_name(name, args));
                    snapshot.aggregates.insert(key, row.clone());
                }
            }
        });
    }

    fn swap_to_back_and_update_front(&self) {
        let mut back = self.back.lock().unwrap();
        let old_front = self.front.swap(Arc::clone(&back));
        *back = old_front;
        self.bulk_update.store(false, Ordering::Release);
    }

    fn drop_keyspace(&self, keyspace: &str) {
        self.apply(|snapshot| {
            snapshot.keyspaces.remove(keyspace);
            snapshot.tables.retain(|(ks, _), _| ks != keyspace);
            snapshot.views.retain(|(ks, _), _| ks != keyspace);
            snapshot.columns.retain(|(ks, _), _| ks != keyspace);
            snapshot.indexes.retain(|(ks, _), _| ks != keyspace);
            snapshot.user_types.retain(|(ks, _), _| ks != keyspace);
            snapshot.functions.retain(|(ks, _), _| ks != keyspace);
            snapshot.aggregates.retain(|(ks, _), _| ks != keyspace);
        });
    }

    fn drop_table_or_view(&self, keyspace: &str, name: &str) {
        let key = (keyspace.to_owned(), name.to_owned());
        self.apply(|snapshot| {
            snapshot.tables.remove(&key);
            snapshot.views.remove(&key);
            snapshot.columns.remove(&key);
            snapshot.indexes.remove(&key);
        });
    }

    fn drop_user_type(&self, keyspace: &str, name: &str) {
        let key = (keyspace.to_owned(), name.to_owned());
        self.apply(|snapshot| {
            snapshot.user_types.remove(&key);
        });
    }

    fn drop_function(&self, keyspace: &str, full_name: &str) {
        let key = (keyspace.to_owned(), full_name.to_owned());
        self.apply(|snapshot| {
            snapshot.functions.remove(&key);
        });
    }

    fn drop_aggregate(&self, keyspace: &str, full_name: &str) {
        let key = (keyspace.to_owned(), full_name.to_owned());
        self.apply(|snapshot| {
            snapshot.aggregates.remove(&key);
        });
    }
}
