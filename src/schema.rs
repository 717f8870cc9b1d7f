//! Schema metadata reads: the bulk read after the initial host scan and the
//! targeted refreshes driven by schema-change events.

use std::time::Duration;

use futures::future;
use tracing::{debug, error};

use crate::metadata::full_function_name;
use crate::queries;
use crate::refresh::{query, ScanError};
use crate::rows::{ResultRows, Statement};
use crate::session::ControlSession;
use crate::transport::ControlSocket;
use crate::version::ServerVersion;

/// The eight logical schema tables. Which of them are readable depends on
/// the server version; how they are named depends on the layout lineage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LogicalTable {
    Keyspaces,
    Tables,
    Views,
    Columns,
    Indexes,
    UserTypes,
    Functions,
    Aggregates,
}

/// Results of the bulk schema read, one slot per logical table. Slots that
/// the server version does not provide stay `None`.
#[derive(Debug, Default)]
struct SchemaScanRows {
    keyspaces: ResultRows,
    tables: Option<ResultRows>,
    views: Option<ResultRows>,
    columns: Option<ResultRows>,
    indexes: Option<ResultRows>,
    user_types: Option<ResultRows>,
    functions: Option<ResultRows>,
    aggregates: Option<ResultRows>,
}

fn bulk_queries(version: ServerVersion, use_schema: bool) -> Vec<(LogicalTable, &'static str)> {
    use LogicalTable::*;

    let mut selects = vec![(Keyspaces, queries::select_keyspaces(version))];
    if !use_schema {
        return selects;
    }

    if version >= ServerVersion::V3_0 {
        selects.extend([
            (Tables, queries::SELECT_TABLES_30),
            (Views, queries::SELECT_VIEWS_30),
            (Columns, queries::SELECT_COLUMNS_30),
            (Indexes, queries::SELECT_INDEXES_30),
            (UserTypes, queries::SELECT_USERTYPES_30),
            (Functions, queries::SELECT_FUNCTIONS_30),
            (Aggregates, queries::SELECT_AGGREGATES_30),
        ]);
    } else {
        selects.push((Tables, queries::SELECT_COLUMN_FAMILIES_20));
        selects.push((Columns, queries::SELECT_COLUMNS_20));
        if version >= ServerVersion::V2_1 {
            selects.push((UserTypes, queries::SELECT_USERTYPES_21));
        }
        if version >= ServerVersion::V2_2 {
            selects.push((Functions, queries::SELECT_FUNCTIONS_22));
            selects.push((Aggregates, queries::SELECT_AGGREGATES_22));
        }
    }
    selects
}

/// The chained schema read issued once after the host scan. Feeds the token
/// map with the keyspaces rows, then rebuilds the schema metadata through
/// the back buffer so readers switch snapshots atomically.
pub(crate) async fn run_schema_scan<S: ControlSession + ?Sized>(
    socket: &dyn ControlSocket,
    session: &S,
    version: ServerVersion,
    use_schema: bool,
    token_aware: bool,
    request_timeout: Duration,
) -> Result<(), ScanError> {
    if !use_schema && !token_aware {
        return Ok(());
    }

    let selects = bulk_queries(version, use_schema);
    let reads = selects.into_iter().map(|(table, text)| async move {
        query(socket, Statement::new(text), request_timeout)
            .await
            .map(|rows| (table, rows))
    });
    let results = future::try_join_all(reads).await?;

    let mut scan = SchemaScanRows::default();
    for (table, rows) in results {
        match table {
            LogicalTable::Keyspaces => scan.keyspaces = rows,
            LogicalTable::Tables => scan.tables = Some(rows),
            LogicalTable::Views => scan.views = Some(rows),
            LogicalTable::Columns => scan.columns = Some(rows),
            LogicalTable::Indexes => scan.indexes = Some(rows),
            LogicalTable::UserTypes => scan.user_types = Some(rows),
            LogicalTable::Functions => scan.functions = Some(rows),
            LogicalTable::Aggregates => scan.aggregates = Some(rows),
        }
    }

    if token_aware {
        session.token_map_keyspaces_add(version, &scan.keyspaces);
    }

    if use_schema {
        let metadata = session.metadata();
        metadata.clear_and_update_back(version);
        metadata.update_keyspaces(version, &scan.keyspaces);
        if let Some(rows) = &scan.tables {
            metadata.update_tables(version, rows);
        }
        if let Some(rows) = &scan.views {
            metadata.update_views(version, rows);
        }
        if let Some(rows) = &scan.columns {
            metadata.update_columns(version, rows);
        }
        if let Some(rows) = &scan.indexes {
            metadata.update_indexes(version, rows);
        }
        if let Some(rows) = &scan.user_types {
            metadata.update_user_types(version, rows);
        }
        if let Some(rows) = &scan.functions {
            metadata.update_functions(version, rows);
        }
        if let Some(rows) = &scan.aggregates {
            metadata.update_aggregates(version, rows);
        }
        metadata.swap_to_back_and_update_front();
    }

    Ok(())
}

/// Single-keyspace refresh. An empty result means the keyspace vanished
/// since the event fired; it is logged and dropped.
pub(crate) async fn refresh_keyspace<S: ControlSession + ?Sized>(
    socket: &dyn ControlSocket,
    session: &S,
    version: ServerVersion,
    use_schema: bool,
    token_aware: bool,
    keyspace: &str,
    request_timeout: Duration,
) -> Result<(), ScanError> {
    let statement = Statement::new(queries::select_keyspace_by_name(version, keyspace));
    debug!("Refreshing keyspace {}", statement.text);

    let result = query(socket, statement, request_timeout).await?;
    if result.is_empty() {
        error!("No row found for keyspace {} in system schema table.", keyspace);
        return Ok(());
    }

    if token_aware {
        session.token_map_keyspaces_update(version, &result);
    }
    if use_schema {
        session.metadata().update_keyspaces(version, &result);
    }
    Ok(())
}

/// Chained refresh of one table or view: table, columns and (modern layout)
/// view and index rows, filtered by name. An empty table result with a
/// non-empty view result means the name is a view.
pub(crate) async fn refresh_table_or_view<S: ControlSession + ?Sized>(
    socket: &dyn ControlSocket,
    session: &S,
    version: ServerVersion,
    keyspace: &str,
    name: &str,
    request_timeout: Duration,
) -> Result<(), ScanError> {
    let modern = version >= ServerVersion::V3_0;

    let table_query = queries::select_table_by_name(version, keyspace, name);
    let columns_query = queries::select_columns_by_table(version, keyspace, name);
    debug!("Refreshing table/view {}; {}", table_query, columns_query);

    let tables_read = query(socket, Statement::new(table_query), request_timeout);
    let columns_read = query(socket, Statement::new(columns_query), request_timeout);

    let (tables, columns, views, indexes) = if modern {
        let views_read = query(
            socket,
            Statement::new(queries::select_view_by_name(keyspace, name)),
            request_timeout,
        );
        let indexes_read = query(
            socket,
            Statement::new(queries::select_indexes_by_table(keyspace, name)),
            request_timeout,
        );
        let (tables, columns, views, indexes) =
            futures::try_join!(tables_read, columns_read, views_read, indexes_read)?;
        (tables, columns, Some(views), Some(indexes))
    } else {
        let (tables, columns) = futures::try_join!(tables_read, columns_read)?;
        (tables, columns, None, None)
    };

    let metadata = session.metadata();

    if tables.is_empty() {
        match &views {
            Some(views) if !views.is_empty() => metadata.update_views(version, views),
            _ => {
                error!(
                    "No row found for table (or view) {}.{} in system schema tables.",
                    keyspace, name
                );
                return Ok(());
            }
        }
    } else {
        metadata.update_tables(version, &tables);
    }

    metadata.update_columns(version, &columns);
    if let Some(indexes) = &indexes {
        metadata.update_indexes(version, indexes);
    }
    Ok(())
}

/// Single user-type refresh by (keyspace, name).
pub(crate) async fn refresh_type<S: ControlSession + ?Sized>(
    socket: &dyn ControlSocket,
    session: &S,
    version: ServerVersion,
    keyspace: &str,
    name: &str,
    request_timeout: Duration,
) -> Result<(), ScanError> {
    let statement = Statement::new(queries::select_type_by_name(version, keyspace, name));
    debug!("Refreshing type {}", statement.text);

    let result = query(socket, statement, request_timeout).await?;
    if result.is_empty() {
        error!(
            "No row found for keyspace {} and type {} in system schema.",
            keyspace, name
        );
        return Ok(());
    }
    session.metadata().update_user_types(version, &result);
    Ok(())
}

/// Single function or aggregate refresh; the bound argument-type list picks
/// the overload.
pub(crate) async fn refresh_function<S: ControlSession + ?Sized>(
    socket: &dyn ControlSocket,
    session: &S,
    version: ServerVersion,
    keyspace: &str,
    name: &str,
    arg_types: &[String],
    is_aggregate: bool,
    request_timeout: Duration,
) -> Result<(), ScanError> {
    debug!(
        "Refreshing {} {} in keyspace {}",
        if is_aggregate { "aggregate" } else { "function" },
        full_function_name(name, arg_types),
        keyspace
    );

    let statement =
        queries::select_function_by_signature(version, keyspace, name, arg_types, is_aggregate);
    let result = query(socket, statement, request_timeout).await?;
    if result.is_empty() {
        error!(
            "No row found for keyspace {} and {} {}",
            keyspace,
            if is_aggregate { "aggregate" } else { "function" },
            full_function_name(name, arg_types)
        );
        return Ok(());
    }

    if is_aggregate {
        session.metadata().update_aggregates(version, &result);
    } else {
        session.metadata().update_functions(version, &result);
    }
    Ok(())
}
