//! The CQL text issued on the control connection.
//!
//! The host queries come in plain and token-carrying variants; the schema
//! queries come in the legacy (`system.schema_*`, pre-3.0) and modern
//! (`system_schema.*`) layouts. Targeted variants append `WHERE` clauses
//! with quoted identifiers; the function/aggregate lookup is parameterized
//! instead, because the argument-type list is a bound value.

use crate::rows::{CqlValue, Statement};
use crate::version::ServerVersion;

pub(crate) const SELECT_LOCAL: &str =
    "SELECT data_center, rack, release_version FROM system.local WHERE key='local'";
pub(crate) const SELECT_LOCAL_TOKENS: &str =
    "SELECT data_center, rack, release_version, partitioner, tokens FROM system.local WHERE key='local'";
pub(crate) const SELECT_PEERS: &str =
    "SELECT peer, data_center, rack, release_version, rpc_address FROM system.peers";
pub(crate) const SELECT_PEERS_TOKENS: &str =
    "SELECT peer, data_center, rack, release_version, rpc_address, tokens FROM system.peers";

pub(crate) const SELECT_KEYSPACES_20: &str = "SELECT * FROM system.schema_keyspaces";
pub(crate) const SELECT_COLUMN_FAMILIES_20: &str = "SELECT * FROM system.schema_columnfamilies";
pub(crate) const SELECT_COLUMNS_20: &str = "SELECT * FROM system.schema_columns";
pub(crate) const SELECT_USERTYPES_21: &str = "SELECT * FROM system.schema_usertypes";
pub(crate) const SELECT_FUNCTIONS_22: &str = "SELECT * FROM system.schema_functions";
pub(crate) const SELECT_AGGREGATES_22: &str = "SELECT * FROM system.schema_aggregates";

pub(crate) const SELECT_KEYSPACES_30: &str = "SELECT * FROM system_schema.keyspaces";
pub(crate) const SELECT_TABLES_30: &str = "SELECT * FROM system_schema.tables";
pub(crate) const SELECT_VIEWS_30: &str = "SELECT * FROM system_schema.views";
pub(crate) const SELECT_COLUMNS_30: &str = "SELECT * FROM system_schema.columns";
pub(crate) const SELECT_INDEXES_30: &str = "SELECT * FROM system_schema.indexes";
pub(crate) const SELECT_USERTYPES_30: &str = "SELECT * FROM system_schema.types";
pub(crate) const SELECT_FUNCTIONS_30: &str = "SELECT * FROM system_schema.functions";
pub(crate) const SELECT_AGGREGATES_30: &str = "SELECT * FROM system_schema.aggregates";

fn modern(version: ServerVersion) -> bool {
    version >= ServerVersion::V3_0
}

pub(crate) fn select_local(with_tokens: bool) -> &'static str {
    if with_tokens {
        SELECT_LOCAL_TOKENS
    } else {
        SELECT_LOCAL
    }
}

pub(crate) fn select_peers(with_tokens: bool) -> &'static str {
    if with_tokens {
        SELECT_PEERS_TOKENS
    } else {
        SELECT_PEERS
    }
}

pub(crate) fn select_peer_by_listen_address(with_tokens: bool, listen_address: &str) -> String {
    format!(
        "{} WHERE peer = '{}'",
        select_peers(with_tokens),
        listen_address
    )
}

pub(crate) fn select_keyspaces(version: ServerVersion) -> &'static str {
    if modern(version) {
        SELECT_KEYSPACES_30
    } else {
        SELECT_KEYSPACES_20
    }
}

pub(crate) fn select_keyspace_by_name(version: ServerVersion, keyspace: &str) -> String {
    format!(
        "{} WHERE keyspace_name='{}'",
        select_keyspaces(version),
        keyspace
    )
}

pub(crate) fn select_table_by_name(
    version: ServerVersion,
    keyspace: &str,
    table: &str,
) -> String {
    if modern(version) {
        format!(
            "{SELECT_TABLES_30} WHERE keyspace_name='{keyspace}' AND table_name='{table}'"
        )
    } else {
        format!(
            "{SELECT_COLUMN_FAMILIES_20} WHERE keyspace_name='{keyspace}' AND columnfamily_name='{table}'"
        )
    }
}

/// Modern layout only.
pub(crate) fn select_view_by_name(keyspace: &str, view: &str) -> String {
    format!("{SELECT_VIEWS_30} WHERE keyspace_name='{keyspace}' AND view_name='{view}'")
}

pub(crate) fn select_columns_by_table(
    version: ServerVersion,
    keyspace: &str,
    table: &str,
) -> String {
    if modern(version) {
        format!(
            "{SELECT_COLUMNS_30} WHERE keyspace_name='{keyspace}' AND table_name='{table}'"
        )
    } else {
        format!(
            "{SELECT_COLUMNS_20} WHERE keyspace_name='{keyspace}' AND columnfamily_name='{table}'"
        )
    }
}

/// Modern layout only.
pub(crate) fn select_indexes_by_table(keyspace: &str, table: &str) -> String {
    format!("{SELECT_INDEXES_30} WHERE keyspace_name='{keyspace}' AND table_name='{table}'")
}

pub(crate) fn select_type_by_name(
    version: ServerVersion,
    keyspace: &str,
    type_name: &str,
) -> String {
    let base = if modern(version) {
        SELECT_USERTYPES_30
    } else {
        SELECT_USERTYPES_21
    };
    format!("{base} WHERE keyspace_name='{keyspace}' AND type_name='{type_name}'")
}

/// Parameterized lookup of one function or aggregate overload, bound as
/// (keyspace, name, argument-type list).
pub(crate) fn select_function_by_signature(
    version: ServerVersion,
    keyspace: &str,
    name: &str,
    arg_types: &[String],
    is_aggregate: bool,
) -> Statement {
    let text = match (modern(version), is_aggregate) {
        (true, true) => format!(
            "{SELECT_AGGREGATES_30} WHERE keyspace_name=? AND aggregate_name=? AND argument_types=?"
        ),
        (true, false) => format!(
            "{SELECT_FUNCTIONS_30} WHERE keyspace_name=? AND function_name=? AND argument_types=?"
        ),
        (false, true) => format!(
            "{SELECT_AGGREGATES_22} WHERE keyspace_name=? AND aggregate_name=? AND signature=?"
        ),
        (false, false) => format!(
            "{SELECT_FUNCTIONS_22} WHERE keyspace_name=? AND function_name=? AND signature=?"
        ),
    };
    Statement::with_values(
        text,
        vec![
            CqlValue::Text(keyspace.to_owned()),
            CqlValue::Text(name.to_owned()),
            CqlValue::TextList(arg_types.to_vec()),
        ],
    )
}
