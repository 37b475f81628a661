//! SQLite schema definitions and migrations.
//!
//! Creates the identity, version, dictionary and parameter tables the store
//! expects, plus one set of parameter tables per configured resource type.
//! Everything is idempotent; calling [`initialize_schema`] on an existing
//! database only adds what is missing.

use rusqlite::{Connection, params};

use crate::dialect::{FHIR_REF_SEQUENCE, FHIR_SEQUENCE};
use crate::error::{StorageResult, data_access};
use crate::search::{ParameterTable, WholeSystemTable};
use crate::store::validate_resource_type_name;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Initial value of `logical_resources.reindex_tstamp`; older than any cutoff.
pub const REINDEX_EPOCH: &str = "1970-01-01T00:00:00.000000Z";

/// Initialize the database schema for the given resource types.
pub fn initialize_schema(conn: &Connection, resource_types: &[String]) -> StorageResult<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_schema_v1(conn)?;
        set_schema_version(conn, 1)?;
        migrate_schema(conn, 1)?;
    } else if current_version < SCHEMA_VERSION {
        migrate_schema(conn, current_version)?;
    }

    for resource_type in resource_types {
        create_resource_type(conn, resource_type)?;
    }

    Ok(())
}

/// Loads the resource type dictionary.
pub fn load_resource_types(conn: &Connection) -> StorageResult<Vec<(String, i32)>> {
    let mut stmt = conn.prepare("SELECT resource_type, resource_type_id FROM resource_types")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut types = Vec::new();
    for row in rows {
        types.push(row?);
    }
    Ok(types)
}

fn execute(conn: &Connection, sql: &str, what: &str) -> StorageResult<()> {
    conn.execute_batch(sql)
        .map_err(|e| data_access(format!("Failed to create {}: {}", what, e)))
}

/// Get the current schema version.
fn get_schema_version(conn: &Connection) -> StorageResult<i32> {
    execute(
        conn,
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        "schema_version table",
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

/// Set the schema version.
fn set_schema_version(conn: &Connection, version: i32) -> StorageResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Run migrations from the given version to the current one.
fn migrate_schema(conn: &Connection, from_version: i32) -> StorageResult<()> {
    let mut version = from_version;
    while version < SCHEMA_VERSION {
        match version {
            1 => migrate_v1_to_v2(conn)?,
            other => {
                return Err(data_access(format!(
                    "no migration path from schema version {}",
                    other
                )));
            }
        }
        version += 1;
        set_schema_version(conn, version)?;
    }
    Ok(())
}

/// Migrate from schema version 1 to version 2.
///
/// Adds the natural-key index on `logical_resources` used by the index
/// message readiness check.
fn migrate_v1_to_v2(conn: &Connection) -> StorageResult<()> {
    execute(
        conn,
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_logical_resources_natural
            ON logical_resources(resource_type_id, logical_id)",
        "logical_resources natural key index",
    )
}

/// Create the initial schema (version 1).
fn create_schema_v1(conn: &Connection) -> StorageResult<()> {
    execute(
        conn,
        "CREATE TABLE IF NOT EXISTS id_sequences (
            sequence_name TEXT PRIMARY KEY,
            last_value INTEGER NOT NULL
        )",
        "id_sequences table",
    )?;
    for sequence in [FHIR_SEQUENCE, FHIR_REF_SEQUENCE] {
        conn.execute(
            "INSERT INTO id_sequences (sequence_name, last_value) VALUES (?1, 0)
             ON CONFLICT DO NOTHING",
            params![sequence],
        )?;
    }

    execute(
        conn,
        "CREATE TABLE IF NOT EXISTS resource_types (
            resource_type_id INTEGER PRIMARY KEY,
            resource_type TEXT NOT NULL UNIQUE
        )",
        "resource_types table",
    )?;

    execute(
        conn,
        "CREATE TABLE IF NOT EXISTS logical_resource_ident (
            logical_resource_id INTEGER PRIMARY KEY,
            resource_type_id INTEGER NOT NULL REFERENCES resource_types (resource_type_id),
            logical_id TEXT NOT NULL,
            UNIQUE (resource_type_id, logical_id)
        )",
        "logical_resource_ident table",
    )?;

    execute(
        conn,
        &format!(
            "CREATE TABLE IF NOT EXISTS logical_resources (
                logical_resource_id INTEGER PRIMARY KEY
                    REFERENCES logical_resource_ident (logical_resource_id),
                resource_type_id INTEGER NOT NULL,
                logical_id TEXT NOT NULL,
                current_resource_id INTEGER NOT NULL,
                version_id INTEGER NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                last_updated TEXT NOT NULL,
                parameter_hash TEXT,
                shard_key INTEGER NOT NULL DEFAULT 0,
                reindex_tstamp TEXT NOT NULL DEFAULT '{}',
                reindex_txid INTEGER NOT NULL DEFAULT 0
            )",
            REINDEX_EPOCH
        ),
        "logical_resources table",
    )?;

    execute(
        conn,
        "CREATE TABLE IF NOT EXISTS resources (
            resource_id INTEGER PRIMARY KEY,
            logical_resource_id INTEGER NOT NULL
                REFERENCES logical_resources (logical_resource_id),
            version_id INTEGER NOT NULL,
            data BLOB,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            last_updated TEXT NOT NULL,
            UNIQUE (logical_resource_id, version_id)
        )",
        "resources table",
    )?;

    execute(
        conn,
        "CREATE TABLE IF NOT EXISTS parameter_names (
            parameter_name_id INTEGER PRIMARY KEY,
            parameter_name TEXT NOT NULL UNIQUE
        )",
        "parameter_names table",
    )?;

    execute(
        conn,
        "CREATE TABLE IF NOT EXISTS code_systems (
            code_system_id INTEGER PRIMARY KEY,
            code_system_name TEXT NOT NULL UNIQUE
        )",
        "code_systems table",
    )?;

    execute(
        conn,
        "CREATE TABLE IF NOT EXISTS common_token_values (
            common_token_value_id INTEGER PRIMARY KEY,
            shard_key INTEGER NOT NULL DEFAULT 0,
            code_system_id INTEGER NOT NULL REFERENCES code_systems (code_system_id),
            token_value TEXT NOT NULL,
            UNIQUE (shard_key, code_system_id, token_value)
        )",
        "common_token_values table",
    )?;

    execute(
        conn,
        "CREATE TABLE IF NOT EXISTS common_canonical_values (
            canonical_id INTEGER PRIMARY KEY,
            url TEXT NOT NULL UNIQUE
        )",
        "common_canonical_values table",
    )?;

    for table in WholeSystemTable::ALL {
        execute(conn, &whole_system_ddl(table), table.name())?;
    }

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_logical_resources_reindex ON logical_resources(reindex_tstamp, logical_resource_id)",
        "CREATE INDEX IF NOT EXISTS idx_resources_logical ON resources(logical_resource_id, version_id)",
        "CREATE INDEX IF NOT EXISTS idx_str_values_lr ON str_values(logical_resource_id)",
        "CREATE INDEX IF NOT EXISTS idx_str_values_lcase ON str_values(parameter_name_id, str_value_lcase)",
        "CREATE INDEX IF NOT EXISTS idx_date_values_lr ON date_values(logical_resource_id)",
        "CREATE INDEX IF NOT EXISTS idx_resource_token_refs_lr ON resource_token_refs(logical_resource_id)",
        "CREATE INDEX IF NOT EXISTS idx_logical_resource_tags_lr ON logical_resource_tags(logical_resource_id)",
        "CREATE INDEX IF NOT EXISTS idx_logical_resource_profiles_lr ON logical_resource_profiles(logical_resource_id)",
        "CREATE INDEX IF NOT EXISTS idx_logical_resource_security_lr ON logical_resource_security(logical_resource_id)",
    ];
    for sql in indexes {
        execute(conn, sql, "index")?;
    }

    Ok(())
}

/// Registers a resource type and creates its parameter tables.
fn create_resource_type(conn: &Connection, resource_type: &str) -> StorageResult<()> {
    validate_resource_type_name(resource_type)?;

    conn.execute(
        "INSERT INTO resource_types (resource_type) VALUES (?1) ON CONFLICT DO NOTHING",
        params![resource_type],
    )?;

    for table in ParameterTable::ALL {
        let name = table.for_type(resource_type);
        execute(conn, &per_type_ddl(table, &name), &name)?;
        execute(
            conn,
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{name}_lr ON {name}(logical_resource_id)"
            ),
            &name,
        )?;
    }

    Ok(())
}

fn per_type_ddl(table: ParameterTable, name: &str) -> String {
    let body = match table {
        ParameterTable::StrValues => {
            "parameter_name_id INTEGER NOT NULL REFERENCES parameter_names (parameter_name_id),
             str_value TEXT,
             str_value_lcase TEXT,
             logical_resource_id INTEGER NOT NULL,
             composite_id INTEGER"
        }
        ParameterTable::NumberValues => {
            "parameter_name_id INTEGER NOT NULL REFERENCES parameter_names (parameter_name_id),
             number_value REAL,
             number_value_low REAL,
             number_value_high REAL,
             logical_resource_id INTEGER NOT NULL,
             composite_id INTEGER"
        }
        ParameterTable::DateValues => {
            "parameter_name_id INTEGER NOT NULL REFERENCES parameter_names (parameter_name_id),
             date_start TEXT,
             date_end TEXT,
             logical_resource_id INTEGER NOT NULL,
             composite_id INTEGER"
        }
        ParameterTable::QuantityValues => {
            "parameter_name_id INTEGER NOT NULL REFERENCES parameter_names (parameter_name_id),
             code TEXT,
             quantity_value REAL,
             quantity_value_low REAL,
             quantity_value_high REAL,
             code_system_id INTEGER,
             logical_resource_id INTEGER NOT NULL,
             composite_id INTEGER"
        }
        ParameterTable::LatlngValues => {
            "parameter_name_id INTEGER NOT NULL REFERENCES parameter_names (parameter_name_id),
             latitude_value REAL,
             longitude_value REAL,
             logical_resource_id INTEGER NOT NULL,
             composite_id INTEGER"
        }
        ParameterTable::ResourceTokenRefs => {
            "parameter_name_id INTEGER NOT NULL REFERENCES parameter_names (parameter_name_id),
             common_token_value_id INTEGER NOT NULL REFERENCES common_token_values (common_token_value_id),
             logical_resource_id INTEGER NOT NULL,
             composite_id INTEGER"
        }
        ParameterTable::RefValues => {
            "parameter_name_id INTEGER NOT NULL REFERENCES parameter_names (parameter_name_id),
             ref_logical_resource_id INTEGER NOT NULL,
             ref_version_id INTEGER,
             logical_resource_id INTEGER NOT NULL,
             composite_id INTEGER"
        }
        ParameterTable::Profiles => {
            "canonical_id INTEGER NOT NULL REFERENCES common_canonical_values (canonical_id),
             version TEXT,
             fragment TEXT,
             logical_resource_id INTEGER NOT NULL"
        }
        ParameterTable::Tags | ParameterTable::Security => {
            "common_token_value_id INTEGER NOT NULL REFERENCES common_token_values (common_token_value_id),
             logical_resource_id INTEGER NOT NULL"
        }
    };
    format!("CREATE TABLE IF NOT EXISTS {} ({})", name, body)
}

fn whole_system_ddl(table: WholeSystemTable) -> String {
    let body = match table {
        WholeSystemTable::StrValues => {
            "parameter_name_id INTEGER NOT NULL,
             str_value TEXT,
             str_value_lcase TEXT,
             logical_resource_id INTEGER NOT NULL,
             resource_type_id INTEGER NOT NULL"
        }
        WholeSystemTable::DateValues => {
            "parameter_name_id INTEGER NOT NULL,
             date_start TEXT,
             date_end TEXT,
             logical_resource_id INTEGER NOT NULL,
             resource_type_id INTEGER NOT NULL"
        }
        WholeSystemTable::ResourceTokenRefs => {
            "parameter_name_id INTEGER NOT NULL,
             common_token_value_id INTEGER NOT NULL,
             logical_resource_id INTEGER NOT NULL,
             resource_type_id INTEGER NOT NULL"
        }
        WholeSystemTable::Tags | WholeSystemTable::Security => {
            "common_token_value_id INTEGER NOT NULL,
             logical_resource_id INTEGER NOT NULL,
             resource_type_id INTEGER NOT NULL"
        }
        WholeSystemTable::Profiles => {
            "canonical_id INTEGER NOT NULL,
             version TEXT,
             fragment TEXT,
             logical_resource_id INTEGER NOT NULL,
             resource_type_id INTEGER NOT NULL"
        }
    };
    format!("CREATE TABLE IF NOT EXISTS {} ({})", table.name(), body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types() -> Vec<String> {
        vec!["Patient".to_string(), "Observation".to_string()]
    }

    #[test]
    fn test_initialize_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn, &types()).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'patient_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, ParameterTable::ALL.len() as i64);

        let types = load_resource_types(&conn).unwrap();
        assert_eq!(types.len(), 2);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn, &types()).unwrap();
        initialize_schema(&conn, &types()).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
        assert_eq!(load_resource_types(&conn).unwrap().len(), 2);

        let seq: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM id_sequences",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(seq, 2);
    }

    #[test]
    fn test_migrates_v1_database() {
        let conn = Connection::open_in_memory().unwrap();
        get_schema_version(&conn).unwrap();
        create_schema_v1(&conn).unwrap();
        set_schema_version(&conn, 1).unwrap();

        initialize_schema(&conn, &types()).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        let index: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                  WHERE type = 'index' AND name = 'idx_logical_resources_natural'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn test_rejects_unsafe_type_names() {
        let conn = Connection::open_in_memory().unwrap();
        let result = initialize_schema(&conn, &["Patient; DROP TABLE x".to_string()]);
        assert!(result.is_err());
    }
}
