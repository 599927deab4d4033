//! Schema definitions and introspection for the embedded engine.

pub mod ddl;
pub mod introspect;

pub use ddl::{
    mentions_identifier, quote_ident, touch_trigger_name, touch_trigger_sql, ColumnDef, IndexDef,
    TableDef,
};
pub use introspect::{
    column_exists, columns, dependent_tables, foreign_key_violations, foreign_keys_enabled,
    index_exists, list_schema_objects, list_tables, master_entries, row_count, set_foreign_keys,
    table_exists, view_exists, ColumnInfo, ForeignKeyViolation, MasterEntry, StoredObject,
};
