mod versioned_schema;

pub use versioned_schema::{
    open_or_create, read_version, Column, SqlType, Table, VersionedSchema, BASE_DB_VERSION,
};
