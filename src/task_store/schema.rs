//! Database schema for the task state database.

use crate::sqlite_column;
use crate::sqlite_persistence::{SqlType, Table, VersionedSchema};
use anyhow::Result;
use rusqlite::Connection;

// =============================================================================
// Version 0
// =============================================================================

const TASK_STATES_TABLE_V0: Table = Table {
    name: "task_states",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("title", &SqlType::Text, non_null = true),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("payload", &SqlType::Blob, non_null = true),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
        sqlite_column!("completed_at", &SqlType::Integer),
        sqlite_column!(
            "error",
            &SqlType::Text,
            non_null = true,
            default_value = Some("''")
        ),
    ],
    indices: &[("idx_task_states_status", "status, created_at")],
};

// =============================================================================
// Version 1 - audit trail of task lifecycle events
// =============================================================================

const TASK_EVENTS_TABLE_V1: Table = Table {
    name: "task_events",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("task_id", &SqlType::Text, non_null = true),
        sqlite_column!("event_type", &SqlType::Text, non_null = true),
        sqlite_column!("timestamp", &SqlType::Integer, non_null = true),
        sqlite_column!("details", &SqlType::Text),
    ],
    indices: &[("idx_task_events_task", "task_id, timestamp")],
};

fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
    TASK_EVENTS_TABLE_V1.create(conn)
}

pub const TASK_STATE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 0,
        tables: &[TASK_STATES_TABLE_V0],
        migration: None,
    },
    VersionedSchema {
        version: 1,
        tables: &[TASK_STATES_TABLE_V0, TASK_EVENTS_TABLE_V1],
        migration: Some(migrate_v0_to_v1),
    },
];
