//! DDL for the unit store database.

use rusqlite::Connection;

use crate::error::StoreResult;
use crate::retry::with_retry;

pub(crate) fn create_tables(conn: &Connection) -> StoreResult<()> {
    with_retry("create_tables", || {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;
            PRAGMA synchronous = NORMAL;

            CREATE TABLE IF NOT EXISTS categories(
                name        TEXT PRIMARY KEY,
                cores       INTEGER NOT NULL,
                memory_mb   INTEGER NOT NULL,
                runtime_s   INTEGER NOT NULL,
                tasks_max   INTEGER
            );

            CREATE TABLE IF NOT EXISTS workflows(
                label            TEXT PRIMARY KEY,
                category         TEXT NOT NULL,
                prerequisite     TEXT,
                merge_size_bytes INTEGER NOT NULL,
                unit_chunk_size  INTEGER NOT NULL,
                output_filename  TEXT NOT NULL,
                total_events     INTEGER NOT NULL,
                total_units      INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dependencies(
                child_label   TEXT NOT NULL,
                parent_label  TEXT NOT NULL,
                units_expected INTEGER NOT NULL,
                PRIMARY KEY (child_label, parent_label)
            );

            CREATE TABLE IF NOT EXISTS files(
                row_id          INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_label  TEXT NOT NULL,
                file_id         TEXT NOT NULL,
                events          INTEGER NOT NULL,
                bytes           INTEGER NOT NULL,
                skipped         INTEGER NOT NULL DEFAULT 0,
                UNIQUE (workflow_label, file_id)
            );

            CREATE TABLE IF NOT EXISTS units(
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_label   TEXT NOT NULL,
                file_row_id      INTEGER NOT NULL REFERENCES files(row_id),
                run              INTEGER NOT NULL,
                lumi             INTEGER NOT NULL,
                state            INTEGER NOT NULL,
                task_id          INTEGER,
                retry_count      INTEGER NOT NULL DEFAULT 0,
                events_processed INTEGER NOT NULL DEFAULT 0,
                UNIQUE (workflow_label, file_row_id, run, lumi)
            );
            CREATE INDEX IF NOT EXISTS idx_units_pop
                ON units(workflow_label, state, file_row_id, run, lumi);
            CREATE INDEX IF NOT EXISTS idx_units_task ON units(task_id);

            CREATE TABLE IF NOT EXISTS tasks(
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_label  TEXT NOT NULL,
                category        TEXT NOT NULL,
                type            INTEGER NOT NULL,
                status          INTEGER NOT NULL,
                created_at      TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'NOW')),
                retry_count     INTEGER NOT NULL DEFAULT 0,
                exit_code       INTEGER,
                host            TEXT,
                bytes_sent      INTEGER NOT NULL DEFAULT 0,
                bytes_received  INTEGER NOT NULL DEFAULT 0,
                bytes_output    INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_workflow_status
                ON tasks(workflow_label, status, type);

            CREATE TABLE IF NOT EXISTS merge_components(
                merge_task_id     INTEGER NOT NULL REFERENCES tasks(id),
                component_task_id INTEGER NOT NULL REFERENCES tasks(id),
                PRIMARY KEY (merge_task_id, component_task_id)
            );

            -- Durable task -> unit association, kept after units.task_id is
            -- cleared on completion so merge handling can look up which
            -- units a finished PROCESS task covered.
            CREATE TABLE IF NOT EXISTS task_units(
                task_id INTEGER NOT NULL REFERENCES tasks(id),
                unit_id INTEGER NOT NULL REFERENCES units(id),
                PRIMARY KEY (task_id, unit_id)
            );
            "#,
        )
    })
}
