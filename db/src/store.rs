//! SQL plumbing for persisted checkpoint windows.
//!
//! Three tables: `window_bytes` holds one compressed blob per window,
//! `window_ids` maps checkpoint ids to their window (indexed for point
//! lookups), and `window_ticks` holds each window's tick span (indexed for
//! range intersections).

use crate::codec::EncodedWindow;
use rewind_checkpoint::{ChkptId, Tick};
use rusqlite::{params, Connection, OptionalExtension};

pub(crate) fn create_tables(conn: &Connection) -> Result<(), rusqlite::Error> {
    let sql = r#"
    CREATE TABLE IF NOT EXISTS window_bytes (
    id INTEGER PRIMARY KEY NOT NULL,
    bytes BLOB NOT NULL
    );
    CREATE TABLE IF NOT EXISTS window_ids (
    window_bytes_id INTEGER NOT NULL,
    chkpt_id INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_chkpt_id_on_window_ids ON window_ids (chkpt_id);
    CREATE TABLE IF NOT EXISTS window_ticks (
    window_bytes_id INTEGER NOT NULL,
    start_tick INTEGER NOT NULL,
    end_tick INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_span_on_window_ticks ON window_ticks (start_tick, end_tick);
    "#;
    conn.execute_batch(sql)
}

/// Inserts one encoded window and its index rows atomically.
pub(crate) fn insert_window(
    conn: &mut Connection,
    window: &EncodedWindow,
) -> Result<(), rusqlite::Error> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO window_bytes (bytes) VALUES (?1)",
        params![window.bytes],
    )?;
    let window_bytes_id = tx.last_insert_rowid();
    {
        let mut stmt =
            tx.prepare("INSERT INTO window_ids (window_bytes_id, chkpt_id) VALUES (?1, ?2)")?;
        for id in &window.ids {
            stmt.execute(params![window_bytes_id, *id as i64])?;
        }
    }
    tx.execute(
        "INSERT INTO window_ticks (window_bytes_id, start_tick, end_tick) VALUES (?1, ?2, ?3)",
        params![
            window_bytes_id,
            window.start_tick as i64,
            window.end_tick as i64
        ],
    )?;
    tx.commit()
}

/// Point lookup: is this checkpoint persisted?
pub(crate) fn has_checkpoint(conn: &Connection, id: ChkptId) -> Result<bool, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT 1 FROM window_ids WHERE chkpt_id = ?1 LIMIT 1")?;
    stmt.exists(params![id as i64])
}

/// The compressed window containing `id`, if persisted.
pub(crate) fn window_bytes_by_chkpt(
    conn: &Connection,
    id: ChkptId,
) -> Result<Option<Vec<u8>>, rusqlite::Error> {
    conn.query_row(
        "SELECT wb.bytes FROM window_bytes wb \
         JOIN window_ids wi ON wi.window_bytes_id = wb.id \
         WHERE wi.chkpt_id = ?1",
        params![id as i64],
        |row| row.get(0),
    )
    .optional()
}

/// Windows whose tick span intersects `tick`.
pub(crate) fn window_bytes_at_tick(
    conn: &Connection,
    tick: Tick,
) -> Result<Vec<Vec<u8>>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT wb.bytes FROM window_bytes wb \
         JOIN window_ticks wt ON wt.window_bytes_id = wb.id \
         WHERE wt.start_tick <= ?1 AND wt.end_tick >= ?1",
    )?;
    let rows = stmt.query_map(params![tick as i64], |row| row.get(0))?;
    rows.collect()
}

/// Every persisted checkpoint id, ascending.
pub(crate) fn all_chkpt_ids(conn: &Connection) -> Result<Vec<ChkptId>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT chkpt_id FROM window_ids ORDER BY chkpt_id")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    rows.map(|r| r.map(|id| id as ChkptId)).collect()
}

/// Windows holding any checkpoint id at or beyond `from`, with their id
/// bounds. Used by rollback truncation.
pub(crate) fn windows_reaching(
    conn: &Connection,
    from: ChkptId,
) -> Result<Vec<(i64, ChkptId, ChkptId)>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT window_bytes_id, MIN(chkpt_id), MAX(chkpt_id) FROM window_ids \
         GROUP BY window_bytes_id HAVING MAX(chkpt_id) >= ?1",
    )?;
    let rows = stmt.query_map(params![from as i64], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)? as ChkptId,
            row.get::<_, i64>(2)? as ChkptId,
        ))
    })?;
    rows.collect()
}

pub(crate) fn window_bytes_by_rowid(
    conn: &Connection,
    rowid: i64,
) -> Result<Vec<u8>, rusqlite::Error> {
    conn.query_row(
        "SELECT bytes FROM window_bytes WHERE id = ?1",
        params![rowid],
        |row| row.get(0),
    )
}

/// Removes a window and its index rows.
pub(crate) fn delete_window(conn: &mut Connection, rowid: i64) -> Result<(), rusqlite::Error> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM window_bytes WHERE id = ?1", params![rowid])?;
    tx.execute(
        "DELETE FROM window_ids WHERE window_bytes_id = ?1",
        params![rowid],
    )?;
    tx.execute(
        "DELETE FROM window_ticks WHERE window_bytes_id = ?1",
        params![rowid],
    )?;
    tx.commit()
}

/// Replaces a window in place after a rollback shrank it.
pub(crate) fn replace_window(
    conn: &mut Connection,
    rowid: i64,
    window: &EncodedWindow,
) -> Result<(), rusqlite::Error> {
    let tx = conn.transaction()?;
    tx.execute(
        "UPDATE window_bytes SET bytes = ?2 WHERE id = ?1",
        params![rowid, window.bytes],
    )?;
    tx.execute(
        "DELETE FROM window_ids WHERE window_bytes_id = ?1",
        params![rowid],
    )?;
    {
        let mut stmt =
            tx.prepare("INSERT INTO window_ids (window_bytes_id, chkpt_id) VALUES (?1, ?2)")?;
        for id in &window.ids {
            stmt.execute(params![rowid, *id as i64])?;
        }
    }
    tx.execute(
        "UPDATE window_ticks SET start_tick = ?2, end_tick = ?3 WHERE window_bytes_id = ?1",
        params![rowid, window.start_tick as i64, window.end_tick as i64],
    )?;
    tx.commit()
}
