use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "quality.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS criteria(
            id TEXT PRIMARY KEY,
            part TEXT NOT NULL,
            chapter TEXT NOT NULL,
            criterion_name TEXT NOT NULL,
            level_label TEXT NOT NULL,
            sub_item_code TEXT NOT NULL UNIQUE,
            sub_item_text TEXT NOT NULL,
            tags TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_criteria_sort ON criteria(sort_order)",
        [],
    )?;

    // Flattened sheet rows. Raw verdicts only: the achieved level of a
    // criterion is derived on read, never stored.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sheet_rows(
            sheet_id TEXT NOT NULL,
            sub_item_code TEXT NOT NULL,
            part TEXT NOT NULL,
            chapter TEXT NOT NULL,
            criterion_name TEXT NOT NULL,
            level_label TEXT NOT NULL,
            sub_item_text TEXT NOT NULL,
            verdict TEXT NOT NULL,
            notes TEXT NOT NULL DEFAULT '',
            evidence_json TEXT NOT NULL DEFAULT '[]',
            evaluation_date TEXT NOT NULL,
            evaluator_name TEXT NOT NULL,
            evaluated_unit TEXT NOT NULL,
            group_filter TEXT NOT NULL,
            updated_at TEXT,
            PRIMARY KEY(sheet_id, sub_item_code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sheet_rows_sheet ON sheet_rows(sheet_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sheet_rows_code ON sheet_rows(sub_item_code)",
        [],
    )?;

    ensure_sheet_rows_updated_at(&conn)?;

    Ok(conn)
}

// Workspaces created before the edit-history work may lack updated_at.
fn ensure_sheet_rows_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "sheet_rows", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE sheet_rows ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
