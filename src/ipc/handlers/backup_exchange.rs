use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{self, CriterionRecord, ScoreEntry, ScoreMap};
use rusqlite::Connection;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;

fn handle_backup_export_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };
    let workspace_path = req
        .params
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone());
    let Some(workspace_path) = workspace_path else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    let out = PathBuf::from(&out_path);
    let export = match backup::export_workspace_bundle(&workspace_path, &out) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            )
        }
    };

    ok(
        &req.id,
        json!({
            "ok": true,
            "path": out_path,
            "bundleFormat": export.bundle_format,
            "entryCount": export.entry_count
        }),
    )
}

fn handle_backup_import_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing inPath", None),
    };
    let workspace_path = req
        .params
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone());
    let Some(workspace_path) = workspace_path else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path })),
        );
    }

    // Drop open handle before replacing file.
    state.db = None;

    let import = match backup::import_workspace_bundle(&src, &workspace_path) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": src.to_string_lossy() })),
            )
        }
    };

    match db::open_db(&workspace_path) {
        Ok(conn) => {
            state.workspace = Some(workspace_path.clone());
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "ok": true,
                    "workspacePath": workspace_path.to_string_lossy(),
                    "bundleFormatDetected": import.bundle_format_detected
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", e.to_string(), None),
    }
}

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

struct CsvRow {
    part: String,
    chapter: String,
    criterion_name: String,
    level_label: String,
    sub_item_code: String,
    sub_item_text: String,
    verdict: String,
    notes: String,
    evaluation_date: String,
    evaluator_name: String,
    evaluated_unit: String,
    group_filter: String,
}

fn export_rows(conn: &Connection, sheet_id: &str) -> Result<Vec<CsvRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT part, chapter, criterion_name, level_label, sub_item_code, sub_item_text,
                    verdict, notes, evaluation_date, evaluator_name, evaluated_unit, group_filter
             FROM sheet_rows
             WHERE sheet_id = ?
             ORDER BY rowid",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    stmt.query_map([sheet_id], |r| {
        Ok(CsvRow {
            part: r.get(0)?,
            chapter: r.get(1)?,
            criterion_name: r.get(2)?,
            level_label: r.get(3)?,
            sub_item_code: r.get(4)?,
            sub_item_text: r.get(5)?,
            verdict: r.get(6)?,
            notes: r.get(7)?,
            evaluation_date: r.get(8)?,
            evaluator_name: r.get(9)?,
            evaluated_unit: r.get(10)?,
            group_filter: r.get(11)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

/// CSV export of one sheet for the reporting side of the portal. The
/// achieved level column is derived from the verdicts at export time.
fn handle_exchange_export_sheet_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let sheet_id = match get_required_str(&req.params, "sheetId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };

    let rows = match export_rows(conn, &sheet_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if rows.is_empty() {
        return err(
            &req.id,
            "not_found",
            "sheet not found",
            Some(json!({ "sheetId": sheet_id })),
        );
    }

    // Recompute achieved levels per criterion from the stored verdicts.
    let mut scores = ScoreMap::new();
    let mut records: Vec<CriterionRecord> = Vec::with_capacity(rows.len());
    for row in &rows {
        scores.insert(
            row.sub_item_code.clone(),
            ScoreEntry {
                verdict: scoring::Verdict::parse(&row.verdict),
                ..Default::default()
            },
        );
        records.push(CriterionRecord {
            part: row.part.clone(),
            chapter: row.chapter.clone(),
            criterion_name: row.criterion_name.clone(),
            level_label: row.level_label.clone(),
            sub_item_code: row.sub_item_code.clone(),
            sub_item_text: row.sub_item_text.clone(),
            tags: row.group_filter.clone(),
        });
    }
    let tree = scoring::group_records(&records);
    let mut achieved_by_criterion: std::collections::HashMap<String, String> =
        std::collections::HashMap::new();
    for part in &tree {
        for chapter in &part.chapters {
            for criterion in &chapter.criteria {
                achieved_by_criterion.insert(
                    criterion.name.clone(),
                    scoring::achieved_level(&criterion.sub_items, &scores).label(),
                );
            }
        }
    }

    let mut out = String::new();
    out.push_str("sheet_id,part,chapter,criterion_name,level_label,sub_item_code,sub_item_text,verdict,notes,achieved_level,evaluation_date,evaluator_name,evaluated_unit,group_filter\n");
    for row in &rows {
        let achieved = achieved_by_criterion
            .get(&row.criterion_name)
            .map(|s| s.as_str())
            .unwrap_or("");
        let fields = [
            sheet_id.as_str(),
            row.part.as_str(),
            row.chapter.as_str(),
            row.criterion_name.as_str(),
            row.level_label.as_str(),
            row.sub_item_code.as_str(),
            row.sub_item_text.as_str(),
            row.verdict.as_str(),
            row.notes.as_str(),
            achieved,
            row.evaluation_date.as_str(),
            row.evaluator_name.as_str(),
            row.evaluated_unit.as_str(),
            row.group_filter.as_str(),
        ];
        let line: Vec<String> = fields.iter().map(|f| csv_quote(f)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }

    let write_result = (|| -> std::io::Result<()> {
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = std::fs::File::create(&out_path)?;
        f.write_all(out.as_bytes())
    })();

    match write_result {
        Ok(()) => ok(
            &req.id,
            json!({
                "ok": true,
                "path": out_path.to_string_lossy(),
                "rowCount": rows.len()
            }),
        ),
        Err(e) => err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": out_path.to_string_lossy() })),
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_backup_export_workspace_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_backup_import_workspace_bundle(state, req)),
        "exchange.exportSheetCsv" => Some(handle_exchange_export_sheet_csv(state, req)),
        _ => None,
    }
}
