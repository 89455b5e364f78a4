use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_err, get_required_str, load_catalog, now_rfc3339, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{
    self, CriterionRecord, ScoreEntry, ScoreMap, SheetHeader, SheetRow, Verdict,
};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Transaction};
use serde_json::json;
use uuid::Uuid;

/// Column value persisted when a sub-item has no verdict yet.
const VERDICT_UNSCORED: &str = "unscored";

fn verdict_column(v: Option<Verdict>) -> &'static str {
    v.map(Verdict::as_str).unwrap_or(VERDICT_UNSCORED)
}

fn sheet_rows_for(conn: &Connection, sheet_id: &str) -> Result<Vec<SheetRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT sheet_id, sub_item_code, part, chapter, criterion_name, level_label,
                    sub_item_text, verdict, notes, evidence_json,
                    evaluation_date, evaluator_name, evaluated_unit, group_filter
             FROM sheet_rows
             WHERE sheet_id = ?
             ORDER BY rowid",
        )
        .map_err(db_err)?;
    stmt.query_map([sheet_id], |r| {
        let verdict_raw: String = r.get(7)?;
        let evidence_raw: String = r.get(9)?;
        Ok(SheetRow {
            sheet_id: r.get(0)?,
            sub_item_code: r.get(1)?,
            part: r.get(2)?,
            chapter: r.get(3)?,
            criterion_name: r.get(4)?,
            level_label: r.get(5)?,
            sub_item_text: r.get(6)?,
            verdict: Verdict::parse(&verdict_raw),
            notes: r.get(8)?,
            evidence_images: serde_json::from_str(&evidence_raw).unwrap_or_default(),
            evaluation_date: r.get(10)?,
            evaluator_name: r.get(11)?,
            evaluated_unit: r.get(12)?,
            group_filter: r.get(13)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

fn handle_sheets_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let mut stmt = conn
            .prepare(
                "SELECT sheet_id,
                        MIN(evaluation_date), MIN(evaluator_name), MIN(evaluated_unit), MIN(group_filter),
                        COUNT(*),
                        SUM(CASE WHEN verdict = 'pass' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN verdict = 'fail' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN verdict = 'not_evaluated' THEN 1 ELSE 0 END),
                        MAX(updated_at)
                 FROM sheet_rows
                 GROUP BY sheet_id
                 ORDER BY MAX(updated_at) DESC",
            )
            .map_err(db_err)?;
        let summaries = stmt
            .query_map([], |r| {
                Ok(json!({
                    "sheetId": r.get::<_, String>(0)?,
                    "evaluationDate": r.get::<_, String>(1)?,
                    "evaluatorName": r.get::<_, String>(2)?,
                    "evaluatedUnit": r.get::<_, String>(3)?,
                    "groupFilter": r.get::<_, String>(4)?,
                    "totalCount": r.get::<_, i64>(5)?,
                    "passCount": r.get::<_, i64>(6)?,
                    "failCount": r.get::<_, i64>(7)?,
                    "notEvaluatedCount": r.get::<_, i64>(8)?,
                    "updatedAt": r.get::<_, Option<String>>(9)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_err)?;
        Ok(json!({ "sheets": summaries }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_sheets_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let sheet_id = match get_required_str(&req.params, "sheetId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let rows = sheet_rows_for(conn, &sheet_id)?;
        if rows.is_empty() {
            return Err(HandlerErr::with_details(
                "not_found",
                "sheet not found",
                json!({ "sheetId": sheet_id }),
            ));
        }

        let header = SheetHeader {
            sheet_id: sheet_id.clone(),
            evaluation_date: rows[0].evaluation_date.clone(),
            evaluator_name: rows[0].evaluator_name.clone(),
            evaluated_unit: rows[0].evaluated_unit.clone(),
            group_filter: rows[0].group_filter.clone(),
        };

        // Rehydrate scoring state from the persisted batch.
        let mut scores = ScoreMap::new();
        let mut records: Vec<CriterionRecord> = Vec::with_capacity(rows.len());
        for row in &rows {
            scores.insert(
                row.sub_item_code.clone(),
                ScoreEntry {
                    verdict: row.verdict,
                    notes: row.notes.clone(),
                    evidence_images: row.evidence_images.clone(),
                },
            );
            records.push(CriterionRecord {
                part: row.part.clone(),
                chapter: row.chapter.clone(),
                criterion_name: row.criterion_name.clone(),
                level_label: row.level_label.clone(),
                sub_item_code: row.sub_item_code.clone(),
                sub_item_text: row.sub_item_text.clone(),
                tags: header.group_filter.clone(),
            });
        }

        // Derived values are computed on read, never trusted from storage.
        let tree = scoring::group_records(&records);
        let mut criteria = Vec::new();
        for part in &tree {
            for chapter in &part.chapters {
                for criterion in &chapter.criteria {
                    let achieved = scoring::achieved_level(&criterion.sub_items, &scores);
                    let visible = scoring::visible_flags(&criterion.sub_items, &scores);
                    let sub_items: Vec<serde_json::Value> = criterion
                        .sub_items
                        .iter()
                        .zip(visible.iter())
                        .map(|(item, vis)| {
                            json!({
                                "subItemCode": item.sub_item_code,
                                "visible": vis,
                            })
                        })
                        .collect();
                    criteria.push(json!({
                        "part": part.name,
                        "chapter": chapter.name,
                        "criterionName": criterion.name,
                        "achievedLevel": achieved.label(),
                        "subItems": sub_items,
                    }));
                }
            }
        }

        Ok(json!({
            "header": header,
            "rows": rows,
            "criteria": criteria,
        }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn parse_header(params: &serde_json::Value, sheet_id: String) -> Result<SheetHeader, HandlerErr> {
    let Some(header) = params.get("header") else {
        return Err(HandlerErr::new("bad_params", "missing header"));
    };
    Ok(SheetHeader {
        sheet_id,
        evaluation_date: get_required_str(header, "evaluationDate")?,
        evaluator_name: get_required_str(header, "evaluatorName")?,
        evaluated_unit: get_required_str(header, "evaluatedUnit")?,
        group_filter: get_required_str(header, "groupFilter")?,
    })
}

fn parse_scores(params: &serde_json::Value) -> Result<ScoreMap, HandlerErr> {
    let Some(raw) = params.get("scores") else {
        return Ok(ScoreMap::new());
    };
    serde_json::from_value(raw.clone()).map_err(|e| {
        HandlerErr::with_details(
            "bad_params",
            "scores did not match the score entry shape",
            json!({ "parseError": e.to_string() }),
        )
    })
}

/// Atomic full replace for one sheet: upsert the new batch keyed by
/// (sheet_id, sub_item_code), then delete rows of that sheet absent from
/// the batch. One transaction, so a failure leaves the prior batch intact.
fn replace_sheet_rows(tx: &Transaction<'_>, rows: &[SheetRow]) -> Result<(), rusqlite::Error> {
    let now = now_rfc3339();
    for row in rows {
        let evidence_json =
            serde_json::to_string(&row.evidence_images).unwrap_or_else(|_| "[]".to_string());
        tx.execute(
            "INSERT INTO sheet_rows(sheet_id, sub_item_code, part, chapter, criterion_name,
                                    level_label, sub_item_text, verdict, notes, evidence_json,
                                    evaluation_date, evaluator_name, evaluated_unit, group_filter,
                                    updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(sheet_id, sub_item_code) DO UPDATE SET
               part = excluded.part,
               chapter = excluded.chapter,
               criterion_name = excluded.criterion_name,
               level_label = excluded.level_label,
               sub_item_text = excluded.sub_item_text,
               verdict = excluded.verdict,
               notes = excluded.notes,
               evidence_json = excluded.evidence_json,
               evaluation_date = excluded.evaluation_date,
               evaluator_name = excluded.evaluator_name,
               evaluated_unit = excluded.evaluated_unit,
               group_filter = excluded.group_filter,
               updated_at = excluded.updated_at",
            (
                &row.sheet_id,
                &row.sub_item_code,
                &row.part,
                &row.chapter,
                &row.criterion_name,
                &row.level_label,
                &row.sub_item_text,
                verdict_column(row.verdict),
                &row.notes,
                &evidence_json,
                &row.evaluation_date,
                &row.evaluator_name,
                &row.evaluated_unit,
                &row.group_filter,
                &now,
            ),
        )?;
    }

    let sheet_id = &rows[0].sheet_id;
    let placeholders = std::iter::repeat("?")
        .take(rows.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "DELETE FROM sheet_rows WHERE sheet_id = ? AND sub_item_code NOT IN ({})",
        placeholders
    );
    let mut binds: Vec<Value> = Vec::with_capacity(rows.len() + 1);
    binds.push(Value::Text(sheet_id.clone()));
    for row in rows {
        binds.push(Value::Text(row.sub_item_code.clone()));
    }
    tx.execute(&sql, params_from_iter(binds))?;
    Ok(())
}

fn handle_sheets_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let sheet_id = req
        .params
        .get("sheetId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let header = match parse_header(&req.params, sheet_id.clone()) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let scores = match parse_scores(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let catalog = match load_catalog(conn) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let tree = scoring::build_tree(&catalog, &header.group_filter);
    let rows = match scoring::flatten_sheet(&header, &tree, &scores) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let tx = match conn.transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    let result = replace_sheet_rows(&tx, &rows).and_then(|()| tx.commit());
    match result {
        Ok(()) => ok(
            &req.id,
            json!({ "sheetId": sheet_id, "rowCount": rows.len() }),
        ),
        Err(e) => err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "sheet_rows" })),
        ),
    }
}

fn handle_sheets_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let sheet_id = match get_required_str(&req.params, "sheetId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match conn.execute("DELETE FROM sheet_rows WHERE sheet_id = ?", [&sheet_id]) {
        Ok(deleted) => ok(&req.id, json!({ "sheetId": sheet_id, "deleted": deleted })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sheets.list" => Some(handle_sheets_list(state, req)),
        "sheets.open" => Some(handle_sheets_open(state, req)),
        "sheets.save" => Some(handle_sheets_save(state, req)),
        "sheets.delete" => Some(handle_sheets_delete(state, req)),
        _ => None,
    }
}
