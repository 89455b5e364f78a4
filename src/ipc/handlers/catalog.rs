use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, load_catalog, now_rfc3339, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{self, CriterionRecord};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

fn handle_criteria_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let catalog = match load_catalog(conn) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    ok(
        &req.id,
        json!({
            "count": catalog.len(),
            "records": catalog,
        }),
    )
}

fn parse_records(params: &serde_json::Value) -> Result<Vec<CriterionRecord>, HandlerErr> {
    let Some(raw) = params.get("records") else {
        return Err(HandlerErr::new("bad_params", "missing records[]"));
    };
    let records: Vec<CriterionRecord> = serde_json::from_value(raw.clone()).map_err(|e| {
        HandlerErr::with_details(
            "bad_params",
            "records[] did not match the catalog record shape",
            json!({ "parseError": e.to_string() }),
        )
    })?;

    // The sub-item code is the only join key into scoring state; a record
    // without one, or a duplicated one, poisons every sheet built from the
    // catalog. Reject the whole batch.
    let mut seen: HashSet<&str> = HashSet::new();
    for (i, rec) in records.iter().enumerate() {
        let code = rec.sub_item_code.trim();
        if code.is_empty() {
            return Err(HandlerErr::with_details(
                "validation",
                format!("record at index {} has no subItemCode", i),
                json!({ "index": i }),
            ));
        }
        if !seen.insert(code) {
            return Err(HandlerErr::with_details(
                "validation",
                format!("duplicate subItemCode: {}", code),
                json!({ "index": i, "subItemCode": code }),
            ));
        }
    }

    Ok(records)
}

fn handle_criteria_replace_catalog(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let records = match parse_records(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let tx = match conn.transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };

    let now = now_rfc3339();
    let result = (|| -> Result<(), rusqlite::Error> {
        tx.execute("DELETE FROM criteria", [])?;
        for (i, rec) in records.iter().enumerate() {
            tx.execute(
                "INSERT INTO criteria(id, part, chapter, criterion_name, level_label,
                                      sub_item_code, sub_item_text, tags, sort_order, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    &rec.part,
                    &rec.chapter,
                    &rec.criterion_name,
                    &rec.level_label,
                    rec.sub_item_code.trim(),
                    &rec.sub_item_text,
                    &rec.tags,
                    i as i64,
                    &now,
                ),
            )?;
        }
        tx.commit()
    })();

    match result {
        Ok(()) => ok(&req.id, json!({ "imported": records.len() })),
        Err(e) => err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "criteria" })),
        ),
    }
}

fn handle_criteria_tree(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let group_filter = match get_required_str(&req.params, "groupFilter") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let catalog = match load_catalog(conn) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let tree = scoring::build_tree(&catalog, &group_filter);
    let sub_item_count: usize = tree
        .iter()
        .flat_map(|p| &p.chapters)
        .flat_map(|c| &c.criteria)
        .map(|c| c.sub_items.len())
        .sum();

    ok(
        &req.id,
        json!({
            "groupFilter": group_filter,
            "subItemCount": sub_item_count,
            "parts": tree,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "criteria.list" => Some(handle_criteria_list(state, req)),
        "criteria.replaceCatalog" => Some(handle_criteria_replace_catalog(state, req)),
        "criteria.tree" => Some(handle_criteria_tree(state, req)),
        _ => None,
    }
}
