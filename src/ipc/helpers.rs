use crate::ipc::error::err;
use crate::scoring::CriterionRecord;
use rusqlite::Connection;
use serde_json::json;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: &'static str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn db_err(e: impl std::fmt::Display) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::with_details("bad_params", format!("missing {}", key), json!({ "param": key })))
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Full catalog in its import order.
pub fn load_catalog(conn: &Connection) -> Result<Vec<CriterionRecord>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT part, chapter, criterion_name, level_label, sub_item_code, sub_item_text, tags
             FROM criteria
             ORDER BY sort_order",
        )
        .map_err(db_err)?;
    stmt.query_map([], |r| {
        Ok(CriterionRecord {
            part: r.get(0)?,
            chapter: r.get(1)?,
            criterion_name: r.get(2)?,
            level_label: r.get(3)?,
            sub_item_code: r.get(4)?,
            sub_item_text: r.get(5)?,
            tags: r.get(6)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}
