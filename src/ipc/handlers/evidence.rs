use crate::ipc::error::{err, ok};
use crate::ipc::helpers::get_required_str;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::Path;
use uuid::Uuid;

const EVIDENCE_DIR: &str = "evidence";

/// Copy one evidence image into the workspace and hand back its
/// workspace-relative path. The caller appends that path to the sub-item's
/// evidence list and persists it with the next sheet save; a failed copy
/// changes nothing.
fn store_evidence(workspace: &Path, source: &Path) -> anyhow::Result<String> {
    let ext = source
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin")
        .to_ascii_lowercase();
    let name = format!("{}.{}", Uuid::new_v4(), ext);

    let dir = workspace.join(EVIDENCE_DIR);
    std::fs::create_dir_all(&dir)?;
    std::fs::copy(source, dir.join(&name))?;

    Ok(format!("{}/{}", EVIDENCE_DIR, name))
}

fn handle_evidence_store(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let source = match get_required_str(&req.params, "sourcePath") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let source_path = Path::new(&source);
    if !source_path.is_file() {
        return err(
            &req.id,
            "not_found",
            "source file not found",
            Some(json!({ "sourcePath": source })),
        );
    }

    match store_evidence(&workspace, source_path) {
        Ok(url) => ok(&req.id, json!({ "url": url })),
        Err(e) => err(&req.id, "upload_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "evidence.store" => Some(handle_evidence_store(state, req)),
        _ => None,
    }
}
