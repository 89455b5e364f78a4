use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_qualityd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn qualityd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn sample_catalog() -> serde_json::Value {
    json!([
        {
            "part": "Phần A", "chapter": "Chương A1", "criterionName": "A1.1",
            "levelLabel": "Mức 1", "subItemCode": "A1.1-1.1",
            "subItemText": "Có quy trình tiếp đón người bệnh", "tags": "QLCL, TMHC"
        },
        {
            "part": "Phần A", "chapter": "Chương A1", "criterionName": "A1.1",
            "levelLabel": "Mức 2", "subItemCode": "A1.1-2.1",
            "subItemText": "Quy trình được rà soát hằng năm", "tags": "QLCL"
        }
    ])
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("qualityd-router-smoke");
    let bundle_out = workspace.join("smoke-backup.qdbackup.zip");
    let csv_out = workspace.join("smoke-sheet.csv");
    let evidence_src = workspace.join("smoke-evidence.jpg");
    std::fs::write(&evidence_src, b"not really a jpeg").expect("write evidence fixture");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "3",
        "criteria.replaceCatalog",
        json!({ "records": sample_catalog() }),
    );
    let _ = request(&mut stdin, &mut reader, "4", "criteria.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "5",
        "criteria.tree",
        json!({ "groupFilter": "QLCL" }),
    );

    let saved = request(
        &mut stdin,
        &mut reader,
        "6",
        "sheets.save",
        json!({
            "header": {
                "evaluationDate": "2025-11-03",
                "evaluatorName": "Nguyễn Văn A",
                "evaluatedUnit": "Khoa Nội",
                "groupFilter": "QLCL"
            },
            "scores": {
                "A1.1-1.1": { "verdict": "pass" }
            }
        }),
    );
    let sheet_id = saved
        .get("result")
        .and_then(|v| v.get("sheetId"))
        .and_then(|v| v.as_str())
        .expect("sheetId")
        .to_string();

    let _ = request(&mut stdin, &mut reader, "7", "sheets.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "sheets.open",
        json!({ "sheetId": sheet_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "9",
        "evidence.store",
        json!({ "sourcePath": evidence_src.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "10",
        "exchange.exportSheetCsv",
        json!({ "sheetId": sheet_id, "outPath": csv_out.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "backup.exportWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "outPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "inPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "sheets.delete",
        json!({ "sheetId": sheet_id }),
    );

    // Unknown methods must fall through every handler family.
    let payload = json!({ "id": "14", "method": "nothing.here", "params": {} });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let unknown: serde_json::Value =
        serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(unknown.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        unknown
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_implemented")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
