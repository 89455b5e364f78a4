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
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn rec(
    part: &str,
    chapter: &str,
    criterion: &str,
    level: &str,
    code: &str,
    tags: &str,
) -> serde_json::Value {
    json!({
        "part": part, "chapter": chapter, "criterionName": criterion,
        "levelLabel": level, "subItemCode": code,
        "subItemText": format!("tiểu mục {}", code), "tags": tags
    })
}

fn catalog() -> serde_json::Value {
    json!([
        rec("Phần A", "Chương A1", "A1.1", "Mức 1", "A1.1-1.10", "QLCL"),
        rec("Phần A", "Chương A1", "A1.1", "Mức 1", "A1.1-1.2", "QLCL"),
        rec("Phần A", "Chương A1", "A1.1", "Mức 1", "A1.1-1.1", "QLCL, TMHC"),
        rec("Phần A", "Chương A1", "A1.2", "Mức 1", "A1.2-1.1", "TMHC"),
        rec("Phần B", "Chương B1", "B1.1", "Mức 1", "B1.1-1.1", "QLCL"),
    ])
}

fn collect_codes(tree: &serde_json::Value) -> Vec<String> {
    let mut codes = Vec::new();
    for part in tree["result"]["parts"].as_array().expect("parts") {
        for chapter in part["chapters"].as_array().expect("chapters") {
            for criterion in chapter["criteria"].as_array().expect("criteria") {
                for item in criterion["subItems"].as_array().expect("subItems") {
                    codes.push(
                        item["subItemCode"]
                            .as_str()
                            .expect("subItemCode")
                            .to_string(),
                    );
                }
            }
        }
    }
    codes
}

#[test]
fn tag_filter_selects_each_matching_record_once_in_natural_order() {
    let workspace = temp_dir("qualityd-tree-filter");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let imported = request(
        &mut stdin,
        &mut reader,
        "2",
        "criteria.replaceCatalog",
        json!({ "records": catalog() }),
    );
    assert_eq!(imported["result"]["imported"].as_i64(), Some(5));

    // Case-insensitive tag match; every QLCL record exactly once.
    let tree = request(
        &mut stdin,
        &mut reader,
        "3",
        "criteria.tree",
        json!({ "groupFilter": "qlcl" }),
    );
    let codes = collect_codes(&tree);
    assert_eq!(
        codes,
        vec!["A1.1-1.1", "A1.1-1.2", "A1.1-1.10", "B1.1-1.1"],
        "natural order places -1.2 before -1.10"
    );
    assert_eq!(tree["result"]["subItemCount"].as_i64(), Some(4));

    // A record tagged "QLCL, TMHC" surfaces under either filter.
    let tree = request(
        &mut stdin,
        &mut reader,
        "4",
        "criteria.tree",
        json!({ "groupFilter": "TMHC" }),
    );
    let codes = collect_codes(&tree);
    assert_eq!(codes, vec!["A1.1-1.1", "A1.2-1.1"]);

    // Empty filter is the scope gate: no sub-items, not an error.
    let tree = request(
        &mut stdin,
        &mut reader,
        "5",
        "criteria.tree",
        json!({ "groupFilter": "" }),
    );
    assert_eq!(tree["ok"].as_bool(), Some(true));
    assert!(collect_codes(&tree).is_empty());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn catalog_replace_rejects_bad_sub_item_codes() {
    let workspace = temp_dir("qualityd-catalog-integrity");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let dup = request(
        &mut stdin,
        &mut reader,
        "2",
        "criteria.replaceCatalog",
        json!({ "records": [
            rec("Phần A", "Chương A1", "A1.1", "Mức 1", "A1.1-1.1", "QLCL"),
            rec("Phần A", "Chương A1", "A1.1", "Mức 2", "A1.1-1.1", "QLCL"),
        ]}),
    );
    assert_eq!(dup["ok"].as_bool(), Some(false));
    assert_eq!(dup["error"]["code"].as_str(), Some("validation"));

    let missing = request(
        &mut stdin,
        &mut reader,
        "3",
        "criteria.replaceCatalog",
        json!({ "records": [
            rec("Phần A", "Chương A1", "A1.1", "Mức 1", "  ", "QLCL"),
        ]}),
    );
    assert_eq!(missing["error"]["code"].as_str(), Some("validation"));

    // A rejected batch must not disturb the stored catalog.
    let listed = request(&mut stdin, &mut reader, "4", "criteria.list", json!({}));
    assert_eq!(listed["result"]["count"].as_i64(), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
