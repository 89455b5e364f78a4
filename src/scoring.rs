use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Sentinel label used when no level's sub-item group is fully satisfied.
pub const NO_LEVEL_LABEL: &str = "Chưa đạt mức nào";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    NotEvaluated,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
            Verdict::NotEvaluated => "not_evaluated",
        }
    }

    pub fn parse(s: &str) -> Option<Verdict> {
        match s {
            "pass" => Some(Verdict::Pass),
            "fail" => Some(Verdict::Fail),
            "not_evaluated" => Some(Verdict::NotEvaluated),
            _ => None,
        }
    }
}

/// Scoring state of one sub-item. `verdict == None` means the evaluator has
/// not touched this sub-item yet; that is distinct from an explicit
/// NotEvaluated verdict.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreEntry {
    pub verdict: Option<Verdict>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub evidence_images: Vec<String>,
}

pub type ScoreMap = HashMap<String, ScoreEntry>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionRecord {
    pub part: String,
    pub chapter: String,
    pub criterion_name: String,
    /// Free-text level label, e.g. "Mức 1". The numeric level is the first
    /// integer substring.
    pub level_label: String,
    pub sub_item_code: String,
    pub sub_item_text: String,
    /// Comma-separated department/team tags.
    pub tags: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionNode {
    pub name: String,
    pub sub_items: Vec<CriterionRecord>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterNode {
    pub name: String,
    pub criteria: Vec<CriterionNode>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartNode {
    pub name: String,
    pub chapters: Vec<ChapterNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl EngineError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

/// Extract the numeric level from a label like "Mức 1" or "Muc 2 (nang cao)".
/// Returns None when the label carries no integer substring.
pub fn parse_level(label: &str) -> Option<u32> {
    let mut digits = String::new();
    for ch in label.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else if !digits.is_empty() {
            break;
        }
    }
    digits.parse().ok()
}

pub fn level_label(n: u32) -> String {
    format!("Mức {}", n)
}

/// Tag-level filter match: the record's comma-split, trimmed tags must
/// contain the filter as a case-insensitive substring. A record tagged
/// "TMHC, QLCL" surfaces under either filter.
pub fn matches_group(tags: &str, group_filter: &str) -> bool {
    let needle = group_filter.trim().to_lowercase();
    if needle.is_empty() {
        return false;
    }
    tags.split(',')
        .map(|t| t.trim().to_lowercase())
        .any(|t| t.contains(&needle))
}

/// Natural comparison of sub-item codes: digit runs compare numerically,
/// everything else compares case-insensitively. "A1.1-1.2" sorts before
/// "A1.1-1.10".
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let (mut i, mut j) = (0usize, 0usize);

    while i < a_chars.len() && j < b_chars.len() {
        if a_chars[i].is_ascii_digit() && b_chars[j].is_ascii_digit() {
            let i0 = i;
            let j0 = j;
            while i < a_chars.len() && a_chars[i].is_ascii_digit() {
                i += 1;
            }
            while j < b_chars.len() && b_chars[j].is_ascii_digit() {
                j += 1;
            }
            let na: u64 = a_chars[i0..i].iter().collect::<String>().parse().unwrap_or(0);
            let nb: u64 = b_chars[j0..j].iter().collect::<String>().parse().unwrap_or(0);
            match na.cmp(&nb) {
                Ordering::Equal => {}
                other => return other,
            }
        } else {
            let ca = a_chars[i].to_lowercase().next().unwrap_or(a_chars[i]);
            let cb = b_chars[j].to_lowercase().next().unwrap_or(b_chars[j]);
            match ca.cmp(&cb) {
                Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
                other => return other,
            }
        }
    }

    (a_chars.len() - i).cmp(&(b_chars.len() - j))
}

/// Group the flat catalog, filtered by `group_filter`, into the
/// Part -> Chapter -> Criterion hierarchy. Group order follows first
/// appearance in the catalog; sub-items within a criterion are in natural
/// code order. Records without a sub-item code cannot be correlated with
/// scores and are dropped. An empty filter yields an empty hierarchy: the
/// evaluator must choose a scope before any sub-item is shown.
pub fn build_tree(catalog: &[CriterionRecord], group_filter: &str) -> Vec<PartNode> {
    if group_filter.trim().is_empty() {
        return Vec::new();
    }
    let in_scope: Vec<CriterionRecord> = catalog
        .iter()
        .filter(|rec| matches_group(&rec.tags, group_filter))
        .cloned()
        .collect();
    group_records(&in_scope)
}

/// Group an already-scoped record list into the hierarchy. Used directly
/// when reopening a persisted sheet, whose rows were filtered at save time.
pub fn group_records(records: &[CriterionRecord]) -> Vec<PartNode> {
    let mut parts: Vec<PartNode> = Vec::new();

    for rec in records {
        if rec.sub_item_code.trim().is_empty() {
            continue;
        }

        let pi = match parts.iter().position(|p| p.name == rec.part) {
            Some(i) => i,
            None => {
                parts.push(PartNode {
                    name: rec.part.clone(),
                    chapters: Vec::new(),
                });
                parts.len() - 1
            }
        };
        let chapters = &mut parts[pi].chapters;
        let ci = match chapters.iter().position(|c| c.name == rec.chapter) {
            Some(i) => i,
            None => {
                chapters.push(ChapterNode {
                    name: rec.chapter.clone(),
                    criteria: Vec::new(),
                });
                chapters.len() - 1
            }
        };
        let criteria = &mut chapters[ci].criteria;
        let ki = match criteria.iter().position(|c| c.name == rec.criterion_name) {
            Some(i) => i,
            None => {
                criteria.push(CriterionNode {
                    name: rec.criterion_name.clone(),
                    sub_items: Vec::new(),
                });
                criteria.len() - 1
            }
        };
        criteria[ki].sub_items.push(rec.clone());
    }

    for part in &mut parts {
        for chapter in &mut part.chapters {
            for criterion in &mut chapter.criteria {
                criterion
                    .sub_items
                    .sort_by(|a, b| natural_cmp(&a.sub_item_code, &b.sub_item_code));
            }
        }
    }

    parts
}

fn verdict_of(scores: &ScoreMap, code: &str) -> Option<Verdict> {
    scores.get(code).and_then(|e| e.verdict)
}

/// Cascading visibility within one criterion: a sub-item is visible iff no
/// earlier sub-item holds an explicit Fail. Un-scored sub-items do not
/// block later ones.
pub fn visible_flags(sub_items: &[CriterionRecord], scores: &ScoreMap) -> Vec<bool> {
    let mut flags = Vec::with_capacity(sub_items.len());
    let mut blocked = false;
    for item in sub_items {
        flags.push(!blocked);
        if verdict_of(scores, &item.sub_item_code) == Some(Verdict::Fail) {
            blocked = true;
        }
    }
    flags
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AchievedLevel {
    Level(u32),
    None,
}

impl AchievedLevel {
    pub fn label(self) -> String {
        match self {
            AchievedLevel::Level(n) => level_label(n),
            AchievedLevel::None => NO_LEVEL_LABEL.to_string(),
        }
    }
}

/// Highest achieved level of one criterion. Levels are walked in ascending
/// order; a level is credited when every sub-item at that level is Pass or
/// explicitly NotEvaluated. A Fail at a level stops the walk, as does a
/// level with any un-scored sub-item. Note the asymmetry with the
/// visibility cascade: un-scored sub-items do not hide later ones but they
/// do block level credit.
pub fn achieved_level(sub_items: &[CriterionRecord], scores: &ScoreMap) -> AchievedLevel {
    let mut by_level: HashMap<u32, Vec<&CriterionRecord>> = HashMap::new();
    for item in sub_items {
        if let Some(level) = parse_level(&item.level_label) {
            by_level.entry(level).or_default().push(item);
        }
    }

    let mut levels: Vec<u32> = by_level.keys().copied().collect();
    levels.sort_unstable();

    let mut achieved = AchievedLevel::None;
    for level in levels {
        let group = &by_level[&level];
        let mut complete = true;
        let mut failed = false;
        for item in group {
            match verdict_of(scores, &item.sub_item_code) {
                Some(Verdict::Pass) | Some(Verdict::NotEvaluated) => {}
                Some(Verdict::Fail) => {
                    failed = true;
                    break;
                }
                None => {
                    complete = false;
                }
            }
        }
        if failed || !complete {
            break;
        }
        achieved = AchievedLevel::Level(level);
    }
    achieved
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetHeader {
    pub sheet_id: String,
    pub evaluation_date: String,
    pub evaluator_name: String,
    pub evaluated_unit: String,
    pub group_filter: String,
}

/// One persisted row: sheet header + catalog fields + scoring state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetRow {
    pub sheet_id: String,
    pub sub_item_code: String,
    pub part: String,
    pub chapter: String,
    pub criterion_name: String,
    pub level_label: String,
    pub sub_item_text: String,
    pub verdict: Option<Verdict>,
    pub notes: String,
    pub evidence_images: Vec<String>,
    pub evaluation_date: String,
    pub evaluator_name: String,
    pub evaluated_unit: String,
    pub group_filter: String,
}

/// Flatten the in-scope tree plus scores into the flat row batch persisted
/// under the sheet id. Header validation happens here so nothing reaches
/// the store on a bad header; an empty scope is a hard error rather than a
/// silent empty save.
pub fn flatten_sheet(
    header: &SheetHeader,
    tree: &[PartNode],
    scores: &ScoreMap,
) -> Result<Vec<SheetRow>, EngineError> {
    if header.evaluator_name.trim().is_empty() {
        return Err(EngineError::new("validation", "evaluator name is required"));
    }
    if header.evaluated_unit.trim().is_empty() {
        return Err(EngineError::new("validation", "evaluated unit is required"));
    }

    let mut rows: Vec<SheetRow> = Vec::new();
    for part in tree {
        for chapter in &part.chapters {
            for criterion in &chapter.criteria {
                for item in &criterion.sub_items {
                    let entry = scores.get(&item.sub_item_code).cloned().unwrap_or_default();
                    rows.push(SheetRow {
                        sheet_id: header.sheet_id.clone(),
                        sub_item_code: item.sub_item_code.clone(),
                        part: item.part.clone(),
                        chapter: item.chapter.clone(),
                        criterion_name: item.criterion_name.clone(),
                        level_label: item.level_label.clone(),
                        sub_item_text: item.sub_item_text.clone(),
                        verdict: entry.verdict,
                        notes: entry.notes,
                        evidence_images: entry.evidence_images,
                        evaluation_date: header.evaluation_date.clone(),
                        evaluator_name: header.evaluator_name.clone(),
                        evaluated_unit: header.evaluated_unit.clone(),
                        group_filter: header.group_filter.clone(),
                    });
                }
            }
        }
    }

    if rows.is_empty() {
        return Err(EngineError::new(
            "validation",
            "nothing to save: no sub-items in scope for this group filter",
        ));
    }

    Ok(rows)
}
