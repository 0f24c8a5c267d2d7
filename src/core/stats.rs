use crate::domain::model::Record;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// 提交人欄位缺少或空白時的標籤
pub const UNKNOWN_SUBMITTER: &str = "(空)";

/// null、空字串與空陣列都視為未填寫
pub fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

/// 百分比，四捨五入到小數點後兩位；分母為 0 時為 0
pub fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 10000.0).round() / 100.0
}

/// 欄位值轉為顯示用的名稱。人員欄位是 `[{"name": ...}]` 形式的陣列
pub fn value_label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item.get("name").or_else(|| item.get("text")) {
                Some(name) => value_label(name),
                None => value_label(item),
            })
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

fn submitter_of(record: &Record, submitter_field: &str) -> Option<String> {
    record
        .data
        .get(submitter_field)
        .filter(|v| !is_blank(Some(*v)))
        .map(value_label)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchRate {
    pub name: String,
    pub matched: usize,
    pub compared: usize,
    pub rate: f64,
}

impl MatchRate {
    fn new(name: impl Into<String>, matched: usize, compared: usize) -> Self {
        Self {
            name: name.into(),
            matched,
            compared,
            rate: percent(matched, compared),
        }
    }
}

/// 兩位評估者在同一筆資料、同一欄位上的不同答案；未填寫為 null
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldMismatch {
    pub key: Value,
    pub field: String,
    pub reference: Value,
    pub candidate: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlignmentReport {
    pub reference: String,
    pub candidate: String,
    pub overall: MatchRate,
    /// 依資料首次出現的順序
    pub per_key: Vec<MatchRate>,
    /// 依比對欄位的順序
    pub per_field: Vec<MatchRate>,
    pub mismatches: Vec<FieldMismatch>,
    /// 只有其中一位評估者提交的資料
    pub unpaired: Vec<Value>,
}

/// 一致性比對的參數
#[derive(Debug, Clone)]
pub struct AlignmentInput<'a> {
    pub key_field: &'a str,
    pub submitter_field: &'a str,
    pub reference: &'a str,
    pub candidate: &'a str,
    pub fields: &'a [String],
}

#[derive(Default)]
struct Pair<'r> {
    key: Value,
    reference: Option<&'r Record>,
    candidate: Option<&'r Record>,
}

/// 兩份評估同一欄位的答案是否一致：雙方都未填寫也算一致
fn values_agree(reference: Option<&Value>, candidate: Option<&Value>) -> bool {
    let reference = reference.filter(|v| !v.is_null());
    let candidate = candidate.filter(|v| !v.is_null());
    reference == candidate
}

/// 比較兩位評估者對同一批資料的答案。
///
/// 以識別欄位配對，同一位評估者對同一筆資料有多筆提交時以最後一筆為準。
/// 只有雙方都提交的資料參與比對；欄位匹配率的分母是成功配對的資料數。
pub fn alignment(records: &[Record], input: &AlignmentInput<'_>) -> AlignmentReport {
    let mut order: Vec<String> = Vec::new();
    let mut pairs: HashMap<String, Pair<'_>> = HashMap::new();

    for record in records {
        let Some(key) = record.key(input.key_field) else {
            continue;
        };
        let slot_key = key.to_string();
        let pair = pairs.entry(slot_key.clone()).or_insert_with(|| {
            order.push(slot_key);
            Pair {
                key: key.clone(),
                ..Default::default()
            }
        });
        match submitter_of(record, input.submitter_field).as_deref() {
            Some(name) if name == input.reference => pair.reference = Some(record),
            Some(name) if name == input.candidate => pair.candidate = Some(record),
            _ => {}
        }
    }

    let mut field_matches = vec![0usize; input.fields.len()];
    let mut per_key = Vec::new();
    let mut mismatches = Vec::new();
    let mut unpaired = Vec::new();
    let (mut matched, mut compared) = (0usize, 0usize);

    for slot_key in &order {
        let Some(pair) = pairs.get(slot_key) else {
            continue;
        };
        let (reference, candidate) = match (pair.reference, pair.candidate) {
            (Some(r), Some(c)) => (r, c),
            (None, None) => continue,
            _ => {
                unpaired.push(pair.key.clone());
                continue;
            }
        };

        let mut key_matches = 0;
        for (i, field) in input.fields.iter().enumerate() {
            let left = reference.data.get(field);
            let right = candidate.data.get(field);
            if values_agree(left, right) {
                key_matches += 1;
                field_matches[i] += 1;
            } else {
                mismatches.push(FieldMismatch {
                    key: pair.key.clone(),
                    field: field.clone(),
                    reference: left.cloned().unwrap_or(Value::Null),
                    candidate: right.cloned().unwrap_or(Value::Null),
                });
            }
        }
        matched += key_matches;
        compared += input.fields.len();
        per_key.push(MatchRate::new(value_label(&pair.key), key_matches, input.fields.len()));
    }

    let paired = per_key.len();
    let per_field = input
        .fields
        .iter()
        .zip(field_matches)
        .map(|(field, hits)| MatchRate::new(field.clone(), hits, paired))
        .collect();

    AlignmentReport {
        reference: input.reference.to_string(),
        candidate: input.candidate.to_string(),
        overall: MatchRate::new("overall", matched, compared),
        per_key,
        per_field,
        mismatches,
        unpaired,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldCoverage {
    pub field: String,
    pub filled: usize,
    pub total: usize,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSummary {
    pub total: usize,
    /// 依名稱排序
    pub fields: Vec<String>,
    /// 依筆數由多到少，同數時依名稱
    pub submitters: Vec<(String, usize)>,
    pub coverage: Vec<FieldCoverage>,
}

/// 全表概況：欄位清單、各提交人的筆數、各欄位的填寫率
pub fn summarize(records: &[Record], submitter_field: &str) -> TableSummary {
    let fields: BTreeSet<&String> = records.iter().flat_map(|r| r.data.keys()).collect();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for record in records {
        let name = submitter_of(record, submitter_field).unwrap_or_else(|| UNKNOWN_SUBMITTER.to_string());
        *counts.entry(name).or_default() += 1;
    }
    let mut submitters: Vec<(String, usize)> = counts.into_iter().collect();
    submitters.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let coverage = fields
        .iter()
        .map(|field| {
            let filled = records
                .iter()
                .filter(|r| !is_blank(r.data.get(field.as_str())))
                .count();
            FieldCoverage {
                field: field.to_string(),
                filled,
                total: records.len(),
                rate: percent(filled, records.len()),
            }
        })
        .collect();

    TableSummary {
        total: records.len(),
        fields: fields.into_iter().cloned().collect(),
        submitters,
        coverage,
    }
}
