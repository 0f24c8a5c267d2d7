use crate::core::stats::{is_blank, value_label};
use crate::domain::model::Record;
use serde_json::{Map, Value};

/// 取出指定提交人的全部記錄。
///
/// 每筆記錄依 `field_names` 補齊欄位，未填寫的值一律為 null；
/// 結果依識別欄位的數值排序，非數字的識別值排在最前面。
pub fn submitter_records(
    records: &[Record],
    submitter_field: &str,
    submitter: &str,
    field_names: &[String],
    key_field: &str,
) -> Vec<Map<String, Value>> {
    let mut selected: Vec<Map<String, Value>> = records
        .iter()
        .filter(|r| {
            r.data
                .get(submitter_field)
                .is_some_and(|v| !is_blank(Some(v)) && value_label(v) == submitter)
        })
        .map(|r| {
            field_names
                .iter()
                .map(|name| {
                    let value = r.data.get(name).filter(|v| !is_blank(Some(*v)));
                    (name.clone(), value.cloned().unwrap_or(Value::Null))
                })
                .collect()
        })
        .collect();

    selected.sort_by_key(|row| numeric_key(row.get(key_field)));
    selected
}

fn numeric_key(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// 依欄位定義產生一份空白填寫範本：欄位名稱 → 該型別的預設值
pub fn blank_template(catalogue: &[Value]) -> Map<String, Value> {
    catalogue
        .iter()
        .filter_map(|field| {
            let name = field.get("field_name")?.as_str()?;
            Some((name.to_string(), default_value(field)))
        })
        .collect()
}

fn default_value(field: &Value) -> Value {
    let first_option = field
        .pointer("/property/options/0/name")
        .and_then(Value::as_str);

    match field.get("ui_type").and_then(Value::as_str) {
        Some("Number") => Value::from(0),
        Some("Text") => Value::from(""),
        Some("SingleSelect") => Value::from(first_option.unwrap_or("")),
        Some("MultiSelect") => match first_option {
            Some(option) => Value::Array(vec![Value::from(option)]),
            None => Value::Array(Vec::new()),
        },
        Some("DateTime") | Some("Date") => Value::from("2024-01-01"),
        Some("Checkbox") => Value::Bool(false),
        _ => Value::Null,
    }
}
