use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;
use serde_json::Map;
use serde_json::Value;

use crate::schema::FieldSpec;
use crate::schema::FieldType;
use crate::schema::Schema;

/// Typed value of one record field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Text(String),
    /// The model reported the value as not readable; carries the sentinel it
    /// renders as.
    Missing(String),
}

impl FieldValue {
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Integer(value) => Value::from(*value),
            FieldValue::Float(value) => Value::from(*value),
            FieldValue::Text(value) => Value::String(value.clone()),
            FieldValue::Missing(sentinel) => Value::String(sentinel.clone()),
        }
    }
}

/// Validated extraction output. Fields appear in schema order; keys the
/// model invented are already gone.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    values: IndexMap<String, FieldValue>,
}

impl Record {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (name, value) in &self.values {
            map.insert(name.clone(), value.to_json());
        }
        Value::Object(map)
    }
}

/// Result of checking one raw model output against a schema.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Accepted(Record),
    Malformed {
        reason: String,
        raw_text: String,
    },
    SchemaViolation {
        field: String,
        expected: String,
        found: String,
    },
}

/// Check a raw model response against `schema`.
///
/// Parsing is lenient about the envelope (think tags, code fences, prose
/// around the object) and strict about field content. Fields are checked in
/// schema order and the first offending field wins.
pub fn validate(schema: &Schema, raw_text: &str) -> ValidationOutcome {
    let payload = match extract_json_object(raw_text) {
        Some(map) => map,
        None => {
            // Distinguish a response that is JSON of the wrong shape from
            // one that is not JSON at all; the repair hint quotes this.
            let cleaned = strip_think_tags(raw_text);
            let reason = if serde_json::from_str::<Value>(cleaned.trim()).is_ok() {
                "model output is JSON but not an object"
            } else {
                "no JSON object found in model output"
            };
            return ValidationOutcome::Malformed {
                reason: reason.to_string(),
                raw_text: raw_text.to_string(),
            };
        }
    };

    let mut values = IndexMap::with_capacity(schema.fields().len());
    for field in schema.fields() {
        match check_field(field, payload.get(&field.name)) {
            FieldCheck::Value(value) => {
                values.insert(field.name.clone(), value);
            }
            FieldCheck::Violation { expected, found } => {
                return ValidationOutcome::SchemaViolation {
                    field: field.name.clone(),
                    expected,
                    found,
                };
            }
        }
    }

    ValidationOutcome::Accepted(Record { values })
}

/// Pull the first JSON object out of a raw model response.
///
/// Tries a straight parse, then a fenced block, then the first balanced
/// `{...}` fragment anywhere in the text.
pub fn extract_json_object(raw: &str) -> Option<Map<String, Value>> {
    let cleaned = strip_think_tags(raw);
    let trimmed = cleaned.trim();

    if trimmed.is_empty() {
        return None;
    }

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        return Some(map);
    }

    if let Some(stripped) = strip_code_fence(trimmed)
        && let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&stripped)
    {
        return Some(map);
    }

    if let Some(fragment) = extract_braced_fragment(trimmed)
        && let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&fragment)
    {
        return Some(map);
    }

    None
}

fn think_tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?is)<think>.*?</think>").unwrap())
}

fn strip_think_tags(text: &str) -> String {
    think_tag_pattern().replace_all(text, "").trim().to_string()
}

fn strip_code_fence(text: &str) -> Option<String> {
    let rest = text.trim().strip_prefix("```")?;
    // The fence line may carry an info string like "json"; skip past it.
    let (_, body) = rest.split_once('\n')?;
    let end = body.rfind("```")?;
    Some(body[..end].trim().to_string())
}

fn extract_braced_fragment(text: &str) -> Option<String> {
    let open = text.find('{')?;
    let mut depth = 0usize;

    for (offset, ch) in text[open..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[open..=open + offset].to_string());
                }
            }
            _ => {}
        }
    }

    None
}

enum FieldCheck {
    Value(FieldValue),
    Violation { expected: String, found: String },
}

fn check_field(spec: &FieldSpec, value: Option<&Value>) -> FieldCheck {
    let Some(value) = value else {
        // Key absent entirely: the model ignored the field.
        if spec.required {
            return FieldCheck::Violation {
                expected: spec.field_type.describe(),
                found: "missing".to_string(),
            };
        }
        return FieldCheck::Value(FieldValue::Missing(spec.missing_sentinel.clone()));
    };

    // Key present but carrying an explicit "not readable" answer.
    if is_absence_marker(value, &spec.missing_sentinel) {
        return FieldCheck::Value(FieldValue::Missing(spec.missing_sentinel.clone()));
    }

    match &spec.field_type {
        FieldType::Integer => check_integer(spec, value),
        FieldType::Float => check_float(spec, value),
        FieldType::String => check_string(spec, value),
        FieldType::Enum(variants) => check_enum(spec, variants, value),
        FieldType::Date(format) => check_date(spec, format, value),
    }
}

fn is_absence_marker(value: &Value, sentinel: &str) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => {
            let folded = text.trim().to_ascii_lowercase();
            folded.is_empty()
                || folded == sentinel.to_ascii_lowercase()
                || matches!(folded.as_str(), "n/a" | "na" | "-")
        }
        _ => false,
    }
}

fn violation(spec: &FieldSpec, found: String) -> FieldCheck {
    FieldCheck::Violation {
        expected: spec.field_type.describe(),
        found,
    }
}

fn check_integer(spec: &FieldSpec, value: &Value) -> FieldCheck {
    match value {
        Value::Number(number) => {
            if let Some(as_int) = number.as_i64() {
                FieldCheck::Value(FieldValue::Integer(as_int))
            } else if let Some(as_float) = number.as_f64()
                && as_float.fract() == 0.0
                && as_float.abs() < i64::MAX as f64
            {
                FieldCheck::Value(FieldValue::Integer(as_float as i64))
            } else {
                violation(spec, number.to_string())
            }
        }
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.ends_with('%') {
                return FieldCheck::Value(FieldValue::Missing(spec.missing_sentinel.clone()));
            }
            match strip_numeric_noise(trimmed).parse::<i64>() {
                Ok(parsed) => FieldCheck::Value(FieldValue::Integer(parsed)),
                Err(_) => violation(spec, trimmed.to_string()),
            }
        }
        other => violation(spec, render_found(other)),
    }
}

fn check_float(spec: &FieldSpec, value: &Value) -> FieldCheck {
    match value {
        Value::Number(number) => match number.as_f64() {
            Some(as_float) => FieldCheck::Value(FieldValue::Float(as_float)),
            None => violation(spec, number.to_string()),
        },
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.ends_with('%') {
                return FieldCheck::Value(FieldValue::Missing(spec.missing_sentinel.clone()));
            }
            match parse_float_lenient(trimmed) {
                Some(parsed) => FieldCheck::Value(FieldValue::Float(parsed)),
                None => violation(spec, trimmed.to_string()),
            }
        }
        other => violation(spec, render_found(other)),
    }
}

fn check_string(spec: &FieldSpec, value: &Value) -> FieldCheck {
    match value {
        Value::String(text) => FieldCheck::Value(FieldValue::Text(text.trim().to_string())),
        Value::Number(number) => FieldCheck::Value(FieldValue::Text(number.to_string())),
        Value::Bool(flag) => FieldCheck::Value(FieldValue::Text(flag.to_string())),
        other => violation(spec, render_found(other)),
    }
}

fn check_enum(spec: &FieldSpec, variants: &[String], value: &Value) -> FieldCheck {
    let text = match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        other => return violation(spec, render_found(other)),
    };

    let folded = normalize_label(&text);
    for variant in variants {
        if normalize_label(variant) == folded {
            // Keep the declared spelling, not whatever casing the model used.
            return FieldCheck::Value(FieldValue::Text(variant.clone()));
        }
    }

    violation(spec, text.trim().to_string())
}

fn check_date(spec: &FieldSpec, format: &str, value: &Value) -> FieldCheck {
    let Value::String(text) = value else {
        return violation(spec, render_found(value));
    };

    let trimmed = text.trim();
    if matches_date_shape(trimmed, format) {
        FieldCheck::Value(FieldValue::Text(trimmed.to_string()))
    } else {
        violation(spec, trimmed.to_string())
    }
}

/// Shape check only: letters in the pattern stand for digits, everything
/// else must match literally. "31/02/2024" passes "DD/MM/YYYY".
fn matches_date_shape(text: &str, format: &str) -> bool {
    let mut actual = text.chars();
    for pattern_ch in format.chars() {
        let Some(ch) = actual.next() else {
            return false;
        };
        if pattern_ch.is_ascii_alphabetic() {
            if !ch.is_ascii_digit() {
                return false;
            }
        } else if ch != pattern_ch {
            return false;
        }
    }
    actual.next().is_none()
}

fn normalize_label(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

// "$1,234" and "1 234" both read as 1234.
fn strip_numeric_noise(text: &str) -> String {
    text.chars()
        .filter(|ch| !matches!(ch, '$' | '€' | '£' | '¥' | ',' | ' ' | '\u{a0}'))
        .collect()
}

/// Read a decimal that may carry currency signs, thousands separators, or a
/// decimal comma. A lone comma with no dot and not exactly three trailing
/// digits is a decimal comma; when both separators appear, the later one is
/// the decimal point.
fn parse_float_lenient(text: &str) -> Option<f64> {
    let stripped: String = text
        .chars()
        .filter(|ch| !matches!(ch, '$' | '€' | '£' | '¥' | ' ' | '\u{a0}'))
        .collect();

    let last_comma = stripped.rfind(',');
    let last_dot = stripped.rfind('.');

    let normalized = match (last_comma, last_dot) {
        (None, _) => stripped,
        (Some(_), None) => {
            let tail = stripped.rsplit(',').next().unwrap_or("");
            let decimal_comma = stripped.matches(',').count() == 1
                && tail.len() != 3
                && tail.chars().all(|ch| ch.is_ascii_digit());
            if decimal_comma {
                stripped.replace(',', ".")
            } else {
                stripped.replace(',', "")
            }
        }
        (Some(comma_idx), Some(dot_idx)) => {
            if comma_idx > dot_idx {
                stripped.replace('.', "").replace(',', ".")
            } else {
                stripped.replace(',', "")
            }
        }
    };

    normalized.parse::<f64>().ok()
}

fn render_found(value: &Value) -> String {
    match value {
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::schema::SchemaRegistry;
    use crate::schema::TaskKind;

    fn receipt() -> Schema {
        SchemaRegistry::builtin()
            .get(TaskKind::ReceiptExtraction)
            .unwrap()
            .clone()
    }

    fn age() -> Schema {
        SchemaRegistry::builtin()
            .get(TaskKind::AgeClassification)
            .unwrap()
            .clone()
    }

    fn profile() -> Schema {
        SchemaRegistry::builtin()
            .get(TaskKind::ProfileExtraction)
            .unwrap()
            .clone()
    }

    fn accept(schema: &Schema, raw: &str) -> Record {
        match validate(schema, raw) {
            ValidationOutcome::Accepted(record) => record,
            other => panic!("expected acceptance, got {other:?}"),
        }
    }

    #[test]
    fn fenced_receipt_with_decimal_comma_is_accepted() {
        let raw = "```json\n{\"place_name\": \"Cafe Nova\", \"date\": \"12/03/2024\", \"total\": \"23,50\"}\n```";
        let record = accept(&receipt(), raw);

        assert_eq!(record.get("place_name"), Some(&FieldValue::Text("Cafe Nova".to_string())));
        assert_eq!(record.get("date"), Some(&FieldValue::Text("12/03/2024".to_string())));
        assert_eq!(record.get("total"), Some(&FieldValue::Float(23.50)));
    }

    #[test]
    fn comma_grouping_reads_as_thousands() {
        let raw = r#"{"user_name": "ada", "follower_count": "1,234", "following_count": 56, "posts_count": null, "summary": ""}"#;
        let record = accept(&profile(), raw);

        assert_eq!(record.get("follower_count"), Some(&FieldValue::Integer(1234)));
        assert_eq!(record.get("posts_count"), Some(&FieldValue::Missing("na".to_string())));
        assert_eq!(record.get("summary"), Some(&FieldValue::Missing("na".to_string())));
    }

    #[test]
    fn currency_sign_is_stripped_from_floats() {
        let raw = r#"{"place_name": "Diner", "date": "01/01/2025", "total": "$12.50"}"#;
        let record = accept(&receipt(), raw);
        assert_eq!(record.get("total"), Some(&FieldValue::Float(12.5)));
    }

    #[test]
    fn mixed_separators_use_the_last_one_as_decimal() {
        let schema = receipt();

        let european = r#"{"place_name": "a", "date": "01/01/2025", "total": "1.234,56"}"#;
        assert_eq!(
            accept(&schema, european).get("total"),
            Some(&FieldValue::Float(1234.56))
        );

        let american = r#"{"place_name": "a", "date": "01/01/2025", "total": "1,234.56"}"#;
        assert_eq!(
            accept(&schema, american).get("total"),
            Some(&FieldValue::Float(1234.56))
        );
    }

    #[test]
    fn missing_required_field_is_a_violation() {
        let raw = r#"{"place_name": "Cafe Nova", "total": 9.0}"#;
        match validate(&receipt(), raw) {
            ValidationOutcome::SchemaViolation { field, found, .. } => {
                assert_eq!(field, "date");
                assert_eq!(found, "missing");
            }
            other => panic!("expected violation, got {other:?}"),
        }
    }

    #[test]
    fn required_field_with_absence_marker_becomes_sentinel() {
        let raw = r#"{"place_name": "n/a", "date": "12/03/2024", "total": 9.5}"#;
        let record = accept(&receipt(), raw);
        assert_eq!(record.get("place_name"), Some(&FieldValue::Missing("na".to_string())));
    }

    #[test]
    fn percentage_on_a_numeric_field_becomes_sentinel() {
        let raw = r#"{"user_name": "ada", "follower_count": "45%", "following_count": "12", "posts_count": "3", "summary": "hi"}"#;
        let record = accept(&profile(), raw);
        assert_eq!(record.get("follower_count"), Some(&FieldValue::Missing("na".to_string())));
    }

    #[test]
    fn extra_keys_are_dropped_and_order_is_schema_order() {
        let raw = r#"{"total": 5.0, "mood": "great", "place_name": "Bar", "date": "02/02/2024"}"#;
        let record = accept(&receipt(), raw);

        let names: Vec<&str> = record.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["place_name", "date", "total"]);
        assert!(record.get("mood").is_none());

        // Declaration order must survive all the way into the rendered JSON,
        // not just the in-memory map.
        assert_eq!(
            record.to_json().to_string(),
            r#"{"place_name":"Bar","date":"02/02/2024","total":5.0}"#
        );
    }

    #[test]
    fn enum_labels_fold_case_and_whitespace() {
        let record = accept(&age(), r#"{"category": "  Young   Adult "}"#);
        assert_eq!(record.get("category"), Some(&FieldValue::Text("young adult".to_string())));
    }

    #[test]
    fn enum_rejects_labels_outside_the_set() {
        match validate(&age(), r#"{"category": "middle-aged"}"#) {
            ValidationOutcome::SchemaViolation { field, found, expected } => {
                assert_eq!(field, "category");
                assert_eq!(found, "middle-aged");
                assert!(expected.contains("young adult"));
            }
            other => panic!("expected violation, got {other:?}"),
        }
    }

    #[test]
    fn date_shape_is_checked_without_calendar_rules() {
        let schema = receipt();

        // Impossible but well-shaped dates pass.
        let odd = r#"{"place_name": "a", "date": "31/02/2024", "total": 1.0}"#;
        assert!(matches!(validate(&schema, odd), ValidationOutcome::Accepted(_)));

        let wrong_layout = r#"{"place_name": "a", "date": "2024-02-31", "total": 1.0}"#;
        match validate(&schema, wrong_layout) {
            ValidationOutcome::SchemaViolation { field, expected, .. } => {
                assert_eq!(field, "date");
                assert!(expected.contains("DD/MM/YYYY"));
            }
            other => panic!("expected violation, got {other:?}"),
        }
    }

    #[test]
    fn think_tags_and_prose_are_tolerated() {
        let raw = "<think>the receipt says 9.80</think>Here you go: {\"place_name\": \"Kiosk\", \"date\": \"03/04/2025\", \"total\": 9.8} hope that helps";
        let record = accept(&receipt(), raw);
        assert_eq!(record.get("place_name"), Some(&FieldValue::Text("Kiosk".to_string())));
    }

    #[test]
    fn array_wrapped_object_is_recovered() {
        let raw = r#"[{"category": "senior"}]"#;
        let record = accept(&age(), raw);
        assert_eq!(record.get("category"), Some(&FieldValue::Text("senior".to_string())));
    }

    #[test]
    fn output_without_json_is_malformed() {
        match validate(&receipt(), "I could not read the image, sorry.") {
            ValidationOutcome::Malformed { raw_text, .. } => {
                assert!(raw_text.contains("could not read"));
            }
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn bare_array_is_malformed_with_shape_reason() {
        match validate(&age(), "[1, 2, 3]") {
            ValidationOutcome::Malformed { reason, .. } => {
                assert_eq!(reason, "model output is JSON but not an object");
            }
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn integral_float_counts_as_integer() {
        let raw = r#"{"user_name": "ada", "follower_count": 1234.0, "following_count": 1, "posts_count": 2, "summary": "x"}"#;
        let record = accept(&profile(), raw);
        assert_eq!(record.get("follower_count"), Some(&FieldValue::Integer(1234)));
    }

    #[test]
    fn fractional_count_is_a_violation() {
        let raw = r#"{"user_name": "ada", "follower_count": 1.2, "following_count": 1, "posts_count": 2, "summary": "x"}"#;
        match validate(&profile(), raw) {
            ValidationOutcome::SchemaViolation { field, expected, .. } => {
                assert_eq!(field, "follower_count");
                assert_eq!(expected, "integer");
            }
            other => panic!("expected violation, got {other:?}"),
        }
    }

    #[test]
    fn abbreviated_count_is_a_violation_not_a_guess() {
        let raw = r#"{"user_name": "ada", "follower_count": "1.2k", "following_count": 1, "posts_count": 2, "summary": "x"}"#;
        match validate(&profile(), raw) {
            ValidationOutcome::SchemaViolation { field, found, .. } => {
                assert_eq!(field, "follower_count");
                assert_eq!(found, "1.2k");
            }
            other => panic!("expected violation, got {other:?}"),
        }
    }

    #[test]
    fn containers_never_pass_scalar_fields() {
        let raw = r#"{"place_name": ["Cafe", "Nova"], "date": "12/03/2024", "total": 1.0}"#;
        match validate(&receipt(), raw) {
            ValidationOutcome::SchemaViolation { found, .. } => assert_eq!(found, "array"),
            other => panic!("expected violation, got {other:?}"),
        }
    }

    #[test]
    fn record_renders_sentinels_in_json_output() {
        let raw = r#"{"user_name": "ada", "follower_count": 10, "following_count": 2, "posts_count": 3}"#;
        let record = accept(&profile(), raw);
        let json = record.to_json();
        assert_eq!(json["summary"], Value::String("na".to_string()));
        assert_eq!(json["follower_count"], Value::from(10));
    }

    #[test]
    fn validation_is_deterministic_for_the_same_input() {
        let raw = r#"{"place_name": "Cafe Nova", "date": "12/03/2024", "total": "23,50"}"#;
        let first = validate(&receipt(), raw);
        let second = validate(&receipt(), raw);
        assert_eq!(first, second);
    }
}
