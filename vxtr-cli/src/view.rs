use std::cmp::Ordering;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use serde_json::Map;
use serde_json::Value;
use vxtr_core::schema::DEFAULT_MISSING_SENTINEL;

pub struct ViewOptions {
    pub columns: Option<String>,
    pub filter: Option<String>,
    pub sort: Option<String>,
    pub desc: bool,
    pub limit: usize,
    pub stats: bool,
    pub export: Option<PathBuf>,
}

/// Inspect a JSONL results file written by `extract --output` or `batch`.
///
/// Rows are filtered, sorted, and column-selected before display; `--stats`
/// prints an overview of the whole file instead. Filtering happens on full
/// rows, so a filter may name a column that `--columns` drops from display.
pub fn handle_view(file: &Path, options: ViewOptions) -> Result<i32> {
    let content = fs::read_to_string(file)
        .with_context(|| format!("failed to read results file '{}'", file.display()))?;
    let mut rows = parse_rows(&content)?;
    if rows.is_empty() {
        eprintln!("vxtr: '{}' holds no records", file.display());
        return Ok(0);
    }

    let order = column_order(&rows);
    if options.stats {
        for line in render_stats(&rows, &order) {
            println!("{line}");
        }
        return Ok(0);
    }

    if let Some(expr) = options.filter.as_deref() {
        match parse_filter(expr) {
            Some(rule) => rows.retain(|row| rule_matches(&rule, row)),
            None => eprintln!("vxtr: cannot parse filter '{expr}', showing all rows"),
        }
    }
    if let Some(key) = options.sort.as_deref() {
        if order.iter().any(|name| name == key) {
            sort_rows(&mut rows, key, options.desc);
        } else {
            eprintln!("vxtr: sort column '{key}' not found, leaving order as-is");
        }
    }

    let columns = match options.columns.as_deref() {
        Some(spec) => select_columns(&order, spec),
        None => order,
    };

    if let Some(path) = options.export.as_deref() {
        export_rows(&rows, &columns, path)?;
    }

    let shown: Vec<&Map<String, Value>> = rows.iter().take(options.limit).collect();
    for line in render_table(&shown, &columns) {
        println!("{line}");
    }
    if rows.len() > shown.len() {
        eprintln!("vxtr: showing {} of {} rows", shown.len(), rows.len());
    }
    Ok(0)
}

fn parse_rows(content: &str) -> Result<Vec<Map<String, Value>>> {
    let mut rows = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .with_context(|| format!("line {} is not valid JSON", number + 1))?;
        match value {
            Value::Object(map) => rows.push(map),
            _ => bail!("line {} is not a JSON object", number + 1),
        }
    }
    Ok(rows)
}

/// Column names in first-seen order across all rows. Mixed task kinds in one
/// file simply union their fields.
fn column_order(rows: &[Map<String, Value>]) -> Vec<String> {
    let mut order: Vec<String> = Vec::new();
    for row in rows {
        for name in row.keys() {
            if !order.iter().any(|known| known == name) {
                order.push(name.clone());
            }
        }
    }
    order
}

fn select_columns(order: &[String], spec: &str) -> Vec<String> {
    let mut selected = Vec::new();
    let mut unknown = Vec::new();
    for name in spec.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        if order.iter().any(|column| column == name) {
            selected.push(name.to_string());
        } else {
            unknown.push(name.to_string());
        }
    }
    if !unknown.is_empty() {
        eprintln!("vxtr: unknown columns ignored: {}", unknown.join(", "));
    }
    if selected.is_empty() {
        order.to_vec()
    } else {
        selected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FilterRule {
    field: String,
    op: FilterOp,
    value: String,
}

// Two-character operators first so ">=" never parses as ">".
const FILTER_OPS: [(&str, FilterOp); 6] = [
    ("==", FilterOp::Eq),
    ("!=", FilterOp::Ne),
    (">=", FilterOp::Ge),
    ("<=", FilterOp::Le),
    (">", FilterOp::Gt),
    ("<", FilterOp::Lt),
];

fn parse_filter(expr: &str) -> Option<FilterRule> {
    for (token, op) in FILTER_OPS {
        if let Some((field, value)) = expr.split_once(token) {
            let field = field.trim();
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            if field.is_empty() || value.is_empty() {
                return None;
            }
            return Some(FilterRule {
                field: field.to_string(),
                op,
                value: value.to_string(),
            });
        }
    }
    None
}

/// Rows that lack the filtered field never match, whatever the operator.
fn rule_matches(rule: &FilterRule, row: &Map<String, Value>) -> bool {
    let Some(value) = row.get(&rule.field) else {
        return false;
    };
    let ordering = compare_to_operand(value, &rule.value);
    match rule.op {
        FilterOp::Eq => ordering == Ordering::Equal,
        FilterOp::Ne => ordering != Ordering::Equal,
        FilterOp::Gt => ordering == Ordering::Greater,
        FilterOp::Ge => ordering != Ordering::Less,
        FilterOp::Lt => ordering == Ordering::Less,
        FilterOp::Le => ordering != Ordering::Greater,
    }
}

fn compare_to_operand(value: &Value, operand: &str) -> Ordering {
    if let (Some(left), Ok(right)) = (value_as_number(value), operand.trim().parse::<f64>()) {
        left.partial_cmp(&right).unwrap_or(Ordering::Equal)
    } else {
        render_cell(value).as_str().cmp(operand)
    }
}

fn sort_rows(rows: &mut [Map<String, Value>], key: &str, desc: bool) {
    rows.sort_by(|a, b| match (a.get(key), b.get(key)) {
        (None, None) => Ordering::Equal,
        // Rows without the key go last whichever direction is asked for.
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(left), Some(right)) => {
            let ordering = compare_values(left, right);
            if desc { ordering.reverse() } else { ordering }
        }
    });
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    if let (Some(left), Some(right)) = (value_as_number(a), value_as_number(b)) {
        left.partial_cmp(&right).unwrap_or(Ordering::Equal)
    } else {
        render_cell(a).cmp(&render_cell(b))
    }
}

fn value_as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn render_table(rows: &[&Map<String, Value>], columns: &[String]) -> Vec<String> {
    let mut widths: Vec<usize> = columns.iter().map(|name| name.chars().count()).collect();
    let mut cells: Vec<Vec<String>> = Vec::with_capacity(rows.len());
    for row in rows {
        let rendered: Vec<String> = columns
            .iter()
            .map(|name| row.get(name).map(render_cell).unwrap_or_default())
            .collect();
        for (width, cell) in widths.iter_mut().zip(&rendered) {
            *width = (*width).max(cell.chars().count());
        }
        cells.push(rendered);
    }

    let mut lines = Vec::with_capacity(cells.len() + 1);
    let header = columns
        .iter()
        .zip(&widths)
        .map(|(name, &width)| format!("{name:<width$}"))
        .collect::<Vec<_>>()
        .join("  ");
    lines.push(header.trim_end().to_string());
    for rendered in cells {
        let line = rendered
            .iter()
            .zip(&widths)
            .map(|(cell, &width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ");
        lines.push(line.trim_end().to_string());
    }
    lines
}

fn render_stats(rows: &[Map<String, Value>], columns: &[String]) -> Vec<String> {
    let mut lines = vec![
        format!("columns: {}", columns.join(", ")),
        format!("rows: {}", rows.len()),
        "missing per column:".to_string(),
    ];
    for name in columns {
        let missing = rows
            .iter()
            .filter(|row| is_missing(row.get(name)))
            .count();
        lines.push(format!("  {name}: {missing}"));
    }
    lines
}

/// Absent keys, nulls, empty strings, and the default sentinel all count as
/// missing for the overview.
fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(text)) => {
            let trimmed = text.trim();
            trimmed.is_empty() || trimmed == DEFAULT_MISSING_SENTINEL
        }
        _ => false,
    }
}

fn export_rows(rows: &[Map<String, Value>], columns: &[String], path: &Path) -> Result<()> {
    let mut body = String::new();
    for row in rows {
        let mut slim = Map::new();
        for name in columns {
            if let Some(value) = row.get(name) {
                slim.insert(name.clone(), value.clone());
            }
        }
        body.push_str(&Value::Object(slim).to_string());
        body.push('\n');
    }
    fs::write(path, body).with_context(|| format!("failed to write '{}'", path.display()))?;
    eprintln!("vxtr: exported {} rows to '{}'", rows.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(json: &str) -> Map<String, Value> {
        serde_json::from_str(json).unwrap()
    }

    fn receipts() -> Vec<Map<String, Value>> {
        vec![
            row(r#"{"place_name": "Cafe Nova", "date": "05/03/2024", "total": 23.5}"#),
            row(r#"{"place_name": "Kiosk", "date": "01/01/2024", "total": 4.0}"#),
            row(r#"{"error": "manifest line 3 is not a valid JSON object"}"#),
            row(r#"{"place_name": "Bar", "date": "12/02/2024", "total": 110.0}"#),
        ]
    }

    #[test]
    fn columns_union_in_first_seen_order() {
        let order = column_order(&receipts());
        assert_eq!(order, vec!["place_name", "date", "total", "error"]);
    }

    #[test]
    fn column_selection_keeps_known_names_or_falls_back() {
        let order = column_order(&receipts());
        assert_eq!(
            select_columns(&order, "total, place_name"),
            vec!["total", "place_name"]
        );
        // Nothing valid selected: show everything rather than an empty table.
        assert_eq!(select_columns(&order, "venue"), order);
    }

    #[test]
    fn filter_expressions_parse_longest_operator_first() {
        let rule = parse_filter("total >= 10").unwrap();
        assert_eq!(rule.field, "total");
        assert_eq!(rule.op, FilterOp::Ge);
        assert_eq!(rule.value, "10");

        let rule = parse_filter(r#"place_name == "Cafe Nova""#).unwrap();
        assert_eq!(rule.op, FilterOp::Eq);
        assert_eq!(rule.value, "Cafe Nova");

        assert!(parse_filter("just words").is_none());
        assert!(parse_filter("== 3").is_none());
    }

    #[test]
    fn numeric_filters_compare_as_numbers() {
        let rule = parse_filter("total > 10").unwrap();
        let kept: Vec<_> = receipts()
            .into_iter()
            .filter(|entry| rule_matches(&rule, entry))
            .collect();
        // 23.5 and 110.0 pass; a lexical compare would have dropped 110.0.
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0]["place_name"], "Cafe Nova");
        assert_eq!(kept[1]["place_name"], "Bar");
    }

    #[test]
    fn rows_without_the_filter_field_never_match() {
        let rule = parse_filter("total != 4.0").unwrap();
        let rows = receipts();
        // The error line has no "total" at all.
        assert!(!rule_matches(&rule, &rows[2]));
        assert!(rule_matches(&rule, &rows[0]));
    }

    #[test]
    fn sort_is_numeric_aware_and_keeps_keyless_rows_last() {
        let mut rows = receipts();
        sort_rows(&mut rows, "total", false);
        let totals: Vec<Option<&Value>> = rows.iter().map(|entry| entry.get("total")).collect();
        assert_eq!(totals[0], Some(&Value::from(4.0)));
        assert_eq!(totals[1], Some(&Value::from(23.5)));
        assert_eq!(totals[2], Some(&Value::from(110.0)));
        assert_eq!(totals[3], None);

        sort_rows(&mut rows, "total", true);
        assert_eq!(rows[0]["place_name"], "Bar");
        // Descending still leaves the keyless row at the bottom.
        assert!(rows[3].get("total").is_none());
    }

    #[test]
    fn table_lines_align_on_the_widest_cell() {
        let rows = receipts();
        let shown: Vec<&Map<String, Value>> = rows.iter().take(2).collect();
        let lines = render_table(&shown, &["place_name".to_string(), "total".to_string()]);

        assert_eq!(lines[0], "place_name  total");
        assert_eq!(lines[1], "Cafe Nova   23.5");
        assert_eq!(lines[2], "Kiosk       4.0");
    }

    #[test]
    fn stats_count_absent_null_empty_and_sentinel_as_missing() {
        let rows = vec![
            row(r#"{"user_name": "ada", "summary": "na"}"#),
            row(r#"{"user_name": "", "summary": "fine"}"#),
            row(r#"{"user_name": null}"#),
        ];
        let lines = render_stats(&rows, &column_order(&rows));
        assert_eq!(lines[0], "columns: user_name, summary");
        assert_eq!(lines[1], "rows: 3");
        assert!(lines.contains(&"  user_name: 2".to_string()));
        assert!(lines.contains(&"  summary: 2".to_string()));
    }

    #[test]
    fn results_files_must_hold_json_objects() {
        assert_eq!(parse_rows("{\"a\": 1}\n\n{\"b\": 2}\n").unwrap().len(), 2);
        assert!(parse_rows("[1, 2]\n").is_err());
        assert!(parse_rows("not json\n").is_err());
    }
}
