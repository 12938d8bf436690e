//! JSON to CSV projection for `Accept: text/csv` negotiation.

use serde_json::Value;

/// Project a JSON value into CSV.
///
/// An array of objects becomes a header row (keys of the first object) plus
/// one row per element; an array of scalars becomes one value per line; a
/// lone object becomes its keys row and values row.
pub fn project(value: &Value) -> String {
    match value {
        Value::Array(items) => match items.first() {
            Some(Value::Object(first)) => {
                let columns: Vec<&String> = first.keys().collect();
                let mut out = join_row(columns.iter().map(|c| escape(c)));
                for item in items {
                    let row = columns.iter().map(|col| {
                        item.get(col.as_str()).map(field).unwrap_or_default()
                    });
                    out.push_str(&join_row(row));
                }
                out
            }
            Some(_) => {
                let mut out = String::new();
                for item in items {
                    out.push_str(&field(item));
                    out.push('\n');
                }
                out
            }
            None => String::new(),
        },
        Value::Object(map) => {
            let mut out = join_row(map.keys().map(|k| escape(k)));
            out.push_str(&join_row(map.values().map(field)));
            out
        }
        other => {
            let mut out = field(other);
            out.push('\n');
            out
        }
    }
}

/// Download filename derived from the last path segment and the query.
pub fn disposition(path: &str, query: &str) -> String {
    let stem = path
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("export");
    let safe_query: String = query
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!(
        "attachment; filename=\"{}_{}.csv\"",
        stem.trim_end_matches(".csv"),
        safe_query
    )
}

fn field(value: &Value) -> String {
    match value {
        Value::String(s) => escape(s),
        Value::Null => String::new(),
        other => escape(&other.to_string()),
    }
}

fn escape(raw: &str) -> String {
    if raw.contains(',') || raw.contains('"') || raw.contains('\n') {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn join_row<I: Iterator<Item = String>>(cells: I) -> String {
    let mut out = cells.collect::<Vec<_>>().join(",");
    out.push('\n');
    out
}
