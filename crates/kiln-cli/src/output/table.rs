//! Table formatting for CLI output

use comfy_table::{Cell, Color, ContentArrangement, Table as ComfyTable};
use serde_json::Value;

/// Table for CLI output
#[derive(Debug, Clone)]
pub struct Table {
    inner: ComfyTable,
}

impl Table {
    /// Table with the given column headers
    pub fn with_headers(headers: &[&str]) -> Self {
        let mut table = ComfyTable::new();
        table
            .set_header(headers.to_vec())
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_width(120);
        Self { inner: table }
    }

    pub fn add_row(&mut self, row: Vec<String>) -> &mut Self {
        self.inner.add_row(row);
        self
    }

    /// Add a row whose first cell is highlighted
    pub fn add_highlighted_row(&mut self, row: Vec<String>, color: Color) -> &mut Self {
        let mut cells = row.into_iter();
        let mut styled = Vec::new();
        if let Some(first) = cells.next() {
            styled.push(Cell::new(first).fg(color));
        }
        styled.extend(cells.map(Cell::new));
        self.inner.add_row(styled);
        self
    }

    /// Create a table from a JSON array of objects
    pub fn from_json_array(arr: &[Value]) -> Self {
        let mut table = ComfyTable::new();

        if let Some(first) = arr.first()
            && let Some(obj) = first.as_object()
        {
            let headers: Vec<String> = obj.keys().cloned().collect();
            table.set_header(&headers);
        }

        for item in arr {
            if let Some(obj) = item.as_object() {
                let row: Vec<String> = obj.values().map(cell_text).collect();
                table.add_row(row);
            }
        }

        table
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_width(120);

        Self { inner: table }
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "".to_string(),
        _ => value.to_string(),
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}
