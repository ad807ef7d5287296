use scraper::{ElementRef, Html, Selector};
use serde_json::Value;

use crate::domain::record::Record;

/// Turns the first table on the page into one record per data row.
///
/// Headers come from the `thead` when there is one, otherwise from the
/// first row. Rows are zipped against the headers positionally: short
/// rows leave their trailing columns out, long rows lose the excess
/// cells, and a row without any `td` cell is skipped.
pub fn extract_fee_rows(page_source: &str) -> Vec<Record> {
    let document = Html::parse_document(page_source);

    let table_selector = Selector::parse("table").unwrap();
    let thead_selector = Selector::parse("thead").unwrap();
    let tbody_selector = Selector::parse("tbody").unwrap();
    let row_selector = Selector::parse("tr").unwrap();
    let header_cell_selector = Selector::parse("th").unwrap();
    let any_cell_selector = Selector::parse("th, td").unwrap();
    let data_cell_selector = Selector::parse("td").unwrap();

    let table = match document.select(&table_selector).next() {
        Some(table) => table,
        None => return vec![],
    };

    let (headers, rows): (Vec<String>, Vec<ElementRef>) =
        match table.select(&thead_selector).next() {
            Some(head) => {
                let headers = head.select(&header_cell_selector).map(cell_text).collect();
                let rows = match table.select(&tbody_selector).next() {
                    Some(body) => body.select(&row_selector).collect(),
                    // Header rows carry no td cells, so they fall out below.
                    None => table.select(&row_selector).collect(),
                };
                (headers, rows)
            }
            None => {
                let mut all_rows = table.select(&row_selector);
                match all_rows.next() {
                    Some(first_row) => {
                        let headers =
                            first_row.select(&any_cell_selector).map(cell_text).collect();
                        (headers, all_rows.collect())
                    }
                    None => return vec![],
                }
            }
        };

    let mut records = Vec::new();
    for row in rows {
        let cells: Vec<String> = row.select(&data_cell_selector).map(cell_text).collect();
        if cells.is_empty() {
            continue;
        }

        let record: Record = headers
            .iter()
            .cloned()
            .zip(cells.into_iter().map(Value::String))
            .collect();
        records.push(record);
    }

    records
}

fn cell_text(cell: ElementRef) -> String {
    cell.text().map(str::trim).collect()
}
