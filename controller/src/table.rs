//! Fixed-width ASCII tables for the console.

/// Render headers and rows into an aligned table. Columns are padded to the
/// widest cell; rows shorter than the header are padded with empty cells.
pub fn render_table(title: &str, headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut out = String::new();
    if !title.is_empty() {
        out.push_str(title);
        out.push('\n');
    }

    let line = |cells: &[String], out: &mut String| {
        for (i, width) in widths.iter().enumerate() {
            if i > 0 {
                out.push_str("  ");
            }
            let empty = String::new();
            let cell = cells.get(i).unwrap_or(&empty);
            out.push_str(cell);
            for _ in cell.len()..*width {
                out.push(' ');
            }
        }
        out.push('\n');
    };

    let header_cells: Vec<String> = headers.iter().map(|h| (*h).to_string()).collect();
    line(&header_cells, &mut out);

    let total: usize = widths.iter().sum::<usize>() + 2 * widths.len().saturating_sub(1);
    out.push_str(&"-".repeat(total));
    out.push('\n');

    for row in rows {
        line(row, &mut out);
    }
    out
}
