//! Plain-text tables for listings. Cells are padded with spaces and columns
//! separated by two spaces so the output stays friendly to `awk` and `cut`.

use std::fmt::{self, Write};

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Align {
    Left,
    Right,
}

pub(crate) struct Row {
    cells: Vec<String>,
}

impl Row {
    fn is_awk_safe(&self) -> bool {
        !self
            .cells
            .iter()
            .any(|cell| cell.contains(char::is_whitespace))
    }
}

impl From<Vec<String>> for Row {
    fn from(value: Vec<String>) -> Self {
        Row { cells: value }
    }
}

impl From<Vec<&str>> for Row {
    fn from(value: Vec<&str>) -> Self {
        Row {
            cells: value.into_iter().map(str::to_owned).collect(),
        }
    }
}

pub(crate) struct Table {
    header: Row,
    align: Vec<Align>,
    body: Vec<Row>,
    print_header: bool,
}

impl Table {
    /// Creates a table whose width is fixed by its header. Header cells must
    /// not contain whitespace.
    pub(crate) fn with_header<R: Into<Row>>(header: R) -> Table {
        let header = header.into();

        assert!(
            header.is_awk_safe(),
            "table header is not awk safe, contains whitespace"
        );

        Table {
            align: vec![Align::Left; header.cells.len()],
            header,
            body: Vec::new(),
            print_header: true,
        }
    }

    pub(crate) fn align(&mut self, column: usize, align: Align) {
        self.align[column] = align;
    }

    pub(crate) fn print_header(&mut self, print_header: bool) {
        self.print_header = print_header;
    }

    pub(crate) fn add_row<R: Into<Row>>(&mut self, row: R) {
        let row = row.into();

        assert_eq!(
            row.cells.len(),
            self.header.cells.len(),
            "row width does not match the header"
        );

        self.body.push(row);
    }

    fn visible_rows(&self) -> impl Iterator<Item = &Row> {
        let header = self.print_header.then_some(&self.header);

        header.into_iter().chain(self.body.iter())
    }

    fn column_widths(&self) -> Vec<usize> {
        let mut widths = vec![0usize; self.header.cells.len()];

        for row in self.visible_rows() {
            for (width, cell) in widths.iter_mut().zip(&row.cells) {
                *width = (*width).max(cell.chars().count());
            }
        }

        widths
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let widths = self.column_widths();
        let last = widths.len().saturating_sub(1);

        for row in self.visible_rows() {
            for (i, cell) in row.cells.iter().enumerate() {
                match self.align[i] {
                    Align::Right => write!(f, "{:>width$}", cell, width = widths[i])?,
                    // The last column is not padded, no trailing whitespace
                    Align::Left if i == last => f.write_str(cell)?,
                    Align::Left => write!(f, "{:<width$}", cell, width = widths[i])?,
                }

                if i != last {
                    f.write_str("  ")?;
                }
            }

            f.write_char('\n')?;
        }

        Ok(())
    }
}

pub(crate) trait IntoTable: Into<Table> + Sized {
    fn into_table(self) -> Table {
        self.into()
    }
}

impl<T> IntoTable for T where T: Into<Table> + Sized {}
