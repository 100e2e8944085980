//! Tabular frame with a canonical checksum.
//!
//! A `Frame` is the unit of data flowing through the pipeline: an ordered set
//! of named columns and rows of loosely-typed cells, exactly as the vendor
//! returns them. Change detection relies on a canonical rendering (stable
//! sort, fixed float formatting, CSV) hashed with MD5, so two fetches of the
//! same logical data always produce the same checksum regardless of row
//! order.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use md5::{Digest, Md5};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

/// Checksum reported for a frame with no rows.
pub const EMPTY_CHECKSUM: &str = "empty";

/// Columns preferred as sort keys, in order. Whichever subset is present
/// defines the canonical row order; if none are, all columns are used
/// lexicographically.
const SORT_KEY_PREFERENCE: [&str; 4] = ["ts_code", "ann_date", "end_date", "trade_date"];

/// One value in a frame. Vendor payloads are JSON, so cells keep the vendor's
/// typing; the same column may carry `Int(1)` on one day and `Str("1")` on
/// another.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Cell {
    pub fn from_json(value: &serde_json::Value) -> Cell {
        match value {
            serde_json::Value::Null => Cell::Null,
            serde_json::Value::Bool(b) => Cell::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Cell::Int(i)
                } else if let Some(f) = n.as_f64() {
                    if f.is_finite() {
                        Cell::Float(f)
                    } else {
                        Cell::Null
                    }
                } else {
                    Cell::Null
                }
            }
            serde_json::Value::String(s) => Cell::Str(s.clone()),
            other => Cell::Str(other.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Rendering used for both CSV output and sort comparisons. Floats are
    /// fixed at six decimal places so the checksum is stable across
    /// runs and platforms.
    pub fn render(&self) -> String {
        match self {
            Cell::Null => String::new(),
            Cell::Int(i) => i.to_string(),
            Cell::Float(f) => format!("{:.6}", f),
            Cell::Bool(b) => b.to_string(),
            Cell::Str(s) => s.clone(),
        }
    }

    /// Loose string view for columns consumed by the core itself
    /// (e.g. `cal_date`, `is_open`, `ts_code`).
    pub fn as_str_lossy(&self) -> String {
        self.render()
    }

    fn canonical_cmp(&self, other: &Cell) -> Ordering {
        match (self, other) {
            (Cell::Null, Cell::Null) => Ordering::Equal,
            (Cell::Null, _) => Ordering::Less,
            (_, Cell::Null) => Ordering::Greater,
            (Cell::Int(a), Cell::Int(b)) => a.cmp(b),
            (Cell::Float(a), Cell::Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Cell::Int(a), Cell::Float(b)) => {
                (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Cell::Float(a), Cell::Int(b)) => {
                a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal)
            }
            _ => self.render().cmp(&other.render()),
        }
    }
}

/// Ordered rows of named columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Frame {
    pub fn empty() -> Frame {
        Frame::default()
    }

    /// Build a frame from parallel column names and rows. Rows shorter than
    /// the column list are padded with nulls; longer rows are truncated.
    pub fn new(columns: Vec<String>, mut rows: Vec<Vec<Cell>>) -> Frame {
        let width = columns.len();
        for row in &mut rows {
            row.resize(width, Cell::Null);
        }
        let mut frame = Frame { columns, rows };
        frame.normalize_numeric_columns();
        frame
    }

    /// Upcast integer cells to floats in columns that mix the two. The
    /// rendered form must survive a parquet round trip unchanged, and mixed
    /// numeric columns are stored as Float64.
    fn normalize_numeric_columns(&mut self) {
        for idx in 0..self.columns.len() {
            let mut saw_int = false;
            let mut saw_float = false;
            let mut saw_other = false;
            for row in &self.rows {
                match &row[idx] {
                    Cell::Int(_) => saw_int = true,
                    Cell::Float(_) => saw_float = true,
                    Cell::Null => {}
                    _ => saw_other = true,
                }
            }
            if saw_int && saw_float && !saw_other {
                for row in &mut self.rows {
                    if let Cell::Int(i) = row[idx] {
                        row[idx] = Cell::Float(i as f64);
                    }
                }
            }
        }
    }

    /// Build a frame from the vendor's `{fields, items}` payload shape.
    pub fn from_vendor_payload(fields: &[String], items: &[Vec<serde_json::Value>]) -> Frame {
        let rows = items
            .iter()
            .map(|item| item.iter().map(Cell::from_json).collect())
            .collect();
        Frame::new(fields.to_vec(), rows)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// All values of one column, rendered as strings, nulls skipped.
    pub fn column_values(&self, name: &str) -> Vec<String> {
        let Some(idx) = self.column_index(name) else {
            return Vec::new();
        };
        self.rows
            .iter()
            .filter(|row| !row[idx].is_null())
            .map(|row| row[idx].as_str_lossy())
            .collect()
    }

    /// Append another frame's rows. Column sets must match; pages of a
    /// paginated fetch always share one schema.
    pub fn append(&mut self, other: Frame) -> Result<()> {
        if self.columns.is_empty() {
            *self = other;
            return Ok(());
        }
        if other.columns.is_empty() {
            return Ok(());
        }
        if self.columns != other.columns {
            bail!(
                "cannot append frame with columns {:?} onto {:?}",
                other.columns,
                self.columns
            );
        }
        self.rows.extend(other.rows);
        self.normalize_numeric_columns();
        Ok(())
    }

    /// Drop duplicate rows by full-row equality, keeping the first
    /// occurrence. Used once after pagination assembly, where overlapping
    /// offsets intentionally refetch boundary rows.
    pub fn dedup_rows(&mut self) -> usize {
        let mut seen: HashSet<String> = HashSet::with_capacity(self.rows.len());
        let before = self.rows.len();
        self.rows.retain(|row| {
            let key = row
                .iter()
                .map(Cell::render)
                .collect::<Vec<_>>()
                .join("\u{1f}");
            seen.insert(key)
        });
        before - self.rows.len()
    }

    /// The subset of the preferred sort keys present in this frame, or all
    /// columns lexicographically when none of them are.
    fn sort_key_indices(&self) -> Vec<usize> {
        let preferred: Vec<usize> = SORT_KEY_PREFERENCE
            .iter()
            .filter_map(|key| self.column_index(key))
            .collect();
        if !preferred.is_empty() {
            return preferred;
        }
        let mut named: Vec<(&String, usize)> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c, i))
            .collect();
        named.sort();
        named.into_iter().map(|(_, i)| i).collect()
    }

    fn sorted_row_order(&self) -> Vec<usize> {
        let keys = self.sort_key_indices();
        let mut order: Vec<usize> = (0..self.rows.len()).collect();
        order.sort_by(|&a, &b| {
            for &k in &keys {
                let ord = self.rows[a][k].canonical_cmp(&self.rows[b][k]);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        order
    }

    /// Canonical CSV rendering: header row, rows in canonical sort order,
    /// floats at six decimal places, nulls as empty fields.
    pub fn to_canonical_csv(&self) -> String {
        let mut out = String::new();
        out.push_str(
            &self
                .columns
                .iter()
                .map(|c| csv_escape(c))
                .collect::<Vec<_>>()
                .join(","),
        );
        out.push('\n');
        for idx in self.sorted_row_order() {
            let line = self.rows[idx]
                .iter()
                .map(|cell| csv_escape(&cell.render()))
                .collect::<Vec<_>>()
                .join(",");
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    /// Stable content checksum. Pure in the row multiset: reordering input
    /// rows does not change it, editing any cell does.
    pub fn checksum(&self) -> String {
        if self.is_empty() {
            return EMPTY_CHECKSUM.to_string();
        }
        let mut hasher = Md5::new();
        hasher.update(self.to_canonical_csv().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Write the frame as a snappy-compressed parquet file.
    pub fn write_parquet(&self, path: &Path) -> Result<()> {
        let batch = self.to_record_batch()?;
        let file = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
            .context("failed to open parquet writer")?;
        writer.write(&batch).context("failed to write record batch")?;
        writer.close().context("failed to finish parquet file")?;
        Ok(())
    }

    /// Read a frame back from a parquet file written by [`write_parquet`].
    pub fn read_parquet(path: &Path) -> Result<Frame> {
        let file = File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .context("failed to open parquet reader")?
            .build()
            .context("failed to build parquet reader")?;

        let mut frame = Frame::empty();
        for batch in reader {
            let batch = batch.context("failed to decode record batch")?;
            frame.append(Frame::from_record_batch(&batch)?)?;
        }
        Ok(frame)
    }

    /// Per-column arrow typing. A column is numeric only when every non-null
    /// cell is numeric; vendor fields that mix `1` and `"1"` fall back to
    /// strings so a round-trip through parquet is lossless.
    fn column_type(&self, idx: usize) -> DataType {
        let mut saw_float = false;
        let mut saw_int = false;
        let mut saw_bool = false;
        for row in &self.rows {
            match &row[idx] {
                Cell::Null => {}
                Cell::Int(_) => saw_int = true,
                Cell::Float(_) => saw_float = true,
                Cell::Bool(_) => saw_bool = true,
                Cell::Str(_) => return DataType::Utf8,
            }
        }
        if saw_bool {
            if saw_int || saw_float {
                return DataType::Utf8;
            }
            return DataType::Boolean;
        }
        if saw_float {
            return DataType::Float64;
        }
        if saw_int {
            return DataType::Int64;
        }
        DataType::Utf8
    }

    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let mut fields = Vec::with_capacity(self.columns.len());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.columns.len());

        for (idx, name) in self.columns.iter().enumerate() {
            let dtype = self.column_type(idx);
            let array: ArrayRef = match dtype {
                DataType::Int64 => {
                    let values: Vec<Option<i64>> = self
                        .rows
                        .iter()
                        .map(|row| match &row[idx] {
                            Cell::Int(i) => Some(*i),
                            _ => None,
                        })
                        .collect();
                    Arc::new(Int64Array::from(values))
                }
                DataType::Float64 => {
                    let values: Vec<Option<f64>> = self
                        .rows
                        .iter()
                        .map(|row| match &row[idx] {
                            Cell::Int(i) => Some(*i as f64),
                            Cell::Float(f) => Some(*f),
                            _ => None,
                        })
                        .collect();
                    Arc::new(Float64Array::from(values))
                }
                DataType::Boolean => {
                    let values: Vec<Option<bool>> = self
                        .rows
                        .iter()
                        .map(|row| match &row[idx] {
                            Cell::Bool(b) => Some(*b),
                            _ => None,
                        })
                        .collect();
                    Arc::new(BooleanArray::from(values))
                }
                _ => {
                    let values: Vec<Option<String>> = self
                        .rows
                        .iter()
                        .map(|row| match &row[idx] {
                            Cell::Null => None,
                            cell => Some(cell.render()),
                        })
                        .collect();
                    Arc::new(StringArray::from(values))
                }
            };
            fields.push(Field::new(name.clone(), array.data_type().clone(), true));
            arrays.push(array);
        }

        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
            .context("failed to assemble record batch")
    }

    pub fn from_record_batch(batch: &RecordBatch) -> Result<Frame> {
        let columns: Vec<String> = batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        let mut rows = vec![Vec::with_capacity(columns.len()); batch.num_rows()];

        for col_idx in 0..batch.num_columns() {
            let array = batch.column(col_idx);
            for (row_idx, row) in rows.iter_mut().enumerate() {
                row.push(cell_from_array(array.as_ref(), row_idx)?);
            }
        }
        Ok(Frame { columns, rows })
    }
}

fn cell_from_array(array: &dyn Array, row: usize) -> Result<Cell> {
    if array.is_null(row) {
        return Ok(Cell::Null);
    }
    match array.data_type() {
        DataType::Int64 => {
            let arr = array
                .as_any()
                .downcast_ref::<Int64Array>()
                .context("expected Int64 column")?;
            Ok(Cell::Int(arr.value(row)))
        }
        DataType::Float64 => {
            let arr = array
                .as_any()
                .downcast_ref::<Float64Array>()
                .context("expected Float64 column")?;
            Ok(Cell::Float(arr.value(row)))
        }
        DataType::Boolean => {
            let arr = array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .context("expected Boolean column")?;
            Ok(Cell::Bool(arr.value(row)))
        }
        DataType::Utf8 => {
            let arr = array
                .as_any()
                .downcast_ref::<StringArray>()
                .context("expected Utf8 column")?;
            Ok(Cell::Str(arr.value(row).to_string()))
        }
        other => bail!("unsupported parquet column type: {other:?}"),
    }
}

/// Minimal CSV quoting: fields containing a comma, quote, or newline are
/// wrapped in quotes with embedded quotes doubled.
fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
