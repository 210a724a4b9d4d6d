//! Record Transformer (C4): per-report-family column contract, type
//! coercion, and augmentation.
//!
//! Each report family is represented as a value implementing the
//! [`Transformer`] capability set, registered by
//! report name in a [`Registry`]. There is exactly one concrete
//! implementation, [`GenericTransformer`], driven entirely by data (a
//! [`TransformerDescriptor`]) — the per-family variance described in
//! `original_source/scripts/tables.py` (one Python subclass per report) is
//! pure composition here, not inheritance.

pub mod coerce;

use chrono::Utc;
use coerce::DateKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Augmentation columns added before append, shared by every
/// transformer regardless of report family.
pub const COL_SIGN: &str = "sign";
pub const COL_ORIGINAL_FILE_PARSED_ON: &str = "original_file_parsed_on";
pub const COL_IS_OBSOLETE_DATE: &str = "is_obsolete_date";

/// Static per-report-family descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerDescriptor {
    pub report_name: String,
    pub table_name: String,
    pub database_name: String,
    pub business_key_column: String,
    #[serde(default)]
    pub original_date_sentinel_column: Option<String>,
    #[serde(default)]
    pub float_columns: Vec<String>,
    #[serde(default)]
    pub int_columns: Vec<String>,
    #[serde(default)]
    pub date_columns: Vec<String>,
    #[serde(default)]
    pub datetime_columns: Vec<String>,
    #[serde(default)]
    pub bool_columns: Vec<String>,
    /// Authoritative column set after augmentation (excludes the
    /// store-generated `uuid`), used for the symmetric-difference contract
    /// check in the writer.
    pub expected_column_set: Vec<String>,
    /// Only the `FreightRates` family lowercases keys in the source: the
    /// descriptor must declare this explicitly rather than the
    /// implementation inferring it by type.
    #[serde(default)]
    pub lowercase_keys: bool,
}

/// One record transformed and ready for append (all augmentation columns
/// present, `sign` stamped to `+1`).
pub type TransformedRow = Map<String, Value>;

/// Capability set implemented once per report family.
pub trait Transformer: Send + Sync {
    fn report_name(&self) -> &str;
    fn table_name(&self) -> &str;
    fn database_name(&self) -> &str;
    fn business_key_column(&self) -> &str;
    fn sentinel_column(&self) -> Option<&str>;
    fn expected_columns(&self) -> &[String];

    /// Transform one raw JSON record (one element of `header.data`) into an
    /// augmented, coerced row. Never fails: unparsable scalars are carried
    /// through as raw strings so the store (or the column-set contract
    /// check) is the single point that rejects bad data — matching the
    /// source's `change_columns`, which never raises.
    fn transform(&self, record: Map<String, Value>, parsed_on: &str) -> TransformedRow;
}

/// The one concrete [`Transformer`], driven by a [`TransformerDescriptor`].
pub struct GenericTransformer {
    descriptor: TransformerDescriptor,
}

impl GenericTransformer {
    pub fn new(descriptor: TransformerDescriptor) -> Self {
        Self { descriptor }
    }
}

impl Transformer for GenericTransformer {
    fn report_name(&self) -> &str {
        &self.descriptor.report_name
    }

    fn table_name(&self) -> &str {
        &self.descriptor.table_name
    }

    fn database_name(&self) -> &str {
        &self.descriptor.database_name
    }

    fn business_key_column(&self) -> &str {
        &self.descriptor.business_key_column
    }

    fn sentinel_column(&self) -> Option<&str> {
        self.descriptor.original_date_sentinel_column.as_deref()
    }

    fn expected_columns(&self) -> &[String] {
        &self.descriptor.expected_column_set
    }

    fn transform(&self, record: Map<String, Value>, parsed_on: &str) -> TransformedRow {
        let d = &self.descriptor;

        let mut row: Map<String, Value> = if d.lowercase_keys {
            record
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect()
        } else {
            record
        };

        let mut sentinel_notes = String::new();

        for col in &d.float_columns {
            if let Some(v) = row.get(col) {
                let coerced = coerce::coerce_float(v);
                row.insert(col.clone(), coerced);
            }
        }
        for col in &d.int_columns {
            if let Some(v) = row.get(col) {
                let coerced = coerce::coerce_int(v);
                row.insert(col.clone(), coerced);
            }
        }
        for col in &d.date_columns {
            if let Some(v) = row.get(col) {
                let out = coerce::coerce_date(v, col, DateKind::Date);
                row.insert(col.clone(), out.value);
                if let Some(note) = out.sentinel_note {
                    sentinel_notes.push_str(&note);
                }
            }
        }
        for col in &d.datetime_columns {
            if let Some(v) = row.get(col) {
                let out = coerce::coerce_date(v, col, DateKind::DateTime);
                row.insert(col.clone(), out.value);
                if let Some(note) = out.sentinel_note {
                    sentinel_notes.push_str(&note);
                }
            }
        }
        for col in &d.bool_columns {
            if let Some(v) = row.get(col) {
                let coerced = coerce::coerce_bool(v);
                row.insert(col.clone(), coerced);
            }
        }

        row.insert(COL_SIGN.to_string(), Value::Number(1.into()));
        row.insert(
            COL_ORIGINAL_FILE_PARSED_ON.to_string(),
            Value::String(parsed_on.to_string()),
        );
        row.insert(
            COL_IS_OBSOLETE_DATE.to_string(),
            Value::String(Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()),
        );
        if let Some(sentinel_col) = &d.original_date_sentinel_column {
            row.insert(sentinel_col.clone(), Value::String(sentinel_notes));
        }

        row
    }
}

/// `report_name -> Transformer` registry. Replaces the source's
/// class hierarchy with a flat map of data-driven values.
pub struct Registry {
    transformers: HashMap<String, Box<dyn Transformer>>,
}

impl Registry {
    pub fn from_descriptors(descriptors: Vec<TransformerDescriptor>) -> Self {
        let mut transformers: HashMap<String, Box<dyn Transformer>> = HashMap::with_capacity(descriptors.len());
        for d in descriptors {
            let name = d.report_name.clone();
            transformers.insert(name, Box::new(GenericTransformer::new(d)));
        }
        Self { transformers }
    }

    /// Look up a transformer by `header.report`. `None` means: dead-letter
    /// the message and fail the Worker — no guessing.
    pub fn get(&self, report_name: &str) -> Option<&dyn Transformer> {
        self.transformers.get(report_name).map(|b| b.as_ref())
    }
}

/// Parse the JSON array of [`TransformerDescriptor`] shipped at
/// `config/transformers.json`.
pub fn load_descriptors(raw: &str) -> anyhow::Result<Vec<TransformerDescriptor>> {
    let descriptors: Vec<TransformerDescriptor> = serde_json::from_str(raw)?;
    Ok(descriptors)
}
