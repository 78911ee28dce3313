//! CSV adapter around the lag core: reads event tables, writes augmented ones.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::event::{AttrValue, RawEvent};
use crate::projector::{AugmentedEvent, LagSchema};

const TIMESTAMP_OUTPUT_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Which header names carry the entity, timestamp and attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableLayout {
    pub entity_column: String,
    pub timestamp_column: String,
    pub time_of_day_column: Option<String>,
    /// `None` takes every remaining column, in header order.
    pub attribute_columns: Option<Vec<String>>,
}

impl Default for TableLayout {
    fn default() -> Self {
        Self {
            entity_column: "entity_key".to_string(),
            timestamp_column: "timestamp".to_string(),
            time_of_day_column: None,
            attribute_columns: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventTable {
    pub attribute_columns: Vec<String>,
    pub events: Vec<RawEvent>,
}

#[derive(Debug, Error)]
pub enum TableIoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("column '{column}' not found in table header")]
    MissingColumn { column: String },
    #[error("column '{column}' appears more than once in output header")]
    DuplicateColumn { column: String },
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub fn read_event_table(path: &Path, layout: &TableLayout) -> Result<EventTable, TableIoError> {
    let file = File::open(path).map_err(|source| TableIoError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let table = read_event_table_from(BufReader::new(file), layout)?;

    info!(
        component = "table_io",
        event = "table.read",
        path = %path.display(),
        rows = table.events.len(),
        attribute_columns = table.attribute_columns.len()
    );

    Ok(table)
}

pub fn read_event_table_from<R: Read>(
    input: R,
    layout: &TableLayout,
) -> Result<EventTable, TableIoError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(input);
    let headers = reader.headers()?.clone();

    let position = |column: &str| {
        headers
            .iter()
            .position(|header| header.trim() == column)
            .ok_or_else(|| TableIoError::MissingColumn {
                column: column.to_string(),
            })
    };

    let entity_idx = position(layout.entity_column.as_str())?;
    let timestamp_idx = position(layout.timestamp_column.as_str())?;
    let time_of_day_idx = match layout.time_of_day_column.as_deref() {
        Some(column) => Some(position(column)?),
        None => None,
    };

    let attribute_columns: Vec<(usize, String)> = match &layout.attribute_columns {
        Some(columns) => columns
            .iter()
            .map(|column| Ok((position(column.as_str())?, column.clone())))
            .collect::<Result<_, TableIoError>>()?,
        None => headers
            .iter()
            .enumerate()
            .filter(|(idx, _)| {
                *idx != entity_idx && *idx != timestamp_idx && Some(*idx) != time_of_day_idx
            })
            .map(|(idx, header)| (idx, header.trim().to_string()))
            .collect(),
    };

    let mut events = Vec::new();
    for record in reader.records() {
        let record = record?;
        let cell = |idx: usize| record.get(idx).map(str::trim).filter(|v| !v.is_empty());

        let attributes = attribute_columns
            .iter()
            .map(|(idx, name)| {
                let value = cell(*idx).map(|text| AttrValue::Text(text.to_string()));
                (name.clone(), value)
            })
            .collect();

        events.push(RawEvent {
            entity_key: cell(entity_idx).unwrap_or_default().to_string(),
            timestamp: cell(timestamp_idx).map(str::to_string),
            time_of_day: time_of_day_idx.and_then(cell).map(str::to_string),
            attributes,
        });
    }

    Ok(EventTable {
        attribute_columns: attribute_columns.into_iter().map(|(_, name)| name).collect(),
        events,
    })
}

pub fn write_augmented_table(
    path: &Path,
    layout: &TableLayout,
    attribute_columns: &[String],
    schema: &LagSchema,
    rows: &[AugmentedEvent],
) -> Result<(), TableIoError> {
    let file = File::create(path).map_err(|source| TableIoError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    write_augmented_table_to(BufWriter::new(file), layout, attribute_columns, schema, rows)?;

    info!(
        component = "table_io",
        event = "table.written",
        path = %path.display(),
        rows = rows.len(),
        lag_columns = schema.columns.len()
    );

    Ok(())
}

/// Writes entity, timestamp, attributes, then lag columns in schema order.
/// Missing values become empty cells. Header names must be unique.
pub fn write_augmented_table_to<W: Write>(
    output: W,
    layout: &TableLayout,
    attribute_columns: &[String],
    schema: &LagSchema,
    rows: &[AugmentedEvent],
) -> Result<(), TableIoError> {
    let mut writer = csv::Writer::from_writer(output);

    let mut header = Vec::with_capacity(2 + attribute_columns.len() + schema.columns.len());
    header.push(layout.entity_column.clone());
    header.push(layout.timestamp_column.clone());
    header.extend(attribute_columns.iter().cloned());
    header.extend(schema.columns.iter().map(|column| column.name.clone()));

    let mut seen = HashSet::with_capacity(header.len());
    if let Some(column) = header.iter().find(|column| !seen.insert(column.as_str())) {
        return Err(TableIoError::DuplicateColumn {
            column: column.clone(),
        });
    }
    writer.write_record(&header)?;

    let lag_keys: Vec<_> = schema.columns.iter().map(|column| column.key()).collect();
    for row in rows {
        let mut record = Vec::with_capacity(header.len());
        record.push(row.event.entity_key.clone());
        record.push(row.event.timestamp.format(TIMESTAMP_OUTPUT_FORMAT).to_string());
        for attribute in attribute_columns {
            record.push(cell_text(row.event.attribute(attribute)));
        }
        for key in &lag_keys {
            record.push(cell_text(
                row.lag_attributes.get(key).and_then(Option::as_ref),
            ));
        }
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}

fn cell_text(value: Option<&AttrValue>) -> String {
    value.map(ToString::to_string).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RACE_TABLE: &str = "\
Race_Id,Name,Date,Start_Time,Rank,Jockey,Odds
r1,Gold Ship,2022/06/05,15:40,1,Uchida,2.5
r2,Gold Ship,2022/06/26,,3,,
r3,Orfevre,not-a-date,15:40,2,Ikezoe,4.1
";

    fn race_layout() -> TableLayout {
        TableLayout {
            entity_column: "Name".to_string(),
            timestamp_column: "Date".to_string(),
            time_of_day_column: Some("Start_Time".to_string()),
            attribute_columns: None,
        }
    }

    #[test]
    fn reads_remaining_columns_as_verbatim_text() {
        let table = read_event_table_from(RACE_TABLE.as_bytes(), &race_layout()).unwrap();

        assert_eq!(table.attribute_columns, vec!["Race_Id", "Rank", "Jockey", "Odds"]);
        assert_eq!(table.events.len(), 3);

        let first = &table.events[0];
        assert_eq!(first.entity_key, "Gold Ship");
        assert_eq!(first.timestamp.as_deref(), Some("2022/06/05"));
        assert_eq!(first.time_of_day.as_deref(), Some("15:40"));
        assert_eq!(first.attributes["Rank"], Some(AttrValue::Text("1".to_string())));
        assert_eq!(first.attributes["Odds"], Some(AttrValue::Text("2.5".to_string())));
        assert_eq!(
            first.attributes["Jockey"],
            Some(AttrValue::Text("Uchida".to_string()))
        );

        let second = &table.events[1];
        assert_eq!(second.time_of_day, None);
        assert_eq!(second.attributes["Jockey"], None);
        assert!(second.attributes.contains_key("Odds"));
    }

    #[test]
    fn explicit_attribute_columns_must_exist() {
        let layout = TableLayout {
            attribute_columns: Some(vec!["Rank".to_string(), "Weight".to_string()]),
            ..race_layout()
        };
        let err = read_event_table_from(RACE_TABLE.as_bytes(), &layout).unwrap_err();
        assert!(matches!(err, TableIoError::MissingColumn { column } if column == "Weight"));
    }

    #[test]
    fn missing_entity_column_is_reported() {
        let layout = TableLayout::default();
        let err = read_event_table_from(RACE_TABLE.as_bytes(), &layout).unwrap_err();
        assert!(matches!(err, TableIoError::MissingColumn { column } if column == "entity_key"));
    }
}
