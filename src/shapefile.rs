use std::collections::{BTreeMap, BTreeSet};
use std::{error::Error, path::Path};

use polars::prelude::*;
use shapefile::dbase::FieldValue;
use zonal_aggregation::GeometryInput;

enum Attribute {
    Number(f64),
    Text(String),
    Null,
}

impl From<FieldValue> for Attribute {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Character(Some(v)) => Attribute::Text(v),
            FieldValue::Numeric(Some(v)) => Attribute::Number(v),
            FieldValue::Float(Some(v)) => Attribute::Number(v as f64),
            FieldValue::Double(v) => Attribute::Number(v),
            FieldValue::Integer(v) => Attribute::Number(v as f64),
            FieldValue::Currency(v) => Attribute::Number(v),
            FieldValue::Logical(Some(v)) => Attribute::Number(if v { 1.0 } else { 0.0 }),
            FieldValue::Memo(v) => Attribute::Text(v),
            _ => Attribute::Null,
        }
    }
}

/// Zone identifier of a dbase value; numbers are written without a trailing `.0`.
fn zone_id(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Character(Some(id)) => Some(id.clone()),
        FieldValue::Numeric(Some(id)) => Some(id.to_string()),
        FieldValue::Integer(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Numeric columns stay numeric, anything else mixed in turns the column to text.
fn attribute_column(name: &str, values: Vec<Attribute>) -> Column {
    if values.iter().all(|v| !matches!(v, Attribute::Text(_))) {
        let values: Vec<Option<f64>> = values
            .into_iter()
            .map(|v| match v {
                Attribute::Number(v) => Some(v),
                _ => None,
            })
            .collect();
        return Column::new(name.into(), values);
    }
    let values: Vec<Option<String>> = values
        .into_iter()
        .map(|v| match v {
            Attribute::Number(v) => Some(v.to_string()),
            Attribute::Text(v) => Some(v),
            Attribute::Null => None,
        })
        .collect();
    Column::new(name.into(), values)
}

/// Build the attribute frame: the `field` column first, the others by name.
fn attribute_frame(
    field: &str,
    ids: Vec<String>,
    mut attributes: Vec<BTreeMap<String, FieldValue>>,
) -> PolarsResult<DataFrame> {
    // dbase records come as maps, fix the column order here
    let names: BTreeSet<String> = attributes
        .iter()
        .flat_map(|record| record.keys().cloned())
        .filter(|name| name != field)
        .collect();

    let mut columns = vec![Column::new(field.into(), ids)];
    for name in names {
        let values = attributes
            .iter_mut()
            .map(|record| record.remove(&name).map(Attribute::from).unwrap_or(Attribute::Null))
            .collect();
        columns.push(attribute_column(&name, values));
    }
    DataFrame::new(columns)
}

/// Read the shapefile into zone attributes and geometries.
///
/// Every dbase attribute becomes a column; the `field` column, used as zone
/// identifier, is always textual. Records with a non-polygonal shape or
/// without an identifier are skipped.
///
/// # Arguments
///
/// * `shp_file` - Path to the shapefile
/// * `field` - Name of the zone identifier field
pub fn read_shapefile(shp_file: &Path, field: &str) -> Result<GeometryInput, Box<dyn Error>> {
    let mut reader = shapefile::Reader::from_path(shp_file)?;

    let mut ids = vec![];
    let mut attributes = vec![];
    let mut geometries = vec![];
    for (shape, record) in reader.iter_shapes_and_records().filter_map(Result::ok) {
        let record: BTreeMap<String, FieldValue> = record.into_iter().collect();
        let Some(id) = record.get(field).and_then(zone_id) else {
            continue;
        };
        if !matches!(shape, shapefile::Shape::Polygon(_)) {
            continue;
        }
        let Ok(geometry) = geo_types::Geometry::<f64>::try_from(shape) else {
            continue;
        };
        ids.push(id);
        attributes.push(record);
        geometries.push(geometry);
    }

    let frame = attribute_frame(field, ids, attributes)?;
    Ok(GeometryInput::Attributed(frame, geometries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_id_kinds() {
        assert_eq!(zone_id(&FieldValue::Character(Some("A1".into()))), Some("A1".into()));
        assert_eq!(zone_id(&FieldValue::Numeric(Some(12.0))), Some("12".into()));
        assert_eq!(zone_id(&FieldValue::Integer(7)), Some("7".into()));
        assert_eq!(zone_id(&FieldValue::Character(None)), None);
        assert_eq!(zone_id(&FieldValue::Numeric(None)), None);
    }

    #[test]
    fn test_attribute_frame() {
        let records = vec![
            BTreeMap::from([
                ("CODE".to_string(), FieldValue::Integer(7)),
                ("AREA".to_string(), FieldValue::Numeric(Some(1.5))),
                ("NAME".to_string(), FieldValue::Character(Some("north".into()))),
            ]),
            BTreeMap::from([
                ("CODE".to_string(), FieldValue::Integer(8)),
                ("AREA".to_string(), FieldValue::Numeric(None)),
                ("NAME".to_string(), FieldValue::Numeric(Some(2.0))),
            ]),
        ];
        let frame = attribute_frame("CODE", vec!["7".into(), "8".into()], records).unwrap();

        assert_eq!(frame.get_column_names_str(), &["CODE", "AREA", "NAME"]);
        assert_eq!(frame.column("CODE").unwrap().str().unwrap().get(0), Some("7"));

        let area = frame.column("AREA").unwrap().f64().unwrap();
        assert_eq!(area.get(0), Some(1.5));
        assert_eq!(area.get(1), None);

        let name = frame.column("NAME").unwrap().str().unwrap();
        assert_eq!(name.get(0), Some("north"));
        assert_eq!(name.get(1), Some("2"));
    }
}
