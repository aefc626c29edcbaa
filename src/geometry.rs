use geo_types::Geometry;
use polars::prelude::*;
use tracing::warn;
use wkt::{ToWkt, TryFromWkt};

use crate::{Result, ZonalError, DEFAULT_ID_FIELD};

/// Name of the column holding zone geometries, as WKT.
pub const GEOMETRY_COLUMN: &str = "geometry";

const ROW_INDEX: &str = "__zone_row";

/// A struct to hold the geometry record for a feature
#[derive(Debug, Clone)]
pub struct GeomRecord {
    /// The geometry
    pub geometry: Geometry<f64>,
    /// The name of the feature, used as zone identifier
    pub name: String,
}

/// Zone geometries in any of the accepted shapes.
#[derive(Debug, Clone)]
pub enum GeometryInput {
    /// Attribute frame whose `geometry` column holds WKT text.
    Frame(DataFrame),
    /// Attribute frame plus one geometry per row.
    Attributed(DataFrame, Vec<Geometry<f64>>),
    /// Named geometries; names land in the `ID` column.
    Records(Vec<GeomRecord>),
    /// `(id, wkt)` pairs; ids land in the `ID` column.
    Wkt(Vec<(String, String)>),
}

impl From<DataFrame> for GeometryInput {
    fn from(frame: DataFrame) -> Self {
        GeometryInput::Frame(frame)
    }
}

impl From<Vec<GeomRecord>> for GeometryInput {
    fn from(records: Vec<GeomRecord>) -> Self {
        GeometryInput::Records(records)
    }
}

fn require_column(frame: &DataFrame, name: &str, what: &str) -> Result<()> {
    match frame.get_column_index(name) {
        Some(_) => Ok(()),
        None => Err(ZonalError::InvalidInput(format!("{what} has no `{name}` column"))),
    }
}

/// Zone attributes in a [`DataFrame`] with the parsed geometries kept alongside,
/// row `i` of the frame describing `geometries()[i]`.
///
/// The frame always carries a `geometry` column with the WKT of each zone, so
/// that joins bring the geometry into result tables.
#[derive(Debug, Clone)]
pub struct GeometryTable {
    frame: DataFrame,
    geometries: Vec<Geometry<f64>>,
}

impl GeometryTable {
    pub fn new(mut frame: DataFrame, geometries: Vec<Geometry<f64>>) -> Result<Self> {
        if frame.width() > 0 && frame.height() != geometries.len() {
            return Err(ZonalError::InvalidInput(format!(
                "{} attribute rows for {} geometries",
                frame.height(),
                geometries.len()
            )));
        }
        let wkt: Vec<String> = geometries.iter().map(|g| g.wkt_string()).collect();
        frame.with_column(Column::new(GEOMETRY_COLUMN.into(), wkt))?;
        Ok(Self { frame, geometries })
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn into_frame(self) -> DataFrame {
        self.frame
    }

    pub fn geometries(&self) -> &[Geometry<f64>] {
        &self.geometries
    }

    pub fn len(&self) -> usize {
        self.geometries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.geometries.is_empty()
    }

    /// Zone key and geometry for every row with a non-null key.
    pub fn zones(&self, id_field: &str) -> Result<Vec<(String, &Geometry<f64>)>> {
        require_column(&self.frame, id_field, "geometry table")?;
        let ids = self.frame.column(id_field)?.cast(&DataType::String)?;
        let ids = ids.str()?;

        Ok(ids
            .into_iter()
            .zip(self.geometries.iter())
            .filter_map(|(id, geometry)| Some((id?.to_string(), geometry)))
            .collect())
    }

    /// Inner join of the zone attributes with `table` on `id_field`.
    ///
    /// Zone columns come first and rows follow the zone order. Keys are
    /// compared as text; clashing columns of `table` get a `_right` suffix.
    pub fn join(&self, table: &DataFrame, id_field: &str) -> Result<DataFrame> {
        require_column(&self.frame, id_field, "geometry table")?;
        require_column(table, id_field, "result table")?;

        let mut left = self.frame.clone();
        let key = left.column(id_field)?.cast(&DataType::String)?;
        left.with_column(key)?;
        let mut right = table.clone();
        let key = right.column(id_field)?.cast(&DataType::String)?;
        right.with_column(key)?;

        let joined = left
            .with_row_index(ROW_INDEX.into(), None)?
            .inner_join(&right, [id_field], [id_field])?
            .sort([ROW_INDEX], SortMultipleOptions::default().with_maintain_order(true))?
            .drop(ROW_INDEX)?;
        Ok(joined)
    }
}

fn id_frame(ids: Vec<String>) -> Result<DataFrame> {
    Ok(DataFrame::new(vec![Column::new(DEFAULT_ID_FIELD.into(), ids)])?)
}

fn parse_wkt(id: &str, text: &str) -> Result<Geometry<f64>> {
    Geometry::<f64>::try_from_wkt_str(text)
        .map_err(|e| ZonalError::InvalidInput(format!("invalid WKT for zone {id}: {e}")))
}

/// Coerce `geom` into a [`GeometryTable`], tagging it with `crs` when given.
///
/// The tag is informational: geometries are never reprojected.
///
/// # Example
///
/// ```
/// use zonal_aggregation::{prepare_geometry, GeometryInput};
///
/// let input = GeometryInput::Wkt(vec![(
///     "A".to_string(),
///     "POLYGON((0 0,1 0,1 1,0 1,0 0))".to_string(),
/// )]);
/// let table = prepare_geometry(input, Some("EPSG:4326")).unwrap();
/// assert_eq!(table.frame().get_column_names_str(), &["ID", "geometry", "crs"]);
/// ```
pub fn prepare_geometry(geom: GeometryInput, crs: Option<&str>) -> Result<GeometryTable> {
    let mut table = match geom {
        GeometryInput::Frame(frame) => {
            require_column(&frame, GEOMETRY_COLUMN, "geometry frame")?;
            let geometries = frame
                .column(GEOMETRY_COLUMN)?
                .str()
                .map_err(|_| {
                    ZonalError::InvalidInput(format!("`{GEOMETRY_COLUMN}` column must hold WKT text"))
                })?
                .into_iter()
                .enumerate()
                .map(|(row, text)| match text {
                    Some(text) => parse_wkt(&row.to_string(), text),
                    None => Err(ZonalError::InvalidInput(format!("zone at row {row} has no geometry"))),
                })
                .collect::<Result<Vec<_>>>()?;
            GeometryTable::new(frame, geometries)?
        }
        GeometryInput::Attributed(frame, geometries) => GeometryTable::new(frame, geometries)?,
        GeometryInput::Records(records) => {
            let (ids, geometries): (Vec<String>, Vec<Geometry<f64>>) =
                records.into_iter().map(|r| (r.name, r.geometry)).unzip();
            GeometryTable::new(id_frame(ids)?, geometries)?
        }
        GeometryInput::Wkt(pairs) => {
            let geometries = pairs
                .iter()
                .map(|(id, text)| parse_wkt(id, text))
                .collect::<Result<Vec<_>>>()?;
            let ids = pairs.into_iter().map(|(id, _)| id).collect();
            GeometryTable::new(id_frame(ids)?, geometries)?
        }
    };

    if let Some(crs) = crs {
        warn!(crs, "tagging zones with a CRS; geometries are not reprojected");
        let tag = vec![crs.to_string(); table.len()];
        table.frame.with_column(Column::new("crs".into(), tag))?;
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::{Coord, LineString, Polygon};

    fn unit_square() -> Geometry<f64> {
        let coords = vec![
            Coord { x: 0.0, y: 0.0 },
            Coord { x: 1.0, y: 0.0 },
            Coord { x: 1.0, y: 1.0 },
            Coord { x: 0.0, y: 1.0 },
            Coord { x: 0.0, y: 0.0 },
        ];
        Geometry::Polygon(Polygon::new(LineString::from(coords), vec![]))
    }

    fn texts(frame: &DataFrame, column: &str) -> Vec<Option<String>> {
        frame
            .column(column)
            .unwrap()
            .cast(&DataType::String)
            .unwrap()
            .str()
            .unwrap()
            .into_iter()
            .map(|v| v.map(str::to_string))
            .collect()
    }

    #[test]
    fn test_prepare_records() {
        let records = vec![GeomRecord {
            geometry: unit_square(),
            name: "A".into(),
        }];
        let table = prepare_geometry(records.into(), None).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.frame().get_column_index("crs").is_none());

        let zones = table.zones("ID").unwrap();
        assert_eq!(zones[0].0, "A");
        assert_eq!(zones[0].1, &unit_square());
    }

    #[test]
    fn test_prepare_wkt() {
        let input = GeometryInput::Wkt(vec![(
            "1".into(),
            "POLYGON((0 0,1 0,1 1,0 1,0 0))".into(),
        )]);
        let table = prepare_geometry(input, None).unwrap();
        assert_eq!(table.zones("ID").unwrap()[0].1, &unit_square());
    }

    #[test]
    fn test_prepare_frame_with_wkt_column() {
        let frame = df!(
            "CODE" => [7i64, 8],
            "geometry" => ["POLYGON((0 0,1 0,1 1,0 1,0 0))", "POINT(3 3)"],
        )
        .unwrap();
        let table = prepare_geometry(frame.into(), None).unwrap();

        assert_eq!(table.geometries()[0], unit_square());
        let zones = table.zones("CODE").unwrap();
        assert_eq!(zones[1].0, "8");
    }

    #[test]
    fn test_prepare_bad_wkt() {
        let input = GeometryInput::Wkt(vec![("1".into(), "POLYGON((0 0,1".into())]);
        assert!(matches!(
            prepare_geometry(input, None),
            Err(ZonalError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_frame_without_geometry_rejected() {
        let frame = df!("ID" => ["A"]).unwrap();
        assert!(matches!(
            prepare_geometry(frame.into(), None),
            Err(ZonalError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_attributed_length_mismatch() {
        let frame = df!("ID" => ["A", "B"]).unwrap();
        let input = GeometryInput::Attributed(frame, vec![unit_square()]);
        assert!(prepare_geometry(input, None).is_err());
    }

    #[test]
    fn test_crs_is_tagged_not_projected() {
        let records = vec![GeomRecord {
            geometry: unit_square(),
            name: "A".into(),
        }];
        let table = prepare_geometry(records.into(), Some("EPSG:3035")).unwrap();
        assert_eq!(texts(table.frame(), "crs"), vec![Some("EPSG:3035".to_string())]);
        assert_eq!(table.zones("ID").unwrap()[0].1, &unit_square());
    }

    #[test]
    fn test_zones_missing_id_field() {
        let table = prepare_geometry(Vec::<GeomRecord>::new().into(), None).unwrap();
        assert!(matches!(table.zones("CODE"), Err(ZonalError::InvalidInput(_))));
    }

    #[test]
    fn test_join_keeps_zone_order() {
        let input = GeometryInput::Wkt(vec![
            ("a".into(), "POLYGON((0 0,1 0,1 1,0 1,0 0))".into()),
            ("b".into(), "POLYGON((1 1,2 1,2 2,1 2,1 1))".into()),
            ("c".into(), "POLYGON((2 2,3 2,3 3,2 3,2 2))".into()),
        ]);
        let zones = prepare_geometry(input, None).unwrap();
        let stats = df!(
            "ID" => ["c", "a", "z"],
            "MEAN" => [3.0, 1.0, 9.0],
        )
        .unwrap();

        let joined = zones.join(&stats, "ID").unwrap();
        assert_eq!(joined.get_column_names_str(), &["ID", "geometry", "MEAN"]);
        assert_eq!(texts(&joined, "ID"), vec![Some("a".into()), Some("c".into())]);
        let means: Vec<Option<f64>> = joined.column("MEAN").unwrap().f64().unwrap().into_iter().collect();
        assert_eq!(means, vec![Some(1.0), Some(3.0)]);
    }

    #[test]
    fn test_join_numeric_and_text_keys() {
        let frame = df!(
            "ID" => [7i64],
            "geometry" => ["POLYGON((0 0,1 0,1 1,0 1,0 0))"],
        )
        .unwrap();
        let zones = prepare_geometry(frame.into(), None).unwrap();
        let stats = df!("ID" => ["7"], "MAX" => [2.0]).unwrap();

        let joined = zones.join(&stats, "ID").unwrap();
        assert_eq!(joined.height(), 1);
        assert_eq!(joined.get_column_names_str(), &["ID", "geometry", "MAX"]);
    }

    #[test]
    fn test_join_missing_key() {
        let zones = prepare_geometry(Vec::<GeomRecord>::new().into(), None).unwrap();
        let stats = df!("zone" => ["a"], "MEAN" => [1.0]).unwrap();
        assert!(matches!(zones.join(&stats, "ID"), Err(ZonalError::InvalidInput(_))));
    }
}
