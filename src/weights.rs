use std::collections::BTreeMap;

use geo::{Area, BooleanOps, BoundingRect, MultiPolygon};
use geo_types::Geometry;
use polars::prelude::*;
use rayon::prelude::*;
use tracing::debug;

use crate::{zone_progress, BackendError, GeometryTable, Grid, Raster, Result, ZonalError};

/// Coverage below this is treated as a shared edge rather than an overlap.
const MIN_COVERAGE: f64 = 1e-12;

/// Fraction of every cell covered by each zone.
///
/// Built once per raster shape and reusable for all rasters sharing that grid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightGrid {
    pub n_rows: usize,
    pub n_cols: usize,
    /// Zone key -> `(cell, coverage_fraction)`, `cell = row * n_cols + col`.
    pub zones: BTreeMap<String, Vec<(usize, f64)>>,
}

impl WeightGrid {
    pub fn new(n_rows: usize, n_cols: usize) -> Self {
        Self {
            n_rows,
            n_cols,
            zones: BTreeMap::new(),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.n_rows, self.n_cols)
    }

    /// `(row, col)` of a flat cell index.
    pub fn cell_position(&self, cell: usize) -> (usize, usize) {
        (cell / self.n_cols, cell % self.n_cols)
    }

    /// Check that every cell index falls inside the `n_rows x n_cols` grid.
    pub fn validate(&self) -> Result<()> {
        let n_cells = self.n_rows * self.n_cols;
        for (zone, cells) in &self.zones {
            if let Some((cell, _)) = cells.iter().find(|(cell, _)| *cell >= n_cells) {
                return Err(ZonalError::InvalidInput(format!(
                    "zone {zone} references cell {cell} outside a {}x{} grid",
                    self.n_rows, self.n_cols
                )));
            }
        }
        Ok(())
    }

    /// Long form, one row per `(zone, cell)`: `id_field, cell, coverage_fraction`.
    pub fn to_table(&self, id_field: &str) -> Result<DataFrame> {
        let rows = self
            .zones
            .iter()
            .flat_map(|(zone, cells)| cells.iter().map(move |(cell, f)| (zone.as_str(), *cell as u64, *f)));
        let (mut ids, mut cells, mut fractions) = (vec![], vec![], vec![]);
        for (id, cell, fraction) in rows {
            ids.push(id);
            cells.push(cell);
            fractions.push(fraction);
        }

        Ok(DataFrame::new(vec![
            Column::new(id_field.into(), ids),
            Column::new("cell".into(), cells),
            Column::new("coverage_fraction".into(), fractions),
        ])?)
    }
}

/// Computes a [`WeightGrid`] for a raster grid and a set of zones.
pub trait WeightGridBuilder {
    fn build(
        &self,
        raster: &Raster,
        geometry: &GeometryTable,
        id_field: &str,
        show_progress: bool,
    ) -> std::result::Result<WeightGrid, BackendError>;
}

/// Exact coverage fractions from polygon/cell intersection areas.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoverageWeightBuilder;

impl WeightGridBuilder for CoverageWeightBuilder {
    fn build(
        &self,
        raster: &Raster,
        geometry: &GeometryTable,
        id_field: &str,
        show_progress: bool,
    ) -> std::result::Result<WeightGrid, BackendError> {
        Ok(coverage_weights(&raster.grid, geometry, id_field, show_progress)?)
    }
}

fn as_multipolygon(name: &str, geometry: &Geometry<f64>) -> Result<MultiPolygon<f64>> {
    match geometry {
        Geometry::Polygon(p) => Ok(MultiPolygon::new(vec![p.clone()])),
        Geometry::MultiPolygon(mp) => Ok(mp.clone()),
        Geometry::Rect(r) => Ok(MultiPolygon::new(vec![r.to_polygon()])),
        Geometry::Triangle(t) => Ok(MultiPolygon::new(vec![t.to_polygon()])),
        _ => Err(ZonalError::InvalidInput(format!(
            "zone {name} is not a polygonal geometry"
        ))),
    }
}

/// Get the coverage fraction of every cell of `grid` touched by each zone.
///
/// # Example
///
/// ```
/// use zonal_aggregation::{prepare_geometry, GeometryInput, Grid};
/// use zonal_aggregation::coverage_weights;
///
/// // 3x3 grid of unit cells starting at (0, 0)
/// let grid = Grid::new(0.0, 2.0, 0.0, 2.0, 3, 3);
/// let zones = prepare_geometry(
///     GeometryInput::Wkt(vec![("A".into(), "POLYGON((0 0,1.5 0,1.5 1.5,0 1.5,0 0))".into())]),
///     None,
/// )
/// .unwrap();
///
/// let weights = coverage_weights(&grid, &zones, "ID", false).unwrap();
/// let cells = &weights.zones["A"];
/// assert_eq!(cells.len(), 4);
/// // the bottom-left cell is fully covered
/// assert!(cells.iter().any(|(cell, f)| *cell == 0 && (f - 1.0).abs() < 1e-9));
/// ```
pub fn coverage_weights(
    grid: &Grid,
    geometry: &GeometryTable,
    id_field: &str,
    show_progress: bool,
) -> Result<WeightGrid> {
    let zones = geometry.zones(id_field)?;
    let cell_area = (grid.lat_step * grid.lon_step).abs();
    if cell_area == 0.0 {
        return Err(ZonalError::InvalidInput("grid has zero cell area".into()));
    }

    let pb = zone_progress(zones.len(), show_progress, "weights");

    let name_and_cells = zones
        .par_iter()
        .map(|(name, geometry)| {
            let polygons = as_multipolygon(name, geometry)?;
            let cells = match polygons.bounding_rect() {
                Some(bbox) => match grid.pixel_range(bbox)? {
                    Some((min_row, max_row, min_col, max_col)) => (min_row..=max_row)
                        .flat_map(|row| (min_col..=max_col).map(move |col| (row, col)))
                        .filter_map(|(row, col)| {
                            let cell = MultiPolygon::new(vec![grid.cell_rect(row, col).to_polygon()]);
                            let covered = polygons.intersection(&cell).unsigned_area() / cell_area;
                            (covered > MIN_COVERAGE).then(|| (row * grid.n_cols + col, covered.min(1.0)))
                        })
                        .collect::<Vec<_>>(),
                    None => vec![],
                },
                None => vec![],
            };
            pb.inc(1);
            Ok((name.clone(), cells))
        })
        .collect::<Result<Vec<_>>>()?;
    pb.finish_and_clear();

    let mut weights = WeightGrid::new(grid.n_rows, grid.n_cols);
    for (name, cells) in name_and_cells {
        weights.zones.entry(name).or_default().extend(cells);
    }
    debug!(zones = weights.zones.len(), "built weight grid");

    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{prepare_geometry, GeometryInput};

    fn zones(wkt: &[(&str, &str)]) -> GeometryTable {
        let pairs = wkt
            .iter()
            .map(|(id, text)| (id.to_string(), text.to_string()))
            .collect();
        prepare_geometry(GeometryInput::Wkt(pairs), None).unwrap()
    }

    fn fraction(weights: &WeightGrid, zone: &str, cell: usize) -> f64 {
        weights.zones[zone]
            .iter()
            .find(|(c, _)| *c == cell)
            .map(|(_, f)| *f)
            .unwrap_or(0.0)
    }

    #[test]
    fn test_partial_coverage() {
        let grid = Grid::new(0.0, 2.0, 0.0, 2.0, 3, 3);
        let zones = zones(&[("A", "POLYGON((0 0,1.5 0,1.5 1.5,0 1.5,0 0))")]);

        let weights = coverage_weights(&grid, &zones, "ID", false).unwrap();

        assert_eq!(weights.shape(), (3, 3));
        assert_eq!(weights.zones["A"].len(), 4);
        assert!((fraction(&weights, "A", 0) - 1.0).abs() < 1e-9);
        assert!((fraction(&weights, "A", 1) - 0.5).abs() < 1e-9);
        assert!((fraction(&weights, "A", 3) - 0.5).abs() < 1e-9);
        assert!((fraction(&weights, "A", 4) - 0.25).abs() < 1e-9);
        assert_eq!(fraction(&weights, "A", 2), 0.0);
    }

    #[test]
    fn test_small_polygon() {
        let grid = Grid::new(0.0, 2.0, 0.0, 2.0, 3, 3);
        let zones = zones(&[("A", "POLYGON((1.25 1.25,1.75 1.25,1.75 1.75,1.25 1.75,1.25 1.25))")]);

        let weights = coverage_weights(&grid, &zones, "ID", false).unwrap();

        assert_eq!(weights.zones["A"].len(), 1);
        assert!((fraction(&weights, "A", 4) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_not_intersecting() {
        let grid = Grid::new(0.0, 2.0, 0.0, 2.0, 3, 3);
        let zones = zones(&[("A", "POLYGON((5 5,6 5,6 6,5 6,5 5))")]);

        let weights = coverage_weights(&grid, &zones, "ID", false).unwrap();
        assert!(weights.zones["A"].is_empty());
    }

    #[test]
    fn test_rejects_non_polygons() {
        let grid = Grid::new(0.0, 2.0, 0.0, 2.0, 3, 3);
        let zones = zones(&[("A", "POINT(1 1)")]);

        assert!(coverage_weights(&grid, &zones, "ID", false).is_err());
    }

    #[test]
    fn test_to_table() {
        let grid = Grid::new(0.0, 2.0, 0.0, 2.0, 3, 3);
        let zones = zones(&[
            ("A", "POLYGON((0 0,1 0,1 1,0 1,0 0))"),
            ("B", "POLYGON((2 2,3 2,3 3,2 3,2 2))"),
        ]);
        let weights = coverage_weights(&grid, &zones, "ID", false).unwrap();

        let table = weights.to_table("ID").unwrap();
        assert_eq!(table.get_column_names_str(), &["ID", "cell", "coverage_fraction"]);
        assert_eq!(table.height(), 2);
        assert_eq!(table.column("cell").unwrap().u64().unwrap().get(1), Some(8));
        assert_eq!(weights.cell_position(8), (2, 2));
    }

    #[test]
    fn test_validate_cell_range() {
        let mut weights = WeightGrid::new(3, 3);
        weights.zones.insert("A".into(), vec![(0, 1.0), (8, 0.5)]);
        assert!(weights.validate().is_ok());

        weights.zones.insert("B".into(), vec![(9, 1.0)]);
        assert!(matches!(weights.validate(), Err(ZonalError::InvalidInput(_))));
    }
}
