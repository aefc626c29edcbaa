use std::collections::HashMap;

use geo::algorithm::{BoundingRect, Intersects};
use geo_rasterize::BinaryBuilder;
use geo_types::Point;
use polars::prelude::DataFrame;
use rayon::prelude::*;
use tracing::debug;

use crate::aggregate::zone_stats_table;
use crate::{
    prepare_raster, zone_progress, BackendError, BackendOptions, GeometryTable, Grid, Raster,
    RasterInput, Result, StatsFunctionType, ZonalError,
};

pub type IntersectionMap = HashMap<String, Vec<(usize, usize)>>;

/// Computes zonal statistics for a raster without a precomputed weight grid.
///
/// Implementations typically forward the work to an external service; the
/// orchestrator only picks this path for rasters small enough to ship.
pub trait RemoteZonalEngine {
    #[allow(clippy::too_many_arguments)]
    fn compute(
        &self,
        raster: &Raster,
        geometry: &GeometryTable,
        id_field: &str,
        stats_functions: &[StatsFunctionType],
        subdataset_index: usize,
        show_progress: bool,
        join_geometry: bool,
        options: &BackendOptions,
    ) -> std::result::Result<DataFrame, BackendError>;
}

/// In-process engine used when no remote service is configured.
///
/// Every cell whose centre falls inside a zone counts with weight 1, so no
/// coverage fractions have to be computed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CellCenterEngine;

impl RemoteZonalEngine for CellCenterEngine {
    fn compute(
        &self,
        raster: &Raster,
        geometry: &GeometryTable,
        id_field: &str,
        stats_functions: &[StatsFunctionType],
        subdataset_index: usize,
        show_progress: bool,
        join_geometry: bool,
        _options: &BackendOptions,
    ) -> std::result::Result<DataFrame, BackendError> {
        let raster = prepare_raster(&RasterInput::InMemory(raster.clone()), subdataset_index, None, None)?;
        let intersections = get_intersections(&raster.grid, geometry, id_field, show_progress)?;

        let mut names: Vec<_> = intersections.keys().cloned().collect();
        names.sort();
        let zones = names
            .into_iter()
            .map(|name| {
                let cells = intersections[&name].iter().map(|rc| (*rc, 1.0)).collect();
                (name, cells)
            })
            .collect::<Vec<_>>();

        debug!(zones = zones.len(), "aggregating on cell centres");
        let table = zone_stats_table(&raster, &zones, id_field, stats_functions)?;
        if join_geometry {
            return Ok(geometry.join(&table, id_field)?);
        }
        Ok(table)
    }
}

/// Get the cells of the grid whose centre falls inside each zone.
///
/// A centre lying on the zone boundary counts as inside.
///
/// # Arguments
///
/// * `grid` - The grid
/// * `geometry` - The zones
/// * `id_field` - Column holding the zone identifier
/// * `show_progress` - Display a progress bar while rasterizing
///
/// # Returns
///
/// A `Result` containing the intersection map or an error.
///
/// # Example
///
/// ```
/// use zonal_aggregation::{get_intersections, prepare_geometry, GeomRecord, Grid};
/// use geo_types::{Coord, Geometry, LineString, Polygon};
///
/// // 1) Create a grid that covers lat from 0..2 and lon from 0..2, step=1.
/// // => 3 rows x 3 columns
/// let grid = Grid::new(0.0, 2.0, 0.0, 2.0, 3, 3);
///
/// // 2) Create a polygon over lat/lon in [0.0..1.5, 0.0..1.5].
/// let polygon_coords = vec![
///     Coord { x: 0.0, y: 0.0 },
///     Coord { x: 1.5, y: 0.0 },
///     Coord { x: 1.5, y: 1.5 },
///     Coord { x: 0.0, y: 1.5 },
///     Coord { x: 0.0, y: 0.0 },
///  ];
///  let polygon = Polygon::new(LineString::from(polygon_coords), vec![]);
///
///  let record = GeomRecord {
///     geometry: Geometry::Polygon(polygon),
///     name: "TestFeature".to_string(),
///  };
///  let zones = prepare_geometry(vec![record].into(), None).unwrap();
///
///  let intersections = get_intersections(&grid, &zones, "ID", false).unwrap();
///
///  let coords = intersections.get("TestFeature").unwrap();
///  assert!(coords.contains(&(0, 0)));
///  assert!(!coords.contains(&(2, 2)));
/// ```
pub fn get_intersections(
    grid: &Grid,
    geometry: &GeometryTable,
    id_field: &str,
    show_progress: bool,
) -> Result<IntersectionMap> {
    let zones = geometry.zones(id_field)?;
    let geo_to_pix = grid
        .get_transform()
        .inverse()
        .ok_or_else(|| ZonalError::InvalidInput("Could not get inverse transform".into()))?;

    let pb = zone_progress(zones.len(), show_progress, "rasterizing");

    let name_and_coords = zones
        .par_iter()
        .map(|(name, geometry)| {
            let range = match geometry.bounding_rect() {
                Some(bbox) => grid.pixel_range(bbox)?,
                None => None,
            };
            let Some((min_row, max_row, min_col, max_col)) = range else {
                pb.inc(1);
                return Ok((name.clone(), vec![]));
            };

            let mut builder = BinaryBuilder::new()
                .width(grid.n_cols)
                .height(grid.n_rows)
                .geo_to_pix(geo_to_pix)
                .build()
                .map_err(|e| ZonalError::InvalidInput(format!("Could not create rasterizer: {e}")))?;

            builder
                .rasterize(*geometry)
                .map_err(|e| ZonalError::InvalidInput(format!("Could not rasterize zone {name}: {e}")))?;
            let pixels = builder.finish();

            // the rasterizer marks every touched pixel, keep the centred ones
            let coords = (min_row..=max_row)
                .flat_map(|row| (min_col..=max_col).map(move |col| (row, col)))
                .filter(|(row, col)| pixels[[*row, *col]])
                .filter(|(row, col)| {
                    let centre = Point::from(grid.cell_rect(*row, *col).center());
                    geometry.intersects(&centre)
                })
                .collect::<Vec<_>>();

            pb.inc(1);
            Ok((name.clone(), coords))
        })
        .collect::<Result<Vec<_>>>()?;
    pb.finish_and_clear();

    let mut intersections: IntersectionMap = HashMap::new();
    for (name, coords) in name_and_coords {
        intersections.entry(name).or_default().extend(coords);
    }

    Ok(intersections)
}
