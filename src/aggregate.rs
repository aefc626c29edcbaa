use ndarray::Array1;
use noisy_float::types::N32;
use polars::prelude::*;
use rayon::prelude::*;
use tracing::debug;

use crate::{
    get_stat_function, BackendError, BackendOptions, Raster, Result, StatsFunctionType,
    WeightGrid, ZonalError, NODATA,
};

/// Option key: cells covered less than this fraction are ignored.
///
/// ```
/// use zonal_aggregation::{BackendOptions, ZonalOptions, MIN_COVERAGE_OPTION};
///
/// let options = ZonalOptions {
///     backend_options: BackendOptions::from([(MIN_COVERAGE_OPTION.to_string(), "0.5".to_string())]),
///     ..ZonalOptions::default()
/// };
/// assert_eq!(options.backend_options["min_coverage"], "0.5");
/// ```
pub const MIN_COVERAGE_OPTION: &str = "min_coverage";

/// Reduces a raster to one row of statistics per zone of a weight grid.
pub trait WeightedAggregator {
    fn aggregate(
        &self,
        raster: &Raster,
        weights: &WeightGrid,
        id_field: &str,
        stats_functions: &[StatsFunctionType],
        options: &BackendOptions,
    ) -> std::result::Result<DataFrame, BackendError>;
}

/// Coverage-weighted aggregation, see [`get_stat_function`] for how weights
/// enter each statistic.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoverageAggregator;

impl WeightedAggregator for CoverageAggregator {
    fn aggregate(
        &self,
        raster: &Raster,
        weights: &WeightGrid,
        id_field: &str,
        stats_functions: &[StatsFunctionType],
        options: &BackendOptions,
    ) -> std::result::Result<DataFrame, BackendError> {
        if raster.grid.shape() != weights.shape() {
            return Err(ZonalError::ShapeMismatch {
                rows: raster.grid.n_rows,
                cols: raster.grid.n_cols,
                weight_rows: weights.n_rows,
                weight_cols: weights.n_cols,
            }
            .into());
        }
        weights.validate()?;

        let min_coverage = match options.get(MIN_COVERAGE_OPTION) {
            Some(v) => v.parse::<f64>().map_err(|e| {
                ZonalError::InvalidInput(format!("{MIN_COVERAGE_OPTION}={v}: {e}"))
            })?,
            None => 0.0,
        };

        let zones = weights
            .zones
            .iter()
            .map(|(name, cells)| {
                let cells = cells
                    .iter()
                    .filter(|(_, fraction)| *fraction >= min_coverage)
                    .map(|(cell, fraction)| (weights.cell_position(*cell), *fraction as f32))
                    .collect();
                (name.clone(), cells)
            })
            .collect::<Vec<_>>();

        debug!(zones = zones.len(), layers = raster.n_layers(), "aggregating with weights");
        Ok(zone_stats_table(raster, &zones, id_field, stats_functions)?)
    }
}

/// Cells of a zone: `((row, col), weight)`.
pub(crate) type ZoneCells = Vec<((usize, usize), f32)>;

/// Values and weights of the valid cells of a zone in one layer.
fn zone_values(raster: &Raster, layer: usize, cells: &ZoneCells) -> (Array1<N32>, Array1<f32>) {
    let (values, weights): (Vec<N32>, Vec<f32>) = cells
        .iter()
        .map(|((row, col), weight)| (raster.value(layer, *row, *col), *weight))
        .filter(|(x, _)| *x != NODATA && !x.is_nan())
        .map(|(x, weight)| (N32::from_f32(x), weight))
        .unzip();
    (Array1::from_vec(values), Array1::from_vec(weights))
}

/// Build the result table: `id_field` followed by one column per statistic
/// (and per layer, for multi-layer rasters).
pub(crate) fn zone_stats_table(
    raster: &Raster,
    zones: &[(String, ZoneCells)],
    id_field: &str,
    stats_functions: &[StatsFunctionType],
) -> Result<DataFrame> {
    let n_layers = raster.n_layers();

    let mut columns = vec![];
    for stat in stats_functions {
        for layer in 0..n_layers {
            match raster.layer_label(layer) {
                Some(label) => columns.push(format!("{stat}_{label}")),
                None => columns.push(stat.to_string()),
            }
        }
    }

    let rows: Vec<Vec<f64>> = zones
        .par_iter()
        .map(|(_, cells)| {
            let per_layer: Vec<_> = (0..n_layers)
                .map(|layer| zone_values(raster, layer, cells))
                .collect();

            let mut row = Vec::with_capacity(stats_functions.len() * n_layers);
            for stat_fun_type in stats_functions {
                let stat_fn = get_stat_function(stat_fun_type);
                for (values, weights) in &per_layer {
                    row.push(stat_fn(values, weights) as f64);
                }
            }
            row
        })
        .collect();

    let ids: Vec<&str> = zones.iter().map(|(name, _)| name.as_str()).collect();
    let mut frame_columns = vec![Column::new(id_field.into(), ids)];
    for (i, name) in columns.iter().enumerate() {
        let values: Vec<f64> = rows.iter().map(|row| row[i]).collect();
        frame_columns.push(Column::new(name.as_str().into(), values));
    }
    Ok(DataFrame::new(frame_columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{coverage_weights, prepare_geometry, GeometryInput, Grid};
    use ndarray::{Array3, IxDyn};

    // Dimensions: (time, row, col) = (2, 3, 3)
    //
    // t=0           t=1
    // Row0: 1,2,3   Row0: 10,20,30
    // Row1: 4,5,6   Row1: 40,50,60
    // Row2: 7,8,9   Row2: 70,80,90
    fn create_test_raster() -> Raster {
        let grid = Grid::new(0.0, 2.0, 0.0, 2.0, 3, 3);
        let data = Array3::from_shape_fn((2, 3, 3), |(t, r, c)| {
            ((r * 3 + c + 1) * if t == 0 { 1 } else { 10 }) as f32
        });
        Raster::new(data.into_dyn(), grid).unwrap()
    }

    fn weights_for(wkt: &str) -> WeightGrid {
        let grid = Grid::new(0.0, 2.0, 0.0, 2.0, 3, 3);
        let zones = prepare_geometry(GeometryInput::Wkt(vec![("A".into(), wkt.into())]), None).unwrap();
        coverage_weights(&grid, &zones, "ID", false).unwrap()
    }

    fn float(table: &DataFrame, row: usize, column: &str) -> f64 {
        table.column(column).unwrap().f64().unwrap().get(row).unwrap()
    }

    #[test]
    fn test_aggregate_full_cells() {
        // covers cells (0,0), (0,1), (1,0), (1,1) entirely
        let weights = weights_for("POLYGON((0 0,2 0,2 2,0 2,0 0))");
        let raster = create_test_raster();

        let table = CoverageAggregator
            .aggregate(
                &raster,
                &weights,
                "ID",
                &[StatsFunctionType::MIN, StatsFunctionType::MEAN, StatsFunctionType::MAX],
                &BackendOptions::new(),
            )
            .unwrap();

        assert_eq!(
            table.get_column_names_str(),
            &["ID", "MIN_1", "MIN_2", "MEAN_1", "MEAN_2", "MAX_1", "MAX_2"]
        );
        // t=0 => 1, 2, 4, 5
        assert_eq!(float(&table, 0, "MIN_1"), 1.0);
        assert_eq!(float(&table, 0, "MAX_1"), 5.0);
        assert!((float(&table, 0, "MEAN_1") - 3.0).abs() < 1e-6);
        // t=1 => 10, 20, 40, 50
        assert_eq!(float(&table, 0, "MIN_2"), 10.0);
        assert_eq!(float(&table, 0, "MAX_2"), 50.0);
        assert!((float(&table, 0, "MEAN_2") - 30.0).abs() < 1e-5);
    }

    #[test]
    fn test_aggregate_weighted_mean() {
        // (0,0) fully, (0,1) half covered => (1*1 + 2*0.5) / 1.5
        let weights = weights_for("POLYGON((0 0,1.5 0,1.5 1,0 1,0 0))");
        let raster = create_test_raster().with_layer_names(vec!["a".into(), "b".into()]);

        let table = CoverageAggregator
            .aggregate(
                &raster,
                &weights,
                "ID",
                &[StatsFunctionType::MEAN, StatsFunctionType::COUNT],
                &BackendOptions::new(),
            )
            .unwrap();

        assert!((float(&table, 0, "MEAN_a") - 2.0 / 1.5).abs() < 1e-5);
        assert!((float(&table, 0, "COUNT_b") - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_aggregate_min_coverage_option() {
        let weights = weights_for("POLYGON((0 0,1.5 0,1.5 1,0 1,0 0))");
        let raster = create_test_raster();
        let options = BackendOptions::from([(MIN_COVERAGE_OPTION.to_string(), "0.9".to_string())]);

        let table = CoverageAggregator
            .aggregate(&raster, &weights, "ID", &[StatsFunctionType::MAX], &options)
            .unwrap();

        assert_eq!(float(&table, 0, "MAX_1"), 1.0);
    }

    #[test]
    fn test_aggregate_skips_nodata() {
        let weights = weights_for("POLYGON((0 0,2 0,2 1,0 1,0 0))");
        let mut raster = create_test_raster();
        raster.data[IxDyn(&[0, 0, 0])] = NODATA;
        raster.data[IxDyn(&[0, 0, 1])] = f32::NAN;

        let table = CoverageAggregator
            .aggregate(&raster, &weights, "ID", &[StatsFunctionType::MEAN], &BackendOptions::new())
            .unwrap();

        assert!(float(&table, 0, "MEAN_1").is_nan());
        assert!((float(&table, 0, "MEAN_2") - 15.0).abs() < 1e-6);
    }

    #[test]
    fn test_aggregate_shape_mismatch() {
        let weights = WeightGrid::new(4, 4);
        let err = CoverageAggregator
            .aggregate(
                &create_test_raster(),
                &weights,
                "ID",
                &[StatsFunctionType::MEAN],
                &BackendOptions::new(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("does not match weight grid shape"));
    }

    #[test]
    fn test_aggregate_rejects_out_of_range_cells() {
        let mut weights = WeightGrid::new(3, 3);
        weights.zones.insert("A".into(), vec![(4, 1.0), (9, 1.0)]);

        let err = CoverageAggregator
            .aggregate(
                &create_test_raster(),
                &weights,
                "ID",
                &[StatsFunctionType::MEAN],
                &BackendOptions::new(),
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ZonalError>(),
            Some(ZonalError::InvalidInput(_))
        ));
    }
}
