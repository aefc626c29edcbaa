//! Zonal statistics over gridded rasters.
//!
//! The entry point is [`ZonalOrchestrator`] (or the [`execute_zonal`] shortcut),
//! which normalizes rasters and zone geometries, picks a computation backend
//! per call and returns one result table per raster.
//!
//! The heavy lifting is delegated to three collaborators:
//! * a [`WeightGridBuilder`] computing per-zone cell coverage fractions,
//! * a [`WeightedAggregator`] reducing raster values with those weights,
//! * a [`RemoteZonalEngine`] used for small rasters, where building a weight
//!   grid is not worth it.

mod aggregate;
mod engine;
mod error;
mod geometry;
mod raster;
mod weights;
mod zonal;

use euclid::Box2D;
use geo::Rect;
use geo_rasterize::Transform;
use indicatif::{ProgressBar, ProgressStyle};
use kolmogorov_smirnov::percentile;
use ndarray::Array1;
use noisy_float::types::N32;
use strum_macros::{Display, EnumString};

pub use aggregate::{CoverageAggregator, WeightedAggregator, MIN_COVERAGE_OPTION};
pub use engine::{get_intersections, CellCenterEngine, IntersectionMap, RemoteZonalEngine};
pub use error::{BackendError, Result, ZonalError};
pub use geometry::{prepare_geometry, GeomRecord, GeometryInput, GeometryTable, GEOMETRY_COLUMN};
pub use raster::{prepare_raster, Raster, RasterInput, RasterReader, Window};
pub use weights::{coverage_weights, CoverageWeightBuilder, WeightGrid, WeightGridBuilder};
pub use zonal::{
    execute_zonal, sanitize, BackendOptions, RasterData, ZonalOptions, ZonalOrchestrator,
    ZonalOutput, ZonalRequest, DEFAULT_REMOTE_THRESHOLD, TRANSIENT_COLUMNS,
};

/// Values equal to this are treated as missing.
pub const NODATA: f32 = -9999.0;

/// Default name of the zone identifier column.
pub const DEFAULT_ID_FIELD: &str = "ID";

pub type StatFunction = Box<dyn Fn(&Array1<N32>, &Array1<f32>) -> f32>;

/// Enum to represent the type of statistics function to be applied
/// to the values of a zone.
#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
#[derive(Debug, PartialEq, Eq, Hash, Copy, Clone, EnumString, Display)]
#[strum(ascii_case_insensitive)]
pub enum StatsFunctionType {
    MIN,
    MAX,
    MEAN,
    SUM,
    COUNT,
    PERC50,
    PERC75,
    PERC90,
    PERC95,
    PERC99,
    IPERC50,
    IPERC25,
    IPERC10,
    IPERC5,
    IPERC1,
}

/// Get the appropriate statistic function based on the type.
///
/// Every function receives the zone values together with their weights
/// (the coverage fraction of the cell each value comes from). `MEAN`, `SUM`
/// and `COUNT` honour the weights, the other statistics only look at the values.
///
/// # Example
///
/// ```
/// use zonal_aggregation::get_stat_function;
/// use zonal_aggregation::StatsFunctionType;
/// use noisy_float::types::N32;
///
/// let stat_fn = get_stat_function(&StatsFunctionType::MIN);
///
/// let data: ndarray::Array1<N32> = ndarray::Array1::from_vec(vec![1.0, 2.0, 3.0]).mapv(N32::from_f32);
/// let weights = ndarray::Array1::from_elem(3, 1.0f32);
/// let min_val = stat_fn(&data, &weights);
/// assert_eq!(min_val, 1.0);
/// ```
pub fn get_stat_function(stat: &StatsFunctionType) -> StatFunction {
    match stat {
        StatsFunctionType::MIN => Box::new(|arr: &Array1<N32>, _: &Array1<f32>| min(arr)),
        StatsFunctionType::MAX => Box::new(|arr: &Array1<N32>, _: &Array1<f32>| max(arr)),
        StatsFunctionType::MEAN => Box::new(weighted_mean),
        StatsFunctionType::SUM => Box::new(weighted_sum),
        StatsFunctionType::COUNT => Box::new(|_: &Array1<N32>, weights: &Array1<f32>| weights.sum()),
        StatsFunctionType::PERC50 => Box::new(|arr: &Array1<N32>, _: &Array1<f32>| mean_of_values_above_percentile(arr, 50)),
        StatsFunctionType::PERC75 => Box::new(|arr: &Array1<N32>, _: &Array1<f32>| mean_of_values_above_percentile(arr, 75)),
        StatsFunctionType::PERC90 => Box::new(|arr: &Array1<N32>, _: &Array1<f32>| mean_of_values_above_percentile(arr, 90)),
        StatsFunctionType::PERC95 => Box::new(|arr: &Array1<N32>, _: &Array1<f32>| mean_of_values_above_percentile(arr, 95)),
        StatsFunctionType::PERC99 => Box::new(|arr: &Array1<N32>, _: &Array1<f32>| mean_of_values_above_percentile(arr, 99)),
        StatsFunctionType::IPERC50 => Box::new(|arr: &Array1<N32>, _: &Array1<f32>| mean_of_values_below_percentile(arr, 50)),
        StatsFunctionType::IPERC25 => Box::new(|arr: &Array1<N32>, _: &Array1<f32>| mean_of_values_below_percentile(arr, 25)),
        StatsFunctionType::IPERC10 => Box::new(|arr: &Array1<N32>, _: &Array1<f32>| mean_of_values_below_percentile(arr, 10)),
        StatsFunctionType::IPERC5 => Box::new(|arr: &Array1<N32>, _: &Array1<f32>| mean_of_values_below_percentile(arr, 5)),
        StatsFunctionType::IPERC1 => Box::new(|arr: &Array1<N32>, _: &Array1<f32>| mean_of_values_below_percentile(arr, 1)),
    }
}

/// A struct to hold the grid information.
///
/// Cell `(row, col)` spans `lon_step` x `lat_step` degrees starting at
/// `(min_lon + col * lon_step, min_lat + row * lat_step)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    /// The minimum latitude
    pub min_lat: f64,
    /// The maximum latitude
    pub max_lat: f64,
    /// The minimum longitude
    pub min_lon: f64,
    /// The maximum longitude
    pub max_lon: f64,
    /// The latitude step
    pub lat_step: f64,
    /// The longitude step
    pub lon_step: f64,
    /// The number of rows
    pub n_rows: usize,
    /// The number of columns
    pub n_cols: usize,
}

impl Grid {
    /// Create a new grid with the given parameters.
    ///
    /// The steps are derived from the extent, so both `n_rows` and `n_cols`
    /// must be at least 2. Use [`Grid::from_origin`] for single row or single
    /// column grids.
    ///
    /// # Arguments
    ///
    /// * `min_lat` - The minimum latitude
    /// * `max_lat` - The maximum latitude
    /// * `min_lon` - The minimum longitude
    /// * `max_lon` - The maximum longitude
    /// * `n_rows` - Number of rows
    /// * `n_cols` - Number of columns
    pub fn new(
        min_lat: f64,
        max_lat: f64,
        min_lon: f64,
        max_lon: f64,
        n_rows: usize,
        n_cols: usize,
    ) -> Self {
        debug_assert!(n_rows >= 2 && n_cols >= 2, "grid of {n_rows}x{n_cols} has no step");
        let lat_step = (max_lat - min_lat) / (n_rows - 1) as f64;
        let lon_step = (max_lon - min_lon) / (n_cols - 1) as f64;
        Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
            lat_step,
            lon_step,
            n_rows,
            n_cols,
        }
    }

    /// Create a grid from its origin and cell size.
    pub fn from_origin(
        min_lat: f64,
        min_lon: f64,
        lat_step: f64,
        lon_step: f64,
        n_rows: usize,
        n_cols: usize,
    ) -> Self {
        Self {
            min_lat,
            max_lat: min_lat + lat_step * n_rows.saturating_sub(1) as f64,
            min_lon,
            max_lon: min_lon + lon_step * n_cols.saturating_sub(1) as f64,
            lat_step,
            lon_step,
            n_rows,
            n_cols,
        }
    }

    /// `(n_rows, n_cols)`
    pub fn shape(&self) -> (usize, usize) {
        (self.n_rows, self.n_cols)
    }

    /// Get the transform matrix for the grid.
    ///
    /// # Returns
    ///
    /// A `Transform` object that represents the transform matrix between coordinates space and pixel space.
    ///
    pub fn get_transform(&self) -> Transform {
        Transform::new(
            self.lon_step,
            0.0,
            0.0,
            self.lat_step,
            self.min_lon,
            self.min_lat,
        )
    }

    /// Footprint of a cell in coordinate space.
    pub fn cell_rect(&self, row: usize, col: usize) -> Rect<f64> {
        let x0 = self.min_lon + col as f64 * self.lon_step;
        let y0 = self.min_lat + row as f64 * self.lat_step;
        Rect::new(
            geo::coord! { x: x0, y: y0 },
            geo::coord! { x: x0 + self.lon_step, y: y0 + self.lat_step },
        )
    }

    /// Inclusive `(min_row, max_row, min_col, max_col)` range of cells touched by
    /// `bbox`, or `None` when the box lies outside the grid.
    pub(crate) fn pixel_range(&self, bbox: Rect<f64>) -> Result<Option<(usize, usize, usize, usize)>> {
        let geo_to_pix = self
            .get_transform()
            .inverse()
            .ok_or_else(|| ZonalError::InvalidInput("grid transform is not invertible".into()))?;

        let bbox = Box2D::new(
            euclid::point2(bbox.min().x, bbox.min().y),
            euclid::point2(bbox.max().x, bbox.max().y),
        );
        // get bounding box in raster coordinates
        let bbox_pixel_space = geo_to_pix.outer_transformed_box(&bbox);

        let min_col = f64::floor(bbox_pixel_space.min.x);
        let max_col = f64::ceil(bbox_pixel_space.max.x);
        let min_row = f64::floor(bbox_pixel_space.min.y);
        let max_row = f64::ceil(bbox_pixel_space.max.y);

        let (n_rows, n_cols) = (self.n_rows as f64, self.n_cols as f64);
        if n_rows == 0.0 || n_cols == 0.0 || max_col < 0.0 || max_row < 0.0 || min_col >= n_cols || min_row >= n_rows {
            return Ok(None);
        }

        let clamp_to = |v: f64, n: usize| (v.max(0.0) as usize).min(n - 1);
        Ok(Some((
            clamp_to(min_row, self.n_rows),
            clamp_to(max_row, self.n_rows),
            clamp_to(min_col, self.n_cols),
            clamp_to(max_col, self.n_cols),
        )))
    }
}

/// Progress bar ticking once per zone, hidden unless `show` is set.
pub(crate) fn zone_progress(len: usize, show: bool, msg: &str) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar().template("{msg} [{bar:40.cyan/blue}] {pos}/{len}") {
        pb.set_style(style);
    }
    pb.set_message(msg.to_string());
    pb
}

pub fn max(arr: &Array1<N32>) -> f32 {
    if arr.is_empty() {
        return f32::NAN;
    }

    let maybe_max = arr.iter().max();
    if let Some(max) = maybe_max {
        (*max).into()
    } else {
        f32::NAN
    }
}

pub fn min(arr: &Array1<N32>) -> f32 {
    if arr.is_empty() {
        return f32::NAN;
    }

    let maybe_min = arr.iter().min();
    if let Some(min) = maybe_min {
        (*min).into()
    } else {
        f32::NAN
    }
}

/// Coverage-weighted mean. NaN when there is nothing to average.
pub fn weighted_mean(arr: &Array1<N32>, weights: &Array1<f32>) -> f32 {
    let total_weight: f32 = weights.sum();
    if arr.is_empty() || total_weight <= 0.0 {
        return f32::NAN;
    }
    weighted_sum(arr, weights) / total_weight
}

pub fn weighted_sum(arr: &Array1<N32>, weights: &Array1<f32>) -> f32 {
    arr.iter()
        .zip(weights.iter())
        .map(|(v, w)| f32::from(*v) * w)
        .sum()
}

pub fn mean_of_values_above_percentile(arr: &Array1<N32>, the_percentile: u8) -> f32 {
    if arr.is_empty() {
        return f32::NAN;
    }

    let slice = arr.to_vec();
    let perc_value = percentile(&slice, the_percentile);

    let over_threshold = arr
        .iter()
        .filter(|&x| *x >= perc_value)
        .copied()
        .collect::<Array1<N32>>();

    if over_threshold.is_empty() {
        return f32::NAN;
    }
    let maybe_mean = over_threshold.mean();
    if let Some(mean) = maybe_mean {
        mean.into()
    } else {
        f32::NAN
    }
}

pub fn mean_of_values_below_percentile(arr: &Array1<N32>, the_percentile: u8) -> f32 {
    if arr.is_empty() {
        return f32::NAN;
    }

    let slice = arr.to_vec();
    let perc_value = percentile(&slice, the_percentile);

    let below_threshold = arr
        .iter()
        .filter(|&x| *x < perc_value)
        .copied()
        .collect::<Array1<N32>>();

    if below_threshold.is_empty() {
        return f32::NAN;
    }
    let maybe_mean = below_threshold.mean();
    if let Some(mean) = maybe_mean {
        mean.into()
    } else {
        f32::NAN
    }
}
