use std::path::{Path, PathBuf};

use ndarray::{ArrayD, Axis, IxDyn, Slice};

use crate::{BackendError, Grid, Result, ZonalError};

/// A gridded dataset: `(rows, cols)` or `(layers, rows, cols)` values on a [`Grid`].
#[derive(Debug, Clone)]
pub struct Raster {
    pub data: ArrayD<f32>,
    pub grid: Grid,
    /// Optional label per layer, used to name result columns.
    pub layer_names: Option<Vec<String>>,
}

impl Raster {
    /// Build a raster, checking that the trailing two axes match the grid.
    pub fn new(data: ArrayD<f32>, grid: Grid) -> Result<Self> {
        let shape = data.shape();
        let spatial = match shape.len() {
            2 => (shape[0], shape[1]),
            3 => (shape[1], shape[2]),
            n => {
                return Err(ZonalError::InvalidInput(format!(
                    "raster must have 2 or 3 dimensions, got {n}"
                )))
            }
        };
        if spatial != grid.shape() {
            return Err(ZonalError::InvalidInput(format!(
                "raster shape {:?} does not match grid shape {:?}",
                spatial,
                grid.shape()
            )));
        }
        Ok(Self {
            data,
            grid,
            layer_names: None,
        })
    }

    pub fn with_layer_names(mut self, names: Vec<String>) -> Self {
        self.layer_names = Some(names);
        self
    }

    /// Extent of the leading dimension: layers for a cube, rows for a plane.
    pub fn leading_dim(&self) -> usize {
        self.data.shape().first().copied().unwrap_or(0)
    }

    pub fn n_layers(&self) -> usize {
        if self.data.ndim() == 3 {
            self.data.shape()[0]
        } else {
            1
        }
    }

    /// Value at `(layer, row, col)`; `layer` is ignored for 2-D rasters.
    pub fn value(&self, layer: usize, row: usize, col: usize) -> f32 {
        if self.data.ndim() == 3 {
            self.data[IxDyn(&[layer, row, col])]
        } else {
            self.data[IxDyn(&[row, col])]
        }
    }

    /// Column suffix for a layer, empty for single-layer rasters.
    pub(crate) fn layer_label(&self, layer: usize) -> Option<String> {
        if self.n_layers() <= 1 {
            return None;
        }
        let label = self
            .layer_names
            .as_ref()
            .and_then(|names| names.get(layer).cloned())
            .unwrap_or_else(|| (layer + 1).to_string());
        Some(label)
    }
}

/// Subregion over the two trailing (spatial) axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub row_off: usize,
    pub col_off: usize,
    pub rows: usize,
    pub cols: usize,
}

/// A raster given either in memory or as a reference to be materialized.
#[derive(Debug, Clone)]
pub enum RasterInput {
    InMemory(Raster),
    File(PathBuf),
}

impl From<Raster> for RasterInput {
    fn from(raster: Raster) -> Self {
        RasterInput::InMemory(raster)
    }
}

impl From<PathBuf> for RasterInput {
    fn from(path: PathBuf) -> Self {
        RasterInput::File(path)
    }
}

/// Materializes file references into in-memory rasters.
pub trait RasterReader {
    fn read(&self, path: &Path) -> std::result::Result<Raster, BackendError>;
}

impl RasterInput {
    /// Turn the input into an in-memory raster, reading it through `reader`
    /// when it is a file reference.
    pub fn materialize(&self, reader: Option<&dyn RasterReader>) -> Result<Raster> {
        match self {
            RasterInput::InMemory(raster) => Ok(raster.clone()),
            RasterInput::File(path) => match reader {
                Some(reader) => Ok(reader.read(path)?),
                None => Err(ZonalError::InvalidInput(format!(
                    "no raster reader configured to resolve {}",
                    path.display()
                ))),
            },
        }
    }
}

/// Normalize an input raster: cut it to `window`, then pick the layer at
/// `subdataset_index` when it is non-zero.
///
/// # Example
///
/// ```
/// use ndarray::Array3;
/// use zonal_aggregation::{prepare_raster, Grid, Raster, RasterInput, Window};
///
/// let grid = Grid::new(0.0, 3.0, 0.0, 3.0, 4, 4);
/// let raster = Raster::new(Array3::<f32>::zeros((3, 4, 4)).into_dyn(), grid).unwrap();
/// let window = Window { row_off: 1, col_off: 1, rows: 2, cols: 2 };
///
/// let prepared = prepare_raster(&RasterInput::from(raster), 2, Some(window), None).unwrap();
/// assert_eq!(prepared.data.shape(), &[2, 2]);
/// assert_eq!(prepared.grid.min_lat, 1.0);
/// ```
pub fn prepare_raster(
    data: &RasterInput,
    subdataset_index: usize,
    window: Option<Window>,
    reader: Option<&dyn RasterReader>,
) -> Result<Raster> {
    let mut raster = data.materialize(reader)?;

    if let Some(window) = window {
        raster = apply_window(raster, window)?;
    }

    if subdataset_index != 0 {
        if raster.data.ndim() != 3 {
            return Err(ZonalError::InvalidInput(format!(
                "subdataset {subdataset_index} requested on a single layer raster"
            )));
        }
        let n_layers = raster.data.shape()[0];
        if subdataset_index >= n_layers {
            return Err(ZonalError::InvalidInput(format!(
                "subdataset {subdataset_index} out of range, raster has {n_layers} layers"
            )));
        }
        let layer_name = raster
            .layer_names
            .as_ref()
            .and_then(|names| names.get(subdataset_index).cloned());
        raster.data = raster.data.index_axis(Axis(0), subdataset_index).to_owned();
        raster.layer_names = layer_name.map(|name| vec![name]);
    }

    Ok(raster)
}

fn apply_window(raster: Raster, window: Window) -> Result<Raster> {
    let grid = &raster.grid;
    if window.rows == 0
        || window.cols == 0
        || window.row_off + window.rows > grid.n_rows
        || window.col_off + window.cols > grid.n_cols
    {
        return Err(ZonalError::InvalidInput(format!(
            "window {:?} does not fit a {}x{} raster",
            window, grid.n_rows, grid.n_cols
        )));
    }

    let ndim = raster.data.ndim();
    let (row_axis, col_axis) = (Axis(ndim - 2), Axis(ndim - 1));
    let data = raster
        .data
        .slice_axis(
            row_axis,
            Slice::from(window.row_off..window.row_off + window.rows),
        )
        .slice_axis(
            col_axis,
            Slice::from(window.col_off..window.col_off + window.cols),
        )
        .to_owned();

    let grid = Grid::from_origin(
        grid.min_lat + window.row_off as f64 * grid.lat_step,
        grid.min_lon + window.col_off as f64 * grid.lon_step,
        grid.lat_step,
        grid.lon_step,
        window.rows,
        window.cols,
    );

    Ok(Raster {
        data,
        grid,
        layer_names: raster.layer_names,
    })
}
