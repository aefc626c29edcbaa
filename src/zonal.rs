use std::collections::{BTreeMap, BTreeSet};

use polars::prelude::DataFrame;
use tracing::debug;

use crate::{
    prepare_geometry, prepare_raster, CellCenterEngine, CoverageAggregator, CoverageWeightBuilder,
    GeometryInput, GeometryTable, Raster, RasterInput, RasterReader, RemoteZonalEngine, Result,
    StatsFunctionType, WeightGrid, WeightGridBuilder, WeightedAggregator, ZonalError,
};

/// Rasters whose leading dimension is at most this are sent to the remote engine.
pub const DEFAULT_REMOTE_THRESHOLD: usize = 5;

/// Bookkeeping columns that backends may leave in their output.
pub const TRANSIENT_COLUMNS: [&str; 2] = ["cell", "coverage_fraction"];

/// Extra options forwarded verbatim to the backends.
pub type BackendOptions = BTreeMap<String, String>;

/// One raster or a batch of rasters sharing the same grid.
#[derive(Debug, Clone)]
pub enum RasterData {
    One(RasterInput),
    Many(Vec<RasterInput>),
}

impl RasterData {
    fn into_inputs(self) -> Vec<RasterInput> {
        match self {
            RasterData::One(input) => vec![input],
            RasterData::Many(inputs) => inputs,
        }
    }
}

impl From<RasterInput> for RasterData {
    fn from(input: RasterInput) -> Self {
        RasterData::One(input)
    }
}

impl From<Raster> for RasterData {
    fn from(raster: Raster) -> Self {
        RasterData::One(RasterInput::InMemory(raster))
    }
}

impl From<Vec<RasterInput>> for RasterData {
    fn from(inputs: Vec<RasterInput>) -> Self {
        RasterData::Many(inputs)
    }
}

impl From<Vec<Raster>> for RasterData {
    fn from(rasters: Vec<Raster>) -> Self {
        RasterData::Many(rasters.into_iter().map(RasterInput::InMemory).collect())
    }
}

/// Knobs of a zonal computation.
#[derive(Debug, Clone)]
pub struct ZonalOptions {
    pub stats: Vec<StatsFunctionType>,
    /// Layer selected by the remote engine. The local path always aggregates
    /// every layer.
    pub subdataset_index: usize,
    pub show_progress: bool,
    pub join_geometry: bool,
    pub drop_columns: Vec<String>,
    /// Tag attached to the zones, see [`prepare_geometry`].
    pub crs: Option<String>,
    pub backend_options: BackendOptions,
}

impl Default for ZonalOptions {
    fn default() -> Self {
        Self {
            stats: vec![StatsFunctionType::MEAN],
            subdataset_index: 0,
            show_progress: false,
            join_geometry: true,
            drop_columns: vec![],
            crs: None,
            backend_options: BackendOptions::new(),
        }
    }
}

/// Inputs of a zonal computation. Every field may be left unset; missing
/// required inputs are reported by [`ZonalOrchestrator::execute`].
#[derive(Debug, Clone, Default)]
pub struct ZonalRequest {
    pub data: Option<RasterData>,
    pub geometry: Option<GeometryInput>,
    pub weights: Option<WeightGrid>,
    pub id_field: Option<String>,
    pub options: ZonalOptions,
}

impl ZonalRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(mut self, data: impl Into<RasterData>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn geometry(mut self, geometry: impl Into<GeometryInput>) -> Self {
        self.geometry = Some(geometry.into());
        self
    }

    pub fn weights(mut self, weights: WeightGrid) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = Some(id_field.into());
        self
    }

    pub fn options(mut self, options: ZonalOptions) -> Self {
        self.options = options;
        self
    }
}

/// One table for a single raster, one per raster otherwise.
#[derive(Debug, Clone)]
pub enum ZonalOutput {
    Single(DataFrame),
    Many(Vec<DataFrame>),
}

impl ZonalOutput {
    pub fn into_tables(self) -> Vec<DataFrame> {
        match self {
            ZonalOutput::Single(table) => vec![table],
            ZonalOutput::Many(tables) => tables,
        }
    }
}

/// Remove the caller's `drop` columns and the transient bookkeeping columns.
/// Columns that are not present are ignored.
///
/// # Example
///
/// ```
/// use polars::df;
/// use zonal_aggregation::sanitize;
///
/// let table = df!(
///     "ID" => ["A"],
///     "MEAN" => [1.0],
///     "cell" => [4u64],
///     "coverage_fraction" => [0.5],
/// )
/// .unwrap();
/// let table = sanitize(table, &["MEAN", "not_there"]);
/// assert_eq!(table.get_column_names_str(), &["ID"]);
/// ```
pub fn sanitize<S: AsRef<str>>(table: DataFrame, drop: &[S]) -> DataFrame {
    let drop: BTreeSet<&str> = drop
        .iter()
        .map(|c| c.as_ref())
        .chain(TRANSIENT_COLUMNS)
        .filter(|c| table.get_column_index(c).is_some())
        .collect();
    table.drop_many(drop)
}

/// Picks a backend per call and runs it over every raster.
pub struct ZonalOrchestrator {
    weight_builder: Box<dyn WeightGridBuilder>,
    aggregator: Box<dyn WeightedAggregator>,
    remote: Box<dyn RemoteZonalEngine>,
    reader: Option<Box<dyn RasterReader>>,
    remote_threshold: usize,
}

impl Default for ZonalOrchestrator {
    fn default() -> Self {
        Self {
            weight_builder: Box::new(CoverageWeightBuilder),
            aggregator: Box::new(CoverageAggregator),
            remote: Box::new(CellCenterEngine),
            reader: None,
            remote_threshold: DEFAULT_REMOTE_THRESHOLD,
        }
    }
}

impl ZonalOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_weight_builder(mut self, builder: impl WeightGridBuilder + 'static) -> Self {
        self.weight_builder = Box::new(builder);
        self
    }

    pub fn with_aggregator(mut self, aggregator: impl WeightedAggregator + 'static) -> Self {
        self.aggregator = Box::new(aggregator);
        self
    }

    pub fn with_remote_engine(mut self, engine: impl RemoteZonalEngine + 'static) -> Self {
        self.remote = Box::new(engine);
        self
    }

    pub fn with_reader(mut self, reader: impl RasterReader + 'static) -> Self {
        self.reader = Some(Box::new(reader));
        self
    }

    /// Rasters with a leading dimension above `threshold` are aggregated locally.
    pub fn with_remote_threshold(mut self, threshold: usize) -> Self {
        self.remote_threshold = threshold;
        self
    }

    pub fn remote_threshold(&self) -> usize {
        self.remote_threshold
    }

    /// Run a zonal computation.
    ///
    /// Small rasters (leading dimension not above the remote threshold) go to
    /// the remote engine, one call per raster. Otherwise a weight grid is built
    /// once from the first raster, unless one was supplied, and reused for
    /// every raster of the batch. Supplying weights always selects the local path.
    ///
    /// # Errors
    ///
    /// [`ZonalError::MissingArgument`] when `data`, `id_field`, or both
    /// `geometry` and `weights` are missing; backend failures are returned
    /// as [`ZonalError::Backend`] unchanged. A failure on any raster aborts
    /// the whole call.
    pub fn execute(&self, request: ZonalRequest) -> Result<ZonalOutput> {
        let ZonalRequest {
            data,
            geometry,
            weights,
            id_field,
            options,
        } = request;

        let inputs = match data {
            Some(data) => data.into_inputs(),
            None => return Err(ZonalError::MissingArgument("`data` cannot be left empty")),
        };
        if inputs.is_empty() {
            return Err(ZonalError::MissingArgument("`data` cannot be left empty"));
        }
        let id_field = id_field.ok_or(ZonalError::MissingArgument("`id_field` cannot be left empty"))?;
        if geometry.is_none() && weights.is_none() {
            return Err(ZonalError::MissingArgument(
                "`geometry` and `weights` cannot both be empty",
            ));
        }

        let reader = self.reader.as_deref();
        let geometry = geometry
            .map(|geom| prepare_geometry(geom, options.crs.as_deref()))
            .transpose()?;
        let rasters = inputs
            .iter()
            .map(|input| prepare_raster(input, 0, None, reader))
            .collect::<Result<Vec<_>>>()?;

        let use_remote =
            weights.is_none() && !rasters.iter().any(|r| r.leading_dim() > self.remote_threshold);
        debug!(
            rasters = rasters.len(),
            use_remote,
            threshold = self.remote_threshold,
            "dispatching zonal computation"
        );

        let mut tables = if use_remote {
            self.run_remote(&rasters, geometry.as_ref(), &id_field, &options)?
        } else {
            self.run_weighted(&rasters, geometry.as_ref(), weights, &id_field, &options)?
        };

        if options.join_geometry {
            if let Some(geometry) = &geometry {
                tables = tables
                    .iter()
                    .map(|table| geometry.join(table, &id_field))
                    .collect::<Result<Vec<_>>>()?;
            }
        }

        let mut tables: Vec<DataFrame> = tables
            .into_iter()
            .map(|table| sanitize(table, &options.drop_columns))
            .collect();

        if tables.len() == 1 {
            if let Some(table) = tables.pop() {
                return Ok(ZonalOutput::Single(table));
            }
        }
        Ok(ZonalOutput::Many(tables))
    }

    fn run_remote(
        &self,
        rasters: &[Raster],
        geometry: Option<&GeometryTable>,
        id_field: &str,
        options: &ZonalOptions,
    ) -> Result<Vec<DataFrame>> {
        let geometry = geometry.ok_or(ZonalError::MissingArgument(
            "`geometry` is required without `weights`",
        ))?;

        rasters
            .iter()
            .enumerate()
            .map(|(i, raster)| {
                debug!(raster = i, "computing with remote engine");
                self.remote
                    .compute(
                        raster,
                        geometry,
                        id_field,
                        &options.stats,
                        options.subdataset_index,
                        options.show_progress,
                        false,
                        &options.backend_options,
                    )
                    .map_err(ZonalError::Backend)
            })
            .collect()
    }

    fn run_weighted(
        &self,
        rasters: &[Raster],
        geometry: Option<&GeometryTable>,
        weights: Option<WeightGrid>,
        id_field: &str,
        options: &ZonalOptions,
    ) -> Result<Vec<DataFrame>> {
        let weights = match (weights, geometry) {
            (Some(weights), _) => weights,
            (None, Some(geometry)) => {
                debug!("building weight grid from the first raster");
                self.weight_builder
                    .build(&rasters[0], geometry, id_field, options.show_progress)
                    .map_err(ZonalError::Backend)?
            }
            (None, None) => {
                return Err(ZonalError::MissingArgument(
                    "`geometry` and `weights` cannot both be empty",
                ))
            }
        };

        rasters
            .iter()
            .enumerate()
            .map(|(i, raster)| {
                debug!(raster = i, "aggregating with weight grid");
                self.aggregator
                    .aggregate(
                        raster,
                        &weights,
                        id_field,
                        &options.stats,
                        &options.backend_options,
                    )
                    .map_err(ZonalError::Backend)
            })
            .collect()
    }
}

/// Run a zonal computation with the default backends.
pub fn execute_zonal(request: ZonalRequest) -> Result<ZonalOutput> {
    ZonalOrchestrator::default().execute(request)
}
