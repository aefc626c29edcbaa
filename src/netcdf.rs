use std::{error::Error, path::Path};

use cftime_rs::{calendars::Calendar, utils::get_datetime_and_unit_from_units};
use chrono::{DateTime, TimeZone, Utc};
use ndarray::Array1;
use netcdf::{AttributeValue, Extents, Variable};
use zonal_aggregation::{BackendError, Grid, Raster, RasterReader};

/// Reads one variable of a netCDF file as a `(time, latitude, longitude)` raster.
pub struct NetcdfReader {
    pub variable: String,
}

impl RasterReader for NetcdfReader {
    fn read(&self, path: &Path) -> Result<Raster, BackendError> {
        read_netcdf(path, &self.variable)
            .map_err(|e| format!("Could not read {}: {e}", path.display()).into())
    }
}

/// Read the netcdf file and extract the data, the timeline and the grid.
/// Layers are named after their timestamps.
///
/// # Arguments
///
/// * `nc_file` - Path to the netcdf file
/// * `variable` - Name of the variable to extract
pub fn read_netcdf(nc_file: &Path, variable: &str) -> Result<Raster, Box<dyn Error>> {
    let nc_file = netcdf::open(nc_file)?;

    let lats = &nc_file
        .variable("latitude")
        .ok_or("Could not find variable 'latitude'")?;
    let lons = &nc_file
        .variable("longitude")
        .ok_or("Could not find variable 'longitude'")?;

    let n_rows = lats.len();
    let n_cols = lons.len();
    if n_rows < 2 || n_cols < 2 {
        return Err(format!("grid of {n_rows}x{n_cols} cells is too small").into());
    }

    let time = &nc_file
        .variable("time")
        .ok_or("Could not find variable 'time'")?;

    let timeline = extract_time(time)?;
    let var = &nc_file
        .variable(variable)
        .ok_or(format!("Missing variable {variable}"))?;

    let lats = lats.get::<f32, Extents>(Extents::All)?;
    let lats = lats.to_shape((n_rows,))?;

    let lons = lons.get::<f32, Extents>(Extents::All)?;
    let lons = lons.to_shape((n_cols,))?;

    let n_times = timeline.len();

    let data = var.get::<f32, Extents>(Extents::All)?;
    let data = data.to_shape((n_times, n_rows, n_cols))?.to_owned();

    let max_lat = lats[n_rows - 1] as f64;
    let min_lon = lons[0] as f64;
    let min_lat = lats[0] as f64;
    let max_lon = lons[n_cols - 1] as f64;

    let grid = Grid::new(min_lat, max_lat, min_lon, max_lon, n_rows, n_cols);
    let layer_names = timeline.iter().map(|t| t.to_rfc3339()).collect();

    Ok(Raster::new(data.into_dyn(), grid)?.with_layer_names(layer_names))
}

/// Extract the time variable from the NetCDF file.
///
/// # Arguments
///
/// * `time_var` - The time variable
///
/// # Returns
///
/// A `Result` containing the array of `DateTime<Utc>` values or an error.
pub fn extract_time(time_var: &Variable) -> Result<Array1<DateTime<Utc>>, Box<dyn Error>> {
    let units_attr = time_var.attribute("units");
    let timeline = if let Some(units_attr) = units_attr {
        let units = match units_attr.value().or(Err("should have a value"))? {
            AttributeValue::Str(units) => units,
            _ => return Err("Could not find units".into()),
        };

        let calendar = Calendar::Standard;
        let (cf_datetime, unit) = get_datetime_and_unit_from_units(&units, calendar)
            .map_err(|e| format!("Invalid time units '{units}': {e:?}"))?;
        let duration = unit.to_duration(calendar);

        time_var
            .get::<i64, Extents>(Extents::All)?
            .into_iter()
            .filter_map(|t| (&cf_datetime + (&duration * t)).ok())
            .filter_map(|d| {
                let (year, month, day, hour, minute, seconds) = d.ymd_hms().ok()?;
                let year: i32 = year.try_into().ok()?;
                Utc.with_ymd_and_hms(
                    year,
                    month as u32,
                    day as u32,
                    hour as u32,
                    minute as u32,
                    seconds as u32,
                )
                .single()
            })
            .collect::<Array1<DateTime<Utc>>>()
    } else {
        // without units, assume "seconds since 1970-01-01 00:00:00"
        time_var
            .get::<i64, Extents>(Extents::All)?
            .into_iter()
            .filter_map(|t| DateTime::from_timestamp(t, 0))
            .collect::<Array1<DateTime<Utc>>>()
    };
    Ok(timeline)
}
