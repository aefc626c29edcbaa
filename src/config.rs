use serde::{Deserialize, Serialize};

use std::error::Error;
use std::fs;
use std::path::Path;

fn default_join_geometry() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    pub output_path: String,
    #[serde(default)]
    pub remote_threshold: Option<usize>,
    pub jobs: Vec<Job>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Job {
    pub shapefile: String,
    pub id_field: String,
    pub variable: String,
    pub rasters: Vec<String>,
    pub stats: Vec<String>,
    #[serde(default)]
    pub subdataset_index: usize,
    #[serde(default)]
    pub drop: Vec<String>,
    #[serde(default = "default_join_geometry")]
    pub join_geometry: bool,
    #[serde(default)]
    pub crs: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
}

/// Load the configuration from a YAML file
/// # Arguments
/// * `path` - Path to the YAML file
/// # Returns
/// * A Result containing the configuration or an error
pub fn load_config(path: &Path) -> Result<Config, Box<dyn Error>> {
    let content = fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_YAML: &str = r#"
output_path: /data/zonal/cache.db
remote_threshold: 8

jobs:
  - shapefile: /data/shp/comuni.shp
    id_field: PRO_COM
    variable: V
    rasters: [/data/nc/V_*.nc]
    stats: [PERC90, PERC75, PERC50, MEAN]

  - shapefile: /data/shp/regioni.shp
    id_field: COD_REG
    variable: I
    rasters: [/data/nc/I_20240101.nc, /data/nc/I_20240102.nc]
    stats: [MEAN, MAX]
    subdataset_index: 2
    drop: [SHAPE_AREA]
    join_geometry: false
    table: regioni_I
"#;

    #[test]
    fn test_deserialization() {
        let parsed: Config = serde_yaml::from_str(TEST_YAML).expect("Failed to deserialize YAML");

        assert_eq!(parsed.output_path, "/data/zonal/cache.db");
        assert_eq!(parsed.remote_threshold, Some(8));
        assert_eq!(parsed.jobs.len(), 2);

        let first = &parsed.jobs[0];
        assert_eq!(first.variable, "V");
        assert_eq!(first.rasters, vec!["/data/nc/V_*.nc"]);
        assert_eq!(first.stats, vec!["PERC90", "PERC75", "PERC50", "MEAN"]);
        assert_eq!(first.subdataset_index, 0);
        assert!(first.drop.is_empty());
        assert!(first.join_geometry);
        assert_eq!(first.table, None);

        let second = &parsed.jobs[1];
        assert_eq!(second.id_field, "COD_REG");
        assert_eq!(second.rasters.len(), 2);
        assert_eq!(second.subdataset_index, 2);
        assert_eq!(second.drop, vec!["SHAPE_AREA"]);
        assert!(!second.join_geometry);
        assert_eq!(second.table.as_deref(), Some("regioni_I"));
    }

    #[test]
    fn test_missing_field() {
        let invalid_yaml = r#"
output_path: cache.db
jobs:
  - shapefile: zones.shp
    id_field: ID
    variable: V
    stats: [MEAN]
"#; // No `rasters` field in the job

        let parsed: Result<Config, _> = serde_yaml::from_str(invalid_yaml);
        assert!(
            parsed.is_err(),
            "Expected an error due to missing required field"
        );
    }

    #[test]
    fn test_invalid_yaml_format() {
        let broken_yaml = r#"
output_path: cache.db
remote_threshold: "five" # Invalid type, should be an integer
jobs: []
"#;

        let parsed: Result<Config, _> = serde_yaml::from_str(broken_yaml);
        assert!(
            parsed.is_err(),
            "Expected an error due to invalid integer format"
        );
    }
}
