use polars::prelude::*;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use std::error::Error;

/// Declared type and values of a column. Geometries are already WKT text.
fn sql_column(column: &Column) -> PolarsResult<(&'static str, Vec<SqlValue>)> {
    let dtype = column.dtype();
    if dtype.is_integer() || dtype.is_bool() {
        let values = column.cast(&DataType::Int64)?;
        let values = values
            .i64()?
            .into_iter()
            .map(|v| v.map_or(SqlValue::Null, SqlValue::Integer))
            .collect();
        return Ok(("INTEGER", values));
    }
    if dtype.is_float() {
        let values = column.cast(&DataType::Float64)?;
        let values = values
            .f64()?
            .into_iter()
            .map(|v| match v {
                Some(v) if !v.is_nan() => SqlValue::Real(v),
                _ => SqlValue::Null,
            })
            .collect();
        return Ok(("REAL", values));
    }
    let values = column.cast(&DataType::String)?;
    let values = values
        .str()?
        .into_iter()
        .map(|v| v.map_or(SqlValue::Null, |v| SqlValue::Text(v.to_string())))
        .collect();
    Ok(("TEXT", values))
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Write a result table to the database, replacing any table with the same name.
pub fn write_to_db(conn: &mut Connection, table: &DataFrame, name: &str) -> Result<(), Box<dyn Error>> {
    let mut declarations = vec![];
    let mut values = vec![];
    for column in table.get_columns() {
        let (sql_type, column_values) = sql_column(column)?;
        declarations.push(format!("{} {sql_type}", quote(column.name())));
        values.push(column_values);
    }
    let columns = declarations.join(", ");

    let placeholders = (1..=values.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");

    // Start a transaction for batch insertion
    let transaction = conn.transaction()?;
    transaction.execute_batch(&format!(
        "DROP TABLE IF EXISTS {name};
        CREATE TABLE {name} ({columns});",
        name = quote(name)
    ))?;
    {
        let mut stmt =
            transaction.prepare(&format!("INSERT INTO {} VALUES ({placeholders})", quote(name)))?;

        for row in 0..table.height() {
            let row_values = values.iter().map(|column| &column[row]);
            stmt.execute(rusqlite::params_from_iter(row_values))?;
        }
    }
    // Commit the transaction
    transaction.commit()?;

    Ok(())
}
