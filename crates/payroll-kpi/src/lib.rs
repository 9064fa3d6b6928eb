//! KPI queries over the payroll warehouse: monthly totals, department
//! breakdowns, month-over-month deltas and robust net-pay anomalies.
//!
//! Every operation is a single read-only query; sums come back from the store
//! as `float8` and the derived ratios and statistics are computed here.

use chrono::NaiveDate;
use payroll_core::{
    detect_anomalies, AggregateTotals, AnomalyRow, DeltaReport, DeptAggregate, DeptMonthSums,
    Month, MonthParseError, NetSample, Summary, DEFAULT_ANOMALY_LIMIT, DEFAULT_ANOMALY_THRESHOLD,
};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "payroll-kpi";

#[derive(Debug, Error)]
pub enum KpiError {
    #[error(transparent)]
    InvalidMonth(#[from] MonthParseError),
    #[error("no payroll data for {0}")]
    NoData(Month),
    #[error("kpi query failed: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyParams {
    pub threshold: f64,
    pub limit: usize,
    pub dept: Option<String>,
}

impl Default for AnomalyParams {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_ANOMALY_THRESHOLD,
            limit: DEFAULT_ANOMALY_LIMIT,
            dept: None,
        }
    }
}

const SUMMARY_SQL: &str = r#"
    SELECT COUNT(*)                          AS fact_rows,
           COALESCE(SUM(gross), 0)::float8    AS gross,
           COALESCE(SUM(bonus), 0)::float8    AS bonus,
           COALESCE(SUM(overtime), 0)::float8 AS overtime,
           COALESCE(SUM(taxes), 0)::float8    AS taxes,
           COALESCE(SUM(net), 0)::float8      AS net,
           COALESCE(SUM(fte), 0)::float8      AS fte,
           COUNT(DISTINCT emp_id)             AS headcount
      FROM pr.fact_payroll
     WHERE month = $1
"#;

const BY_DEPT_SQL: &str = r#"
    SELECT d.dept_name                AS dept,
           SUM(f.gross)::float8       AS gross,
           SUM(f.bonus)::float8       AS bonus,
           SUM(f.overtime)::float8    AS overtime,
           SUM(f.taxes)::float8       AS taxes,
           SUM(f.net)::float8         AS net,
           SUM(f.fte)::float8         AS fte,
           COUNT(DISTINCT f.emp_id)   AS headcount
      FROM pr.fact_payroll f
      JOIN pr.dim_employee e ON e.emp_id = f.emp_id
      JOIN pr.dim_dept d     ON d.dept_id = e.dept_id
     WHERE f.month = $1
     GROUP BY d.dept_name
     ORDER BY d.dept_name COLLATE "C"
"#;

const DELTA_SQL: &str = r#"
    SELECT d.dept_name             AS dept,
           f.month                 AS month,
           SUM(f.gross)::float8    AS gross,
           SUM(f.bonus)::float8    AS bonus,
           SUM(f.overtime)::float8 AS overtime
      FROM pr.fact_payroll f
      JOIN pr.dim_employee e ON e.emp_id = f.emp_id
      JOIN pr.dim_dept d     ON d.dept_id = e.dept_id
     WHERE f.month IN ($1, $2)
     GROUP BY d.dept_name, f.month
"#;

const NET_SAMPLES_SQL: &str = r#"
    SELECT f.emp_id, d.dept_name AS dept, f.net::float8 AS net
      FROM pr.fact_payroll f
      JOIN pr.dim_employee e ON e.emp_id = f.emp_id
      JOIN pr.dim_dept d     ON d.dept_id = e.dept_id
     WHERE f.month = $1
"#;

const NET_SAMPLES_FOR_DEPT_SQL: &str = r#"
    SELECT f.emp_id, d.dept_name AS dept, f.net::float8 AS net
      FROM pr.fact_payroll f
      JOIN pr.dim_employee e ON e.emp_id = f.emp_id
      JOIN pr.dim_dept d     ON d.dept_id = e.dept_id
     WHERE f.month = $1
       AND d.dept_name = $2
"#;

fn totals_from_row(row: &PgRow) -> Result<AggregateTotals, sqlx::Error> {
    Ok(AggregateTotals {
        gross: row.try_get("gross")?,
        bonus: row.try_get("bonus")?,
        overtime: row.try_get("overtime")?,
        taxes: row.try_get("taxes")?,
        net: row.try_get("net")?,
        fte: row.try_get("fte")?,
        headcount: row.try_get("headcount")?,
    })
}

/// Read-only KPI engine. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct KpiEngine {
    pool: PgPool,
}

impl KpiEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Parses a `YYYY-MM` query argument.
    pub fn month(raw: &str) -> Result<Month, KpiError> {
        Ok(Month::parse(raw)?)
    }

    pub async fn summary(&self, month: Month) -> Result<Summary, KpiError> {
        let row = sqlx::query(SUMMARY_SQL)
            .bind(month.first_day())
            .fetch_one(&self.pool)
            .await?;
        let fact_rows: i64 = row.try_get("fact_rows")?;
        if fact_rows == 0 {
            return Err(KpiError::NoData(month));
        }
        Ok(Summary::from_totals(month, totals_from_row(&row)?))
    }

    pub async fn by_department(&self, month: Month) -> Result<Vec<DeptAggregate>, KpiError> {
        let rows = sqlx::query(BY_DEPT_SQL)
            .bind(month.first_day())
            .fetch_all(&self.pool)
            .await?;
        if rows.is_empty() {
            return Err(KpiError::NoData(month));
        }

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let dept: String = row.try_get("dept")?;
            out.push(DeptAggregate::from_totals(dept, totals_from_row(&row)?));
        }
        Ok(out)
    }

    /// Per-department and company deltas `m2 - m1`. An empty month is not an
    /// error; its side of every delta is zero.
    pub async fn delta(&self, m1: Month, m2: Month) -> Result<DeltaReport, KpiError> {
        let rows = sqlx::query(DELTA_SQL)
            .bind(m1.first_day())
            .bind(m2.first_day())
            .fetch_all(&self.pool)
            .await?;

        let mut sums = Vec::with_capacity(rows.len());
        for row in rows {
            let month: NaiveDate = row.try_get("month")?;
            sums.push(DeptMonthSums {
                dept: row.try_get("dept")?,
                month: Month::from_date(month),
                gross: row.try_get("gross")?,
                bonus: row.try_get("bonus")?,
                overtime: row.try_get("overtime")?,
            });
        }
        Ok(DeltaReport::from_month_sums(m1, m2, &sums))
    }

    pub async fn anomalies(&self, month: Month, params: &AnomalyParams) -> Result<Vec<AnomalyRow>, KpiError> {
        let query = match &params.dept {
            Some(dept) => sqlx::query(NET_SAMPLES_FOR_DEPT_SQL)
                .bind(month.first_day())
                .bind(dept.clone()),
            None => sqlx::query(NET_SAMPLES_SQL).bind(month.first_day()),
        };
        let rows = query.fetch_all(&self.pool).await?;

        let mut samples = Vec::with_capacity(rows.len());
        for row in rows {
            samples.push(NetSample {
                emp_id: row.try_get("emp_id")?,
                dept: row.try_get("dept")?,
                net: row.try_get("net")?,
            });
        }
        debug!(%month, samples = samples.len(), "scoring net pay cohorts");
        Ok(detect_anomalies(&samples, params.threshold, params.limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anomaly_params_default_to_documented_values() {
        let params = AnomalyParams::default();
        assert_eq!(params.threshold, 3.5);
        assert_eq!(params.limit, 10);
        assert_eq!(params.dept, None);
    }

    #[test]
    fn month_argument_errors_are_typed() {
        assert_eq!(KpiEngine::month("2024-05").unwrap(), Month::new(2024, 5).unwrap());
        let err = KpiEngine::month("May").unwrap_err();
        assert!(matches!(err, KpiError::InvalidMonth(_)));
        assert_eq!(err.to_string(), "invalid month \"May\", expected YYYY-MM");
    }

    #[test]
    fn no_data_error_names_the_month() {
        let err = KpiError::NoData(Month::new(2030, 1).unwrap());
        assert_eq!(err.to_string(), "no payroll data for 2030-01");
    }
}
