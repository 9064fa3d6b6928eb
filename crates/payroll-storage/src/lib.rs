//! Warehouse schema management + transactional upsert loading for payroll extracts.

use chrono::NaiveDate;
use payroll_core::{EmployeeRecord, FactRecord, LoadReport, NormalizedTable};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{PgConnection, Row};
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "payroll-storage";

/// Star schema DDL, applied in order. Every statement is idempotent.
pub const SCHEMA_DDL: [&str; 7] = [
    "CREATE SCHEMA IF NOT EXISTS pr",
    r#"
    CREATE TABLE IF NOT EXISTS pr.dim_dept (
        dept_id   SERIAL PRIMARY KEY,
        dept_name TEXT UNIQUE NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pr.dim_employee (
        emp_id    TEXT PRIMARY KEY,
        dept_id   INT NOT NULL REFERENCES pr.dim_dept(dept_id),
        job_grade TEXT,
        location  TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pr.fact_payroll (
        emp_id       TEXT NOT NULL REFERENCES pr.dim_employee(emp_id),
        month        DATE NOT NULL,
        gross        NUMERIC NOT NULL DEFAULT 0,
        bonus        NUMERIC NOT NULL DEFAULT 0,
        overtime     NUMERIC NOT NULL DEFAULT 0,
        taxes        NUMERIC NOT NULL DEFAULT 0,
        deductions   NUMERIC NOT NULL DEFAULT 0,
        net          NUMERIC NOT NULL DEFAULT 0,
        fte          NUMERIC NOT NULL DEFAULT 0,
        hours_worked NUMERIC NOT NULL DEFAULT 0,
        currency     TEXT NOT NULL,
        PRIMARY KEY (emp_id, month)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS fact_payroll_month_idx ON pr.fact_payroll(month)",
    "CREATE INDEX IF NOT EXISTS fact_payroll_emp_month_idx ON pr.fact_payroll(emp_id, month)",
    "CREATE INDEX IF NOT EXISTS dim_employee_dept_idx ON pr.dim_employee(dept_id)",
];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("connecting to warehouse: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("ensuring warehouse schema: {0}")]
    Schema(#[source] sqlx::Error),
    #[error("load transaction rolled back: {0}")]
    Load(#[source] sqlx::Error),
    #[error("load transaction rolled back: departments did not resolve: {}", .0.join(", "))]
    UnresolvedDepartments(Vec<String>),
    #[error("warehouse query failed: {0}")]
    Query(#[source] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub table: String,
    pub name: String,
    pub definition: String,
}

/// Handle over the payroll warehouse. Cloning shares the underlying pool.
#[derive(Debug, Clone)]
pub struct Warehouse {
    pool: PgPool,
}

impl Warehouse {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Creates the schema, tables and indexes that are missing. Safe to run
    /// before every load.
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(StorageError::Schema)?;
        for statement in SCHEMA_DDL {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(StorageError::Schema)?;
        }
        tx.commit().await.map_err(StorageError::Schema)?;
        info!("warehouse schema ensured");
        Ok(())
    }

    pub async fn list_indexes(&self) -> Result<Vec<IndexInfo>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT tablename, indexname, indexdef
              FROM pg_indexes
             WHERE schemaname = 'pr'
             ORDER BY indexname
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Query)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(IndexInfo {
                table: row.try_get("tablename").map_err(StorageError::Query)?,
                name: row.try_get("indexname").map_err(StorageError::Query)?,
                definition: row.try_get("indexdef").map_err(StorageError::Query)?,
            });
        }
        Ok(out)
    }

    /// Merges a normalized extract into the warehouse in one transaction:
    /// departments, then employees, then facts. Any failure rolls back the
    /// whole load.
    pub async fn upsert_all(&self, run_id: Uuid, table: &NormalizedTable) -> Result<LoadReport, StorageError> {
        let span = info_span!("payroll_load", %run_id);
        self.upsert_all_inner(table).instrument(span).await
    }

    async fn upsert_all_inner(&self, table: &NormalizedTable) -> Result<LoadReport, StorageError> {
        let mut tx = self.pool.begin().await.map_err(StorageError::Load)?;

        let depts_inserted = merge_departments(&mut tx, table.departments()).await?;
        info!(depts_inserted, "department merge done");

        let (employees_inserted, employees_updated) = merge_employees(&mut tx, &table.employees()).await?;
        info!(employees_inserted, employees_updated, "employee merge done");

        let (facts_inserted, facts_updated) = merge_facts(&mut tx, &table.facts()).await?;
        info!(facts_inserted, facts_updated, "fact merge done");

        let total_fact_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pr.fact_payroll")
            .fetch_one(&mut *tx)
            .await
            .map_err(StorageError::Load)?;

        tx.commit().await.map_err(StorageError::Load)?;

        Ok(LoadReport {
            depts_inserted,
            employees_inserted,
            employees_updated,
            facts_inserted,
            facts_updated,
            total_fact_rows,
        })
    }
}

async fn execute(conn: &mut PgConnection, sql: &str) -> Result<u64, StorageError> {
    sqlx::query(sql)
        .execute(conn)
        .await
        .map(|done| done.rows_affected())
        .map_err(StorageError::Load)
}

/// Splits `RETURNING (xmax = 0)` flags into (inserted, updated) counts.
fn split_upserted(flags: &[bool]) -> (u64, u64) {
    let inserted = flags.iter().filter(|f| **f).count() as u64;
    (inserted, flags.len() as u64 - inserted)
}

async fn merge_departments(conn: &mut PgConnection, names: Vec<String>) -> Result<u64, StorageError> {
    execute(conn, "CREATE TEMP TABLE x_dept (dept_name TEXT NOT NULL) ON COMMIT DROP").await?;
    sqlx::query("INSERT INTO x_dept (dept_name) SELECT * FROM UNNEST($1::text[])")
        .bind(names)
        .execute(&mut *conn)
        .await
        .map_err(StorageError::Load)?;
    execute(
        conn,
        r#"
        INSERT INTO pr.dim_dept (dept_name)
        SELECT DISTINCT dept_name FROM x_dept
        ON CONFLICT (dept_name) DO NOTHING
        "#,
    )
    .await
}

async fn merge_employees(conn: &mut PgConnection, employees: &[EmployeeRecord]) -> Result<(u64, u64), StorageError> {
    let mut emp_ids = Vec::with_capacity(employees.len());
    let mut dept_names = Vec::with_capacity(employees.len());
    let mut job_grades = Vec::with_capacity(employees.len());
    let mut locations = Vec::with_capacity(employees.len());
    for e in employees {
        emp_ids.push(e.emp_id.clone());
        dept_names.push(e.dept.clone());
        job_grades.push(e.job_grade.clone());
        locations.push(e.location.clone());
    }

    execute(
        conn,
        r#"
        CREATE TEMP TABLE x_emp (
            emp_id    TEXT NOT NULL,
            dept_name TEXT NOT NULL,
            job_grade TEXT,
            location  TEXT
        ) ON COMMIT DROP
        "#,
    )
    .await?;
    sqlx::query(
        r#"
        INSERT INTO x_emp (emp_id, dept_name, job_grade, location)
        SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[])
        "#,
    )
    .bind(emp_ids)
    .bind(dept_names)
    .bind(job_grades)
    .bind(locations)
    .execute(&mut *conn)
    .await
    .map_err(StorageError::Load)?;

    let unresolved: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT x.dept_name
          FROM x_emp x
          LEFT JOIN pr.dim_dept d ON d.dept_name = x.dept_name
         WHERE d.dept_id IS NULL
         ORDER BY x.dept_name
        "#,
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(StorageError::Load)?;
    if !unresolved.is_empty() {
        return Err(StorageError::UnresolvedDepartments(unresolved));
    }

    let flags: Vec<bool> = sqlx::query_scalar(
        r#"
        INSERT INTO pr.dim_employee (emp_id, dept_id, job_grade, location)
        SELECT x.emp_id, d.dept_id, x.job_grade, x.location
          FROM x_emp x
          JOIN pr.dim_dept d ON d.dept_name = x.dept_name
        ON CONFLICT (emp_id) DO UPDATE
           SET dept_id   = EXCLUDED.dept_id,
               job_grade = EXCLUDED.job_grade,
               location  = EXCLUDED.location
        RETURNING (xmax = 0) AS inserted
        "#,
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(StorageError::Load)?;
    Ok(split_upserted(&flags))
}

#[derive(Debug, Default)]
struct FactColumns {
    emp_ids: Vec<String>,
    months: Vec<NaiveDate>,
    gross: Vec<f64>,
    bonus: Vec<f64>,
    overtime: Vec<f64>,
    taxes: Vec<f64>,
    deductions: Vec<f64>,
    net: Vec<f64>,
    fte: Vec<f64>,
    hours_worked: Vec<f64>,
    currencies: Vec<String>,
}

impl FactColumns {
    fn from_records(facts: &[FactRecord]) -> Self {
        let mut cols = Self::default();
        for f in facts {
            cols.emp_ids.push(f.emp_id.clone());
            cols.months.push(f.month.first_day());
            cols.gross.push(f.measures.gross);
            cols.bonus.push(f.measures.bonus);
            cols.overtime.push(f.measures.overtime);
            cols.taxes.push(f.measures.taxes);
            cols.deductions.push(f.measures.deductions);
            cols.net.push(f.measures.net);
            cols.fte.push(f.measures.fte);
            cols.hours_worked.push(f.measures.hours_worked);
            cols.currencies.push(f.currency.clone());
        }
        cols
    }
}

async fn merge_facts(conn: &mut PgConnection, facts: &[FactRecord]) -> Result<(u64, u64), StorageError> {
    let cols = FactColumns::from_records(facts);

    execute(
        conn,
        r#"
        CREATE TEMP TABLE x_fact (
            emp_id       TEXT NOT NULL,
            month        DATE NOT NULL,
            gross        FLOAT8 NOT NULL,
            bonus        FLOAT8 NOT NULL,
            overtime     FLOAT8 NOT NULL,
            taxes        FLOAT8 NOT NULL,
            deductions   FLOAT8 NOT NULL,
            net          FLOAT8 NOT NULL,
            fte          FLOAT8 NOT NULL,
            hours_worked FLOAT8 NOT NULL,
            currency     TEXT NOT NULL
        ) ON COMMIT DROP
        "#,
    )
    .await?;
    sqlx::query(
        r#"
        INSERT INTO x_fact
        SELECT * FROM UNNEST(
            $1::text[], $2::date[],
            $3::float8[], $4::float8[], $5::float8[], $6::float8[],
            $7::float8[], $8::float8[], $9::float8[], $10::float8[],
            $11::text[]
        )
        "#,
    )
    .bind(cols.emp_ids)
    .bind(cols.months)
    .bind(cols.gross)
    .bind(cols.bonus)
    .bind(cols.overtime)
    .bind(cols.taxes)
    .bind(cols.deductions)
    .bind(cols.net)
    .bind(cols.fte)
    .bind(cols.hours_worked)
    .bind(cols.currencies)
    .execute(&mut *conn)
    .await
    .map_err(StorageError::Load)?;

    let flags: Vec<bool> = sqlx::query_scalar(
        r#"
        INSERT INTO pr.fact_payroll
            (emp_id, month, gross, bonus, overtime, taxes, deductions, net, fte, hours_worked, currency)
        SELECT emp_id, month, gross, bonus, overtime, taxes, deductions, net, fte, hours_worked, currency
          FROM x_fact
        ON CONFLICT (emp_id, month) DO UPDATE
           SET gross        = EXCLUDED.gross,
               bonus        = EXCLUDED.bonus,
               overtime     = EXCLUDED.overtime,
               taxes        = EXCLUDED.taxes,
               deductions   = EXCLUDED.deductions,
               net          = EXCLUDED.net,
               fte          = EXCLUDED.fte,
               hours_worked = EXCLUDED.hours_worked,
               currency     = EXCLUDED.currency
        RETURNING (xmax = 0) AS inserted
        "#,
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(StorageError::Load)?;
    Ok(split_upserted(&flags))
}
