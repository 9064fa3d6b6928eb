//! Core domain model, load handoff contract and KPI records for the payroll warehouse.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const CRATE_NAME: &str = "payroll-core";

/// Currency recorded on a fact when the extract carries none.
pub const DEFAULT_CURRENCY: &str = "BYN";

/// Consistency constant of the MAD-based robust z-score.
pub const ROBUST_Z_SCALE: f64 = 0.6745;

/// Mean absolute deviation scale used when a cohort's MAD collapses to zero.
pub const MEAN_AD_SCALE: f64 = 1.253_314;

pub const DEFAULT_ANOMALY_THRESHOLD: f64 = 3.5;
pub const DEFAULT_ANOMALY_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid month {0:?}, expected YYYY-MM")]
pub struct MonthParseError(pub String);

/// Calendar month, stored as the first day of that month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Month(NaiveDate);

impl Month {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(Self)
    }

    /// Parses the first seven characters of `token` as `YYYY-MM`.
    ///
    /// Anything after the year-month prefix is ignored, so `2024-03-17` and
    /// `2024-03` both resolve to March 2024.
    pub fn parse(token: &str) -> Result<Self, MonthParseError> {
        let err = || MonthParseError(token.to_string());
        let prefix = token.trim().get(..7).ok_or_else(err)?;
        let bytes = prefix.as_bytes();
        let digits_ok = bytes[..4].iter().chain(&bytes[5..]).all(u8::is_ascii_digit);
        if !digits_ok || bytes[4] != b'-' {
            return Err(err());
        }
        let year: i32 = prefix[..4].parse().map_err(|_| err())?;
        let month: u32 = prefix[5..].parse().map_err(|_| err())?;
        Self::new(year, month).ok_or_else(err)
    }

    pub fn first_day(&self) -> NaiveDate {
        self.0
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self(date.with_day(1).unwrap_or(date))
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.0.year(), self.0.month())
    }
}

impl FromStr for Month {
    type Err = MonthParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Month {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Month {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Month::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Canonical measure columns of a payroll fact; absent values are zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PayrollMeasures {
    pub gross: f64,
    pub bonus: f64,
    pub overtime: f64,
    pub taxes: f64,
    pub deductions: f64,
    pub net: f64,
    pub fte: f64,
    pub hours_worked: f64,
}

/// One extract line after type coercion and defaulting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub line: usize,
    pub emp_id: String,
    pub dept: String,
    pub month: Option<Month>,
    pub job_grade: Option<String>,
    pub location: Option<String>,
    pub measures: PayrollMeasures,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MissingEmployeeId,
    MissingDepartment,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingEmployeeId => f.write_str("blank employee identifier"),
            RejectReason::MissingDepartment => f.write_str("blank department"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub line: usize,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmployeeRecord {
    pub emp_id: String,
    pub dept: String,
    pub job_grade: Option<String>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRecord {
    pub emp_id: String,
    pub month: Month,
    pub measures: PayrollMeasures,
    pub currency: String,
}

/// Handoff contract from extraction into the upsert loader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTable {
    pub rows_read: usize,
    pub rows: Vec<NormalizedRow>,
    pub rejected: Vec<RejectedRow>,
}

impl NormalizedTable {
    /// Distinct department names, sorted.
    pub fn departments(&self) -> Vec<String> {
        self.rows
            .iter()
            .map(|r| r.dept.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// One record per employee identifier; the first occurrence wins.
    pub fn employees(&self) -> Vec<EmployeeRecord> {
        let mut seen = HashSet::new();
        self.rows
            .iter()
            .filter(|r| seen.insert(r.emp_id.as_str()))
            .map(|r| EmployeeRecord {
                emp_id: r.emp_id.clone(),
                dept: r.dept.clone(),
                job_grade: r.job_grade.clone(),
                location: r.location.clone(),
            })
            .collect()
    }

    /// One fact per (employee, month); a later line for the same key replaces
    /// an earlier one. Rows without a month are left out.
    pub fn facts(&self) -> Vec<FactRecord> {
        let mut by_key: BTreeMap<(&str, Month), FactRecord> = BTreeMap::new();
        for row in &self.rows {
            let Some(month) = row.month else { continue };
            by_key.insert(
                (row.emp_id.as_str(), month),
                FactRecord {
                    emp_id: row.emp_id.clone(),
                    month,
                    measures: row.measures,
                    currency: row.currency.clone(),
                },
            );
        }
        by_key.into_values().collect()
    }

    pub fn skipped_fact_rows(&self) -> usize {
        self.rows.iter().filter(|r| r.month.is_none()).count()
    }
}

/// Per-stage counts produced by one upsert transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub depts_inserted: u64,
    pub employees_inserted: u64,
    pub employees_updated: u64,
    pub facts_inserted: u64,
    pub facts_updated: u64,
    pub total_fact_rows: i64,
}

impl LoadReport {
    pub fn employees_upserted(&self) -> u64 {
        self.employees_inserted + self.employees_updated
    }

    pub fn facts_upserted(&self) -> u64 {
        self.facts_inserted + self.facts_updated
    }
}

/// `numerator / denominator`, or `None` when the denominator is zero or the
/// quotient is not finite.
pub fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator == 0.0 {
        return None;
    }
    let value = numerator / denominator;
    value.is_finite().then_some(value)
}

/// Raw sums for a month (or a department within a month).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregateTotals {
    pub gross: f64,
    pub bonus: f64,
    pub overtime: f64,
    pub taxes: f64,
    pub net: f64,
    pub fte: f64,
    pub headcount: i64,
}

impl AggregateTotals {
    /// Labor cost: gross + bonus + overtime.
    pub fn fot(&self) -> f64 {
        self.gross + self.bonus + self.overtime
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub month: Month,
    pub fot: f64,
    pub gross: f64,
    pub bonus: f64,
    pub overtime: f64,
    pub taxes: f64,
    pub net: f64,
    pub fte: f64,
    pub headcount: i64,
    pub tax_share: Option<f64>,
    pub avg_net_per_fte: Option<f64>,
}

impl Summary {
    pub fn from_totals(month: Month, totals: AggregateTotals) -> Self {
        Self {
            month,
            fot: totals.fot(),
            gross: totals.gross,
            bonus: totals.bonus,
            overtime: totals.overtime,
            taxes: totals.taxes,
            net: totals.net,
            fte: totals.fte,
            headcount: totals.headcount,
            tax_share: ratio(totals.taxes, totals.gross),
            avg_net_per_fte: ratio(totals.net, totals.fte),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeptAggregate {
    pub dept: String,
    pub gross: f64,
    pub bonus: f64,
    pub overtime: f64,
    pub fot: f64,
    pub net: f64,
    pub taxes: f64,
    pub fte: f64,
    pub headcount: i64,
    pub tax_share: Option<f64>,
    pub avg_net_per_fte: Option<f64>,
}

impl DeptAggregate {
    pub fn from_totals(dept: impl Into<String>, totals: AggregateTotals) -> Self {
        Self {
            dept: dept.into(),
            gross: totals.gross,
            bonus: totals.bonus,
            overtime: totals.overtime,
            fot: totals.fot(),
            net: totals.net,
            taxes: totals.taxes,
            fte: totals.fte,
            headcount: totals.headcount,
            tax_share: ratio(totals.taxes, totals.gross),
            avg_net_per_fte: ratio(totals.net, totals.fte),
        }
    }
}

/// Gross/bonus/overtime sums of one department in one month.
#[derive(Debug, Clone, PartialEq)]
pub struct DeptMonthSums {
    pub dept: String,
    pub month: Month,
    pub gross: f64,
    pub bonus: f64,
    pub overtime: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaTotals {
    pub gross_delta: f64,
    pub bonus_delta: f64,
    pub overtime_delta: f64,
    pub fot_delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeptDelta {
    pub dept: String,
    pub gross_delta: f64,
    pub bonus_delta: f64,
    pub overtime_delta: f64,
    pub fot_delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaReport {
    pub m1: Month,
    pub m2: Month,
    pub company: DeltaTotals,
    pub by_dept: Vec<DeptDelta>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Side {
    gross: f64,
    bonus: f64,
    overtime: f64,
}

impl Side {
    fn add(&mut self, row: &DeptMonthSums) {
        self.gross += row.gross;
        self.bonus += row.bonus;
        self.overtime += row.overtime;
    }

    fn fot(&self) -> f64 {
        self.gross + self.bonus + self.overtime
    }
}

fn delta_between(before: Side, after: Side) -> DeltaTotals {
    DeltaTotals {
        gross_delta: after.gross - before.gross,
        bonus_delta: after.bonus - before.bonus,
        overtime_delta: after.overtime - before.overtime,
        fot_delta: after.fot() - before.fot(),
    }
}

impl DeltaReport {
    /// Full outer join of per-department sums for `m1` and `m2`; a department
    /// missing from one side counts as zero there. Rows for other months are
    /// ignored.
    pub fn from_month_sums(m1: Month, m2: Month, rows: &[DeptMonthSums]) -> Self {
        let mut by_dept: BTreeMap<&str, (Side, Side)> = BTreeMap::new();
        let mut company = (Side::default(), Side::default());
        for row in rows {
            if row.month != m1 && row.month != m2 {
                continue;
            }
            let sides = by_dept.entry(row.dept.as_str()).or_default();
            if row.month == m1 {
                sides.0.add(row);
                company.0.add(row);
            }
            if row.month == m2 {
                sides.1.add(row);
                company.1.add(row);
            }
        }

        let by_dept = by_dept
            .into_iter()
            .map(|(dept, (before, after))| {
                let d = delta_between(before, after);
                DeptDelta {
                    dept: dept.to_string(),
                    gross_delta: d.gross_delta,
                    bonus_delta: d.bonus_delta,
                    overtime_delta: d.overtime_delta,
                    fot_delta: d.fot_delta,
                }
            })
            .collect();

        Self {
            m1,
            m2,
            company: delta_between(company.0, company.1),
            by_dept,
        }
    }
}

/// Median with linear interpolation between the two middle values, matching
/// `percentile_cont(0.5)`. `None` for an empty slice.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}

/// Dispersion of one department cohort around its median net pay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CohortStats {
    pub median: f64,
    pub mad: f64,
    pub mean_ad: f64,
}

impl CohortStats {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let median = median(values)?;
        let deviations: Vec<f64> = values.iter().map(|v| (v - median).abs()).collect();
        let mad = self::median(&deviations)?;
        let mean_ad = deviations.iter().sum::<f64>() / deviations.len() as f64;
        Some(Self {
            median,
            mad,
            mean_ad,
        })
    }

    /// Robust z-score of `value` within the cohort.
    ///
    /// Uses `0.6745 * (x - median) / MAD`. When more than half the cohort sits
    /// exactly on the median the MAD is zero although the cohort still has
    /// spread; the score then falls back to `(x - median) / (1.253314 * meanAD)`.
    /// A cohort with no spread at all has no score.
    pub fn robust_z(&self, value: f64) -> Option<f64> {
        let z = if self.mad > 0.0 {
            ROBUST_Z_SCALE * (value - self.median) / self.mad
        } else if self.mean_ad > 0.0 {
            (value - self.median) / (MEAN_AD_SCALE * self.mean_ad)
        } else {
            return None;
        };
        z.is_finite().then_some(z)
    }
}

/// Net pay of one employee in the month under analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct NetSample {
    pub emp_id: String,
    pub dept: String,
    pub net: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRow {
    pub emp_id: String,
    pub dept: String,
    pub net: f64,
    pub median_net: f64,
    pub mad: f64,
    pub z: f64,
}

/// Scores every sample against its own department cohort and keeps those with
/// `|z| >= threshold`, largest first, at most `limit` rows.
pub fn detect_anomalies(samples: &[NetSample], threshold: f64, limit: usize) -> Vec<AnomalyRow> {
    let mut cohorts: BTreeMap<&str, Vec<&NetSample>> = BTreeMap::new();
    for sample in samples {
        cohorts.entry(sample.dept.as_str()).or_default().push(sample);
    }

    let mut flagged = Vec::new();
    for (dept, members) in cohorts {
        let nets: Vec<f64> = members.iter().map(|s| s.net).collect();
        let Some(stats) = CohortStats::from_values(&nets) else {
            continue;
        };
        for sample in members {
            let Some(z) = stats.robust_z(sample.net) else {
                continue;
            };
            if z.abs() >= threshold {
                flagged.push(AnomalyRow {
                    emp_id: sample.emp_id.clone(),
                    dept: dept.to_string(),
                    net: sample.net,
                    median_net: stats.median,
                    mad: stats.mad,
                    z,
                });
            }
        }
    }

    flagged.sort_by(|a, b| {
        b.z.abs()
            .total_cmp(&a.z.abs())
            .then_with(|| a.emp_id.cmp(&b.emp_id))
    });
    flagged.truncate(limit);
    flagged
}
