//! Empirical Type I / Type II error rates from persisted results

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::compare::{Method, NullModel};
use crate::config::Thresholds;
use crate::datagen::Regime;
use crate::store::ResultRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// Null true, rejected
    TypeI,
    /// Null false, not rejected
    TypeII,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::TypeI => "Type I",
            ErrorKind::TypeII => "Type II",
        })
    }
}

/// Error-rate summary for one (regime, null model) group
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRateRow {
    pub regime: Regime,
    pub null_model: NullModel,
    pub kind: ErrorKind,
    pub total: usize,
    pub missing: usize,
    pub valid: usize,
    pub errors: usize,
    /// `errors / valid`; absent when no result is valid
    pub rate: Option<f64>,
    /// Fraction of valid Bayes factors below the accept-null threshold
    pub evidence_for_null: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRateTable {
    pub method: Method,
    pub rows: Vec<ErrorRateRow>,
}

impl ErrorRateTable {
    pub fn get(&self, regime: Regime, null_model: NullModel) -> Option<&ErrorRateRow> {
        self.rows
            .iter()
            .find(|r| r.regime == regime && r.null_model == null_model)
    }
}

/// Whether a statistic rejects its null under `method`
pub fn rejects(method: Method, statistic: f64, thresholds: &Thresholds) -> bool {
    match method {
        Method::Bayesian => statistic > thresholds.bf_reject,
        Method::Frequentist => statistic < thresholds.alpha,
    }
}

/// Group rows by regime and null model and count decision errors
pub fn compute_error_rates(
    rows: &[ResultRow],
    method: Method,
    thresholds: &Thresholds,
) -> ErrorRateTable {
    let mut groups: BTreeMap<(Regime, NullModel), Vec<Option<f64>>> = BTreeMap::new();
    for row in rows {
        groups
            .entry((row.regime, row.null_model))
            .or_default()
            .push(row.statistic.filter(|v| !v.is_nan()));
    }

    let rows = groups
        .into_iter()
        .map(|((regime, null_model), statistics)| {
            let total = statistics.len();
            let valid: Vec<f64> = statistics.into_iter().flatten().collect();
            let kind = if null_model.null_is_true(regime) {
                ErrorKind::TypeI
            } else {
                ErrorKind::TypeII
            };
            let errors = valid
                .iter()
                .filter(|&&s| rejects(method, s, thresholds) == (kind == ErrorKind::TypeI))
                .count();
            let fraction = |count: usize| {
                (!valid.is_empty()).then(|| count as f64 / valid.len() as f64)
            };
            let evidence_for_null = match method {
                Method::Bayesian => {
                    fraction(valid.iter().filter(|&&s| s < thresholds.bf_accept_null).count())
                }
                Method::Frequentist => None,
            };

            ErrorRateRow {
                regime,
                null_model,
                kind,
                total,
                missing: total - valid.len(),
                valid: valid.len(),
                errors,
                rate: fraction(errors),
                evidence_for_null,
            }
        })
        .collect();

    ErrorRateTable { method, rows }
}

fn percent(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.1}%", 100.0 * v))
}

impl fmt::Display for ErrorRateTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error rates ({})", self.method)?;
        writeln!(
            f,
            "{:<10} {:<5} {:<8} {:>6} {:>6} {:>7} {:>8}{}",
            "regime",
            "null",
            "kind",
            "valid",
            "missing",
            "errors",
            "rate",
            if self.method == Method::Bayesian {
                "  BF<1/3"
            } else {
                ""
            }
        )?;
        for row in &self.rows {
            write!(
                f,
                "{:<10} {:<5} {:<8} {:>6} {:>6} {:>7} {:>8}",
                row.regime.tag(),
                row.null_model.as_str(),
                row.kind.to_string(),
                row.valid,
                row.missing,
                row.errors,
                percent(row.rate)
            )?;
            if self.method == Method::Bayesian {
                write!(f, "  {:>7}", percent(row.evidence_for_null))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(regime: Regime, null_model: NullModel, statistic: Option<f64>) -> ResultRow {
        ResultRow {
            regime,
            null_model,
            statistic,
        }
    }

    #[test]
    fn test_type_one_rates_over_valid_results() {
        let rows = vec![
            row(Regime::NullBoth, NullModel::A, Some(0.01)),
            row(Regime::NullBoth, NullModel::A, Some(0.30)),
            row(Regime::NullBoth, NullModel::A, Some(0.70)),
            row(Regime::NullBoth, NullModel::A, None),
        ];
        let table = compute_error_rates(&rows, Method::Frequentist, &Thresholds::default());
        let a = table.get(Regime::NullBoth, NullModel::A).unwrap();
        assert_eq!(a.kind, ErrorKind::TypeI);
        assert_eq!((a.total, a.missing, a.valid, a.errors), (4, 1, 3, 1));
        assert!((a.rate.unwrap() - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(a.evidence_for_null, None);
    }

    #[test]
    fn test_type_two_for_bayes_factors() {
        // Fixed effect present: B is a false null, so BF <= 3 is an error
        let rows = vec![
            row(Regime::NullRe, NullModel::B, Some(120.0)),
            row(Regime::NullRe, NullModel::B, Some(f64::INFINITY)),
            row(Regime::NullRe, NullModel::B, Some(2.0)),
            row(Regime::NullRe, NullModel::B, Some(0.1)),
        ];
        let table = compute_error_rates(&rows, Method::Bayesian, &Thresholds::default());
        let b = table.get(Regime::NullRe, NullModel::B).unwrap();
        assert_eq!(b.kind, ErrorKind::TypeII);
        assert_eq!(b.errors, 2);
        assert_eq!(b.rate, Some(0.5));
        assert_eq!(b.evidence_for_null, Some(0.25));
    }

    #[test]
    fn test_all_missing_has_no_rate() {
        let rows = vec![
            row(Regime::NullFe, NullModel::C1, None),
            row(Regime::NullFe, NullModel::C1, None),
        ];
        let table = compute_error_rates(&rows, Method::Bayesian, &Thresholds::default());
        let c1 = &table.rows[0];
        assert_eq!(c1.kind, ErrorKind::TypeII);
        assert_eq!((c1.missing, c1.valid), (2, 0));
        assert_eq!(c1.rate, None);
        assert!(table.to_string().contains("null_fe"));
    }

    #[test]
    fn test_threshold_boundaries_do_not_reject() {
        let t = Thresholds::default();
        assert!(!rejects(Method::Bayesian, 3.0, &t));
        assert!(rejects(Method::Bayesian, 3.0001, &t));
        assert!(!rejects(Method::Frequentist, 0.05, &t));
        assert!(rejects(Method::Frequentist, 0.0499, &t));
    }

    #[test]
    fn test_table_serialises() {
        let rows = vec![row(Regime::NullNone, NullModel::C2, Some(0.2))];
        let table = compute_error_rates(&rows, Method::Frequentist, &Thresholds::default());
        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(json["method"], "frequentist");
        assert_eq!(json["rows"][0]["kind"], "TypeII");
        assert_eq!(json["rows"][0]["rate"], 1.0);
    }
}
