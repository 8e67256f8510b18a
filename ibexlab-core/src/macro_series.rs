//! Macro aggregator: irregular series onto the trading calendar.
//!
//! Alignment is last-observation-carried-forward and strictly backward
//! looking: the value on day `t` comes from the latest observation dated on
//! or before `t`. Dates before the first observation take the configured
//! default, or have no value at all.

use crate::config::MacroSourceConfig;
use crate::domain::{Checksum, DateRange, TradingCalendar};
use crate::error::PipelineError;
use crate::exogenous::sanitize_column;
use crate::lineage::{LineageLog, LineageRecord, Stage, StageRun};
use crate::store::{ArtifactKey, ArtifactStore, WriteOutcome};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFrequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Irregular,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacroObservation {
    pub observation_date: NaiveDate,
    pub value: f64,
}

/// Observations sorted by date, one per date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroSeries {
    pub indicator_name: String,
    observations: Vec<MacroObservation>,
    pub source_frequency: SourceFrequency,
}

impl MacroSeries {
    /// Sorts the observations; rejects duplicate dates and non-finite values.
    pub fn new(
        indicator_name: impl Into<String>,
        mut observations: Vec<MacroObservation>,
        source_frequency: SourceFrequency,
    ) -> Result<Self, PipelineError> {
        let indicator_name = indicator_name.into();
        observations.sort_by_key(|o| o.observation_date);
        if let Some(w) = observations
            .windows(2)
            .find(|w| w[0].observation_date == w[1].observation_date)
        {
            return Err(PipelineError::incomplete(
                format!("macro/{indicator_name}"),
                format!("duplicate observation date {}", w[0].observation_date),
            ));
        }
        if let Some(o) = observations.iter().find(|o| !o.value.is_finite()) {
            return Err(PipelineError::incomplete(
                format!("macro/{indicator_name}"),
                format!("non-finite value on {}", o.observation_date),
            ));
        }
        Ok(Self {
            indicator_name,
            observations,
            source_frequency,
        })
    }

    pub fn observations(&self) -> &[MacroObservation] {
        &self.observations
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.observations.first().map(|o| o.observation_date)
    }

    /// Latest observation dated on or before `date`.
    pub fn value_as_of(&self, date: NaiveDate) -> Option<f64> {
        let idx = self
            .observations
            .partition_point(|o| o.observation_date <= date);
        idx.checked_sub(1).map(|i| self.observations[i].value)
    }
}

pub fn macro_column_name(indicator: &str) -> String {
    format!("MACRO_{}", sanitize_column(indicator))
}

/// Strict alignment: every date must resolve, either from an observation or
/// from `default`.
pub fn align_series(
    series: &MacroSeries,
    dates: &[NaiveDate],
    default: Option<f64>,
) -> Result<Vec<f64>, PipelineError> {
    dates
        .iter()
        .map(|&date| {
            series
                .value_as_of(date)
                .or(default)
                .ok_or_else(|| PipelineError::InsufficientHistory {
                    indicator: series.indicator_name.clone(),
                    date,
                })
        })
        .collect()
}

/// Lenient alignment: unresolved dates are `None`.
pub fn align_lenient(series: &MacroSeries, dates: &[NaiveDate], default: Option<f64>) -> Vec<Option<f64>> {
    dates
        .iter()
        .map(|&date| series.value_as_of(date).or(default))
        .collect()
}

/// Daily column for one indicator, as committed to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroColumn {
    pub indicator: String,
    pub column_name: String,
    pub range: DateRange,
    pub dates: Vec<NaiveDate>,
    pub values: Vec<Option<f64>>,
    pub source_frequency: SourceFrequency,
}

impl MacroColumn {
    pub fn build(
        series: &MacroSeries,
        default: Option<f64>,
        range: &DateRange,
        calendar: &TradingCalendar,
    ) -> Self {
        let dates = calendar.trading_days(range);
        let values = align_lenient(series, &dates, default);
        Self {
            indicator: series.indicator_name.clone(),
            column_name: macro_column_name(&series.indicator_name),
            range: *range,
            dates,
            values,
            source_frequency: series.source_frequency,
        }
    }

    /// Value on `date`, or `InsufficientHistory` if the indicator has none.
    ///
    /// A date missing from the column entirely is also `InsufficientHistory`.
    pub fn require(&self, date: NaiveDate) -> Result<f64, PipelineError> {
        self.dates
            .binary_search(&date)
            .ok()
            .and_then(|i| self.values[i])
            .ok_or_else(|| PipelineError::InsufficientHistory {
                indicator: self.indicator.clone(),
                date,
            })
    }

    pub fn unresolved(&self) -> usize {
        self.values.iter().filter(|v| v.is_none()).count()
    }
}

/// A loaded series and the default configured for it.
#[derive(Debug, Clone)]
pub struct MacroInput {
    pub series: MacroSeries,
    pub default: Option<f64>,
    /// Checksum of the source bytes.
    pub source_checksum: Checksum,
    pub source_id: String,
}

/// Load one configured source. Relative paths resolve against `base_dir`.
pub fn load_source(
    name: &str,
    source: &MacroSourceConfig,
    base_dir: &Path,
) -> Result<MacroInput, PipelineError> {
    let path = if source.path.is_absolute() {
        source.path.clone()
    } else {
        base_dir.join(&source.path)
    };
    let bytes = std::fs::read(&path).map_err(|e| {
        PipelineError::incomplete(format!("macro source {}", path.display()), e.to_string())
    })?;
    let observations = parse_macro_csv(&bytes, &source.value_column).map_err(|reason| {
        PipelineError::incomplete(format!("macro source {}", path.display()), reason)
    })?;
    Ok(MacroInput {
        series: MacroSeries::new(name, observations, source.frequency)?,
        default: source.default,
        source_checksum: Checksum::of_bytes(&bytes),
        source_id: format!("source/macro/{}", path.display()),
    })
}

/// Parse `Date,<value_column>` CSV. Rows with a blank or unparseable value
/// are skipped.
pub fn parse_macro_csv(bytes: &[u8], value_column: &str) -> Result<Vec<MacroObservation>, String> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let headers = rdr.headers().map_err(|e| e.to_string())?.clone();
    let date_idx = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case("date"))
        .unwrap_or(0);
    let value_idx = headers
        .iter()
        .position(|h| h == value_column)
        .ok_or_else(|| format!("missing value column '{value_column}'"))?;

    let mut observations = Vec::new();
    for record in rdr.records() {
        let record = record.map_err(|e| e.to_string())?;
        let date = record
            .get(date_idx)
            .and_then(|s| NaiveDate::parse_from_str(s.get(..10).unwrap_or(s), "%Y-%m-%d").ok());
        let value = record.get(value_idx).and_then(|s| s.parse::<f64>().ok());
        if let (Some(observation_date), Some(value)) = (date, value) {
            if value.is_finite() {
                observations.push(MacroObservation {
                    observation_date,
                    value,
                });
            }
        }
    }
    Ok(observations)
}

/// Load every configured source, keyed by indicator name.
pub fn load_sources(
    sources: &BTreeMap<String, MacroSourceConfig>,
    base_dir: &Path,
) -> Result<Vec<MacroInput>, PipelineError> {
    sources
        .iter()
        .map(|(name, src)| load_source(name, src, base_dir))
        .collect()
}

#[derive(Debug, Clone)]
pub struct MacroAggregateOutcome {
    pub columns: Vec<MacroColumn>,
    pub writes: Vec<WriteOutcome>,
    pub record: LineageRecord,
}

#[derive(Serialize)]
struct MacroParams<'a> {
    range: &'a DateRange,
    calendar: &'a TradingCalendar,
    defaults: BTreeMap<&'a str, Option<f64>>,
}

/// Align every input onto the trading days of `range` and commit the columns.
pub fn run_macro_aggregator(
    inputs: &[MacroInput],
    calendar: &TradingCalendar,
    range: &DateRange,
    store: &ArtifactStore,
    lineage: &LineageLog,
) -> Result<MacroAggregateOutcome, PipelineError> {
    let params = MacroParams {
        range,
        calendar,
        defaults: inputs
            .iter()
            .map(|i| (i.series.indicator_name.as_str(), i.default))
            .collect(),
    };
    let mut run = StageRun::new(Stage::AggregateMacro).params(&params)?;

    let mut columns = Vec::with_capacity(inputs.len());
    let mut writes = Vec::with_capacity(inputs.len());
    for input in inputs {
        let column = MacroColumn::build(&input.series, input.default, range, calendar);
        if column.unresolved() > 0 {
            log::warn!(
                "{}: {} trading days before the first observation and no default",
                column.indicator,
                column.unresolved()
            );
        }
        let key = ArtifactKey::macro_column(&column.column_name, range);
        let write = store.put_json(&key, &column, Some(column.dates.len()))?;
        run = run
            .input(input.source_id.clone(), input.source_checksum.clone())
            .committed(&write)
            .rows(format!("{}_unresolved", column.column_name), column.unresolved());
        writes.push(write);
        columns.push(column);
    }
    columns.sort_by(|a, b| a.column_name.cmp(&b.column_name));
    let record = lineage.append(run)?;

    log::info!("aligned {} macro indicators onto {range}", columns.len());
    Ok(MacroAggregateOutcome {
        columns,
        writes,
        record,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn obs(date: &str, value: f64) -> MacroObservation {
        MacroObservation {
            observation_date: d(date),
            value,
        }
    }

    fn deposit_rate() -> MacroSeries {
        MacroSeries::new(
            "ECB_Deposit_Rate",
            vec![obs("2024-01-10", 4.0), obs("2024-01-03", 3.75)],
            SourceFrequency::Irregular,
        )
        .unwrap()
    }

    #[test]
    fn forward_fills_from_latest_past_observation() {
        let s = deposit_rate();
        assert_eq!(s.value_as_of(d("2024-01-03")), Some(3.75));
        assert_eq!(s.value_as_of(d("2024-01-09")), Some(3.75));
        assert_eq!(s.value_as_of(d("2024-01-10")), Some(4.0));
        assert_eq!(s.value_as_of(d("2024-02-01")), Some(4.0));
    }

    #[test]
    fn before_first_observation_needs_default() {
        let s = deposit_rate();
        let dates = [d("2024-01-02"), d("2024-01-03")];
        let err = align_series(&s, &dates, None).unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientHistory { .. }));
        assert_eq!(align_series(&s, &dates, Some(0.0)).unwrap(), vec![0.0, 3.75]);
        assert_eq!(align_lenient(&s, &dates, None), vec![None, Some(3.75)]);
    }

    #[test]
    fn duplicate_observation_dates_rejected() {
        let err = MacroSeries::new(
            "x",
            vec![obs("2024-01-03", 1.0), obs("2024-01-03", 2.0)],
            SourceFrequency::Daily,
        );
        assert!(err.is_err());
    }

    #[test]
    fn column_require_maps_to_insufficient_history() {
        let cal = TradingCalendar::weekdays();
        let range = DateRange::new(d("2024-01-01"), d("2024-01-12")).unwrap();
        let col = MacroColumn::build(&deposit_rate(), None, &range, &cal);
        assert_eq!(col.column_name, "MACRO_ECB_Deposit_Rate");
        assert_eq!(col.unresolved(), 2);
        assert!(col.require(d("2024-01-02")).is_err());
        assert_eq!(col.require(d("2024-01-11")).unwrap(), 4.0);
        // Saturday is not in the column.
        assert!(col.require(d("2024-01-06")).is_err());
    }

    #[test]
    fn parses_csv_and_skips_blank_values() {
        let csv = b"Date,DepositRate\n2024-01-03,3.75\n2024-02-01,\n2024-03-06,4.0\n";
        let o = parse_macro_csv(csv, "DepositRate").unwrap();
        assert_eq!(o.len(), 2);
        assert_eq!(o[1].value, 4.0);
        assert!(parse_macro_csv(csv, "Other").is_err());
    }

    #[test]
    fn aggregator_commits_columns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("rate.csv"),
            "Date,DepositRate\n2023-12-01,3.75\n2024-01-10,4.0\n",
        )
        .unwrap();
        let mut sources = BTreeMap::new();
        sources.insert(
            "ECB_Deposit_Rate".to_string(),
            MacroSourceConfig {
                path: "rate.csv".into(),
                value_column: "DepositRate".into(),
                frequency: SourceFrequency::Irregular,
                default: None,
            },
        );
        let inputs = load_sources(&sources, dir.path()).unwrap();
        let store = ArtifactStore::new(dir.path().join("cache"));
        let lineage = LineageLog::new(dir.path().join("lineage.jsonl"));
        let range = DateRange::new(d("2024-01-01"), d("2024-01-31")).unwrap();

        let out = run_macro_aggregator(&inputs, &TradingCalendar::weekdays(), &range, &store, &lineage)
            .unwrap();
        assert_eq!(out.columns[0].unresolved(), 0);
        assert_eq!(out.record.input_checksums.len(), 1);
        assert!(store.exists(&ArtifactKey::macro_column("MACRO_ECB_Deposit_Rate", &range)));
    }
}
