//! Yahoo Finance chart API provider.
//!
//! One GET per symbol and range against the v8 chart endpoint, with bounded
//! timeouts and exponential backoff. All workers share one
//! [`CircuitBreaker`], so a ban seen by one fetch stops the others.
//!
//! The endpoint is unofficial and its payload can change without notice;
//! decoding failures surface as [`DataError::ResponseFormatChanged`] and the
//! CSV provider is the fallback.

use super::circuit_breaker::CircuitBreaker;
use super::provider::{DataError, DataProvider, DataSource, FetchResult};
use crate::config::FetchConfig;
use crate::domain::{DateRange, PriceBar};
use chrono::{NaiveDate, NaiveTime};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const CHART_ENDPOINT: &str = "https://query2.finance.yahoo.com/v8/finance/chart";

#[derive(Debug, Deserialize)]
struct Envelope {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<Series>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct Series {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<Quotes>,
    #[serde(default)]
    adjclose: Vec<AdjCloses>,
}

/// Column-oriented quotes; index `i` belongs to `timestamp[i]`.
#[derive(Debug, Deserialize)]
struct Quotes {
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<Option<f64>>,
    volume: Vec<Option<i64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloses {
    adjclose: Vec<Option<f64>>,
}

fn at<T: Copy>(column: &[Option<T>], i: usize) -> Option<T> {
    column.get(i).copied().flatten()
}

impl Quotes {
    /// Bar at index `i`, or `None` for the all-null rows Yahoo pads
    /// holidays with. Missing prices inside a real row become NaN for the
    /// normalizer to reject.
    fn bar(&self, ticker: &str, date: NaiveDate, i: usize, adj: Option<f64>) -> Option<PriceBar> {
        let (open, high, low, close) = (
            at(&self.open, i),
            at(&self.high, i),
            at(&self.low, i),
            at(&self.close, i),
        );
        if [open, high, low, close].iter().all(Option::is_none) {
            return None;
        }
        Some(PriceBar {
            ticker: ticker.to_string(),
            date,
            open: open.unwrap_or(f64::NAN),
            high: high.unwrap_or(f64::NAN),
            low: low.unwrap_or(f64::NAN),
            close: close.unwrap_or(f64::NAN),
            adjusted_close: adj.unwrap_or(f64::NAN),
            volume: at(&self.volume, i).unwrap_or(0),
            filled: false,
        })
    }
}

fn format_changed(msg: impl Into<String>) -> DataError {
    DataError::ResponseFormatChanged(msg.into())
}

/// Decode a chart payload into bars in delivery order.
fn decode(ticker: &str, envelope: Envelope) -> Result<Vec<PriceBar>, DataError> {
    let series = match (envelope.chart.result, envelope.chart.error) {
        (Some(mut results), _) if !results.is_empty() => results.swap_remove(0),
        (_, Some(err)) if err.code == "Not Found" => {
            return Err(DataError::SymbolNotFound {
                symbol: ticker.to_string(),
            })
        }
        (_, Some(err)) => return Err(format_changed(format!("{}: {}", err.code, err.description))),
        (_, None) => return Err(format_changed("chart has neither result nor error")),
    };

    let timestamps = series.timestamp.ok_or_else(|| format_changed("no timestamps"))?;
    let quotes = series
        .indicators
        .quote
        .first()
        .ok_or_else(|| format_changed("no quote block"))?;
    let adj = series.indicators.adjclose.first().map(|a| a.adjclose.as_slice());

    let mut bars = Vec::with_capacity(timestamps.len());
    for (i, &ts) in timestamps.iter().enumerate() {
        let date = chrono::DateTime::from_timestamp(ts, 0)
            .ok_or_else(|| format_changed(format!("timestamp out of range: {ts}")))?
            .date_naive();
        let adj_close = adj.and_then(|col| at(col, i));
        bars.extend(quotes.bar(ticker, date, i, adj_close));
    }

    if bars.is_empty() {
        return Err(DataError::SymbolNotFound {
            symbol: ticker.to_string(),
        });
    }
    Ok(bars)
}

/// What one HTTP attempt amounted to.
enum Attempt {
    Done(Vec<PriceBar>),
    /// Transient; worth another try after backoff.
    Retry(DataError),
}

pub struct YahooProvider {
    client: reqwest::blocking::Client,
    breaker: Arc<CircuitBreaker>,
    max_retries: u32,
    base_delay: Duration,
}

impl YahooProvider {
    pub fn new(config: &FetchConfig, breaker: Arc<CircuitBreaker>) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs.min(10)))
            .user_agent("Mozilla/5.0 (X11; Linux x86_64) ibexlab")
            .build()
            .map_err(|e| DataError::Other(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            breaker,
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
        })
    }

    /// Chart URL for an inclusive date range. `period2` is exclusive, so it
    /// points at midnight after the last day.
    fn url(symbol: &str, range: &DateRange) -> String {
        let midnight = |d: NaiveDate| d.and_time(NaiveTime::MIN).and_utc().timestamp();
        let from = midnight(range.start);
        let to = midnight(range.end + chrono::Duration::days(1));
        format!(
            "{CHART_ENDPOINT}/{}?period1={from}&period2={to}&interval=1d\
             &includeAdjustedClose=true&events=div%2Csplit",
            symbol.replace('^', "%5E")
        )
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    fn blocked(&self) -> DataError {
        log::warn!(
            "yahoo requests blocked for another {:?}",
            self.breaker.cooldown_left()
        );
        DataError::CircuitBreakerTripped
    }

    fn attempt(&self, symbol: &str, url: &str) -> Result<Attempt, DataError> {
        let resp = match self.client.get(url).send() {
            Ok(resp) => resp,
            Err(e) if e.is_connect() || e.is_timeout() => {
                return Ok(Attempt::Retry(DataError::NetworkUnreachable(e.to_string())))
            }
            Err(e) => return Err(DataError::NetworkUnreachable(e.to_string())),
        };

        match resp.status() {
            StatusCode::FORBIDDEN => {
                self.breaker.open();
                Err(DataError::CircuitBreakerTripped)
            }
            StatusCode::UNAUTHORIZED => Err(DataError::AuthenticationRequired(
                "chart endpoint asked for credentials".into(),
            )),
            StatusCode::NOT_FOUND => Err(DataError::SymbolNotFound {
                symbol: symbol.to_string(),
            }),
            StatusCode::TOO_MANY_REQUESTS => {
                self.breaker.on_failure();
                let retry_after_secs = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60);
                Ok(Attempt::Retry(DataError::RateLimited { retry_after_secs }))
            }
            status if !status.is_success() => {
                self.breaker.on_failure();
                Ok(Attempt::Retry(DataError::Other(format!("HTTP {status} for {symbol}"))))
            }
            _ => {
                let envelope: Envelope = resp
                    .json()
                    .map_err(|e| format_changed(format!("{symbol}: undecodable chart JSON: {e}")))?;
                let bars = decode(symbol, envelope)?;
                self.breaker.on_success();
                Ok(Attempt::Done(bars))
            }
        }
    }

    fn fetch_bars(&self, symbol: &str, range: &DateRange) -> Result<Vec<PriceBar>, DataError> {
        let url = Self::url(symbol, range);
        let mut last = DataError::Other(format!("{symbol}: no attempt made"));
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let delay = self.backoff(attempt);
                log::debug!("{symbol}: retry {attempt} in {delay:?} after: {last}");
                std::thread::sleep(delay);
            }
            if !self.breaker.allows() {
                return Err(self.blocked());
            }
            match self.attempt(symbol, &url)? {
                Attempt::Done(bars) => return Ok(bars),
                Attempt::Retry(err) => {
                    log::warn!("{symbol}: attempt {} failed: {err}", attempt + 1);
                    last = err;
                }
            }
        }
        Err(last)
    }
}

impl DataProvider for YahooProvider {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    fn fetch(&self, symbol: &str, range: &DateRange) -> Result<FetchResult, DataError> {
        Ok(FetchResult {
            symbol: symbol.to_string(),
            bars: self.fetch_bars(symbol, range)?,
            source: DataSource::YahooFinance,
        })
    }

    fn is_available(&self) -> bool {
        self.breaker.allows()
    }
}
