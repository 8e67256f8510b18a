//! Universe tickers and their on-disk names.
//!
//! Index symbols carry a caret (`^IBEX`) that is awkward in file names, so
//! they are stored as `IDX_IBEX` and mapped back when a file stem is read.

use serde::{Deserialize, Serialize};

/// A tradable or reference asset from the universe config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Asset {
    pub symbol: String,
    pub name: String,
}

/// File stem for a ticker: `^IBEX` becomes `IDX_IBEX`.
pub fn file_stem_for(ticker: &str) -> String {
    match ticker.strip_prefix('^') {
        Some(rest) => format!("IDX_{rest}"),
        None => ticker.to_string(),
    }
}

/// Ticker for a file stem: `IDX_IBEX` becomes `^IBEX`.
pub fn ticker_from_stem(stem: &str) -> String {
    match stem.strip_prefix("IDX_") {
        Some(rest) => format!("^{rest}"),
        None => stem.to_string(),
    }
}
