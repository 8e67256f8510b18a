//! Domain types shared by every pipeline stage.

pub mod bar;
pub mod calendar;
pub mod ids;
pub mod ticker;

pub use bar::{PriceBar, PriceSeries};
pub use calendar::{CalendarKind, DateRange, TradingCalendar};
pub use ids::{Checksum, ConfigHash, RunId, ScalerId};
pub use ticker::{file_stem_for, ticker_from_stem, Asset};
