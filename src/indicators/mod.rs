pub mod atr;
pub mod bollinger;
pub mod ema;

pub use atr::{atr, atr_series};
pub use bollinger::{bollinger, BollingerBands};
pub use ema::ema_series;
