pub mod bollinger_rev;
pub mod ema_trend;
