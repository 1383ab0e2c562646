// =============================================================================
// Symbol metadata — pip sizes, default spreads, provider name forms
// =============================================================================
//
// Symbols are plain 6-letter pair strings (EURUSD, GBPUSD, XAUUSD). Every
// provider spells them differently:
//   slash form      EUR/USD         (TwelveData)
//   venue form      OANDA:EUR_USD   (Finnhub / broker feed)
//   suffix form     EURUSD=X        (Yahoo)
// Gold and silver are treated exactly like a 6-letter pair.
// =============================================================================

/// Strip venue prefixes, separators and suffixes down to the bare pair.
///
/// `"OANDA:EUR_USD"` -> `"EURUSD"`, `"XAUUSD=X"` -> `"XAUUSD"`.
pub fn base_symbol(symbol: &str) -> String {
    let s = symbol.to_uppercase();
    let s = s.rsplit(':').next().unwrap_or(&s);
    s.replace("=X", "").replace(['/', '_'], "")
}

/// Pip size for a symbol: 0.0001 for major FX, 0.01 for JPY quotes, 0.1 for
/// gold (one $0.10 move counts as a pip in R arithmetic).
pub fn pip_size(symbol: &str) -> f64 {
    let s = base_symbol(symbol);
    if s.contains("XAU") {
        0.1
    } else if s.contains("JPY") {
        0.01
    } else {
        0.0001
    }
}

/// Typical spread in pips when the schedule does not override it.
pub fn default_spread(symbol: &str) -> f64 {
    let s = base_symbol(symbol);
    if s.contains("XAU") {
        2.5
    } else if s.contains("GBP") {
        0.9
    } else if s.contains("EUR") {
        0.6
    } else {
        1.0
    }
}

/// `EURUSD` -> `EUR/USD`.
pub fn slash_form(symbol: &str) -> String {
    let s = base_symbol(symbol);
    if s.len() == 6 {
        format!("{}/{}", &s[..3], &s[3..])
    } else {
        s
    }
}

/// `EURUSD` -> `EUR_USD` (no venue prefix). This is the broker instrument name.
pub fn instrument(symbol: &str) -> String {
    let s = base_symbol(symbol);
    if s.len() == 6 {
        format!("{}_{}", &s[..3], &s[3..])
    } else {
        s
    }
}

/// `EURUSD` + venue `OANDA` -> `OANDA:EUR_USD`.
pub fn venue_form(symbol: &str, venue: &str) -> String {
    format!("{}:{}", venue, instrument(symbol))
}

/// `EURUSD` -> `EURUSD=X`.
pub fn suffix_form(symbol: &str) -> String {
    let s = base_symbol(symbol);
    if s.len() == 6 {
        format!("{s}=X")
    } else {
        s
    }
}

/// `EUR_USD` or `OANDA:EUR_USD` -> `EURUSD`.
pub fn from_instrument(instrument: &str) -> String {
    base_symbol(instrument)
}

/// The currencies a symbol exposes, for the news gate. Standard pairs split
/// into base + quote; gold and silver count as USD-quoted.
pub fn currencies(symbol: &str) -> Vec<String> {
    let s = base_symbol(symbol);
    let mut out = Vec::new();
    if s.len() == 6 {
        out.push(s[..3].to_string());
        out.push(s[3..].to_string());
    }
    if (s.contains("XAU") || s.contains("XAG")) && !out.iter().any(|c| c == "USD") {
        out.push("USD".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_symbol_strips_provider_forms() {
        assert_eq!(base_symbol("OANDA:EUR_USD"), "EURUSD");
        assert_eq!(base_symbol("EUR/USD"), "EURUSD");
        assert_eq!(base_symbol("eurusd=x"), "EURUSD");
        assert_eq!(base_symbol("XAUUSD"), "XAUUSD");
    }

    #[test]
    fn pip_sizes() {
        assert_eq!(pip_size("EURUSD"), 0.0001);
        assert_eq!(pip_size("GBPUSD"), 0.0001);
        assert_eq!(pip_size("USDJPY"), 0.01);
        assert_eq!(pip_size("XAUUSD"), 0.1);
    }

    #[test]
    fn default_spreads() {
        assert_eq!(default_spread("EURUSD"), 0.6);
        assert_eq!(default_spread("GBPUSD"), 0.9);
        assert_eq!(default_spread("XAUUSD"), 2.5);
        assert_eq!(default_spread("USDCAD"), 1.0);
    }

    #[test]
    fn provider_forms() {
        assert_eq!(slash_form("EURUSD"), "EUR/USD");
        assert_eq!(venue_form("EURUSD", "OANDA"), "OANDA:EUR_USD");
        assert_eq!(suffix_form("EURUSD"), "EURUSD=X");
        assert_eq!(instrument("GBPUSD"), "GBP_USD");
        // Gold behaves like any other pair.
        assert_eq!(slash_form("XAUUSD"), "XAU/USD");
        assert_eq!(venue_form("XAUUSD", "OANDA"), "OANDA:XAU_USD");
    }

    #[test]
    fn instrument_round_trip() {
        assert_eq!(from_instrument(&instrument("EURUSD")), "EURUSD");
        assert_eq!(from_instrument("OANDA:XAU_USD"), "XAUUSD");
    }

    #[test]
    fn currency_split() {
        assert_eq!(currencies("EURUSD"), vec!["EUR", "USD"]);
        assert_eq!(currencies("XAUUSD"), vec!["XAU", "USD"]);
        assert_eq!(currencies("USDJPY"), vec!["USD", "JPY"]);
    }
}
