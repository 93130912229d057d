//! Neutral ↔ venue-native symbol translation.
//!
//! Neutral form is `BASE-QUOTE-KIND` (e.g. `BTC-USDC-PERP`). Explicit
//! per-venue maps win; otherwise an auto-rule derived from the venue's
//! format (separator, suffixes, base-only, quote remaps) is applied.
//! Reverse conversion prefers the reverse of the explicit map, then a
//! per-venue heuristic.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

/// Formatting rule for one venue's native symbols.
#[derive(Debug, Clone, Default)]
pub struct VenueFormat {
    pub separator: &'static str,
    pub perp_suffix: &'static str,
    pub spot_suffix: &'static str,
    /// Venue only speaks the base token (e.g. `BTC`).
    pub base_only: bool,
    /// Quote remaps applied before assembly, e.g. USDC → USD.
    pub quote_mapping: &'static [(&'static str, &'static str)],
}

pub struct SymbolConverter {
    formats: HashMap<String, VenueFormat>,
    direct: RwLock<HashMap<String, HashMap<String, String>>>,
    reverse: RwLock<Option<HashMap<String, HashMap<String, String>>>>,
}

impl Default for SymbolConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolConverter {
    pub fn new() -> Self {
        let mut formats = HashMap::new();
        formats.insert(
            "hyperliquid".to_string(),
            VenueFormat {
                base_only: true,
                ..VenueFormat::default()
            },
        );
        formats.insert(
            "lighter".to_string(),
            VenueFormat {
                base_only: true,
                ..VenueFormat::default()
            },
        );
        formats.insert(
            "backpack".to_string(),
            VenueFormat {
                separator: "_",
                perp_suffix: "_PERP",
                ..VenueFormat::default()
            },
        );
        formats.insert(
            "edgex".to_string(),
            VenueFormat {
                quote_mapping: &[("USDC", "USD")],
                ..VenueFormat::default()
            },
        );
        formats.insert(
            "paradex".to_string(),
            VenueFormat {
                separator: "-",
                perp_suffix: "-PERP",
                quote_mapping: &[("USDC", "USD")],
                ..VenueFormat::default()
            },
        );
        formats.insert(
            "standx".to_string(),
            VenueFormat {
                separator: "-",
                quote_mapping: &[("USDC", "USD"), ("DUSD", "USD")],
                ..VenueFormat::default()
            },
        );

        Self {
            formats,
            direct: RwLock::new(HashMap::new()),
            reverse: RwLock::new(None),
        }
    }

    /// Register an explicit mapping; wins over the auto-rule and
    /// invalidates the reverse cache.
    pub fn add_mapping(&self, venue: &str, neutral: &str, native: &str) {
        let venue_key = venue.to_lowercase();
        self.direct
            .write()
            .entry(venue_key)
            .or_default()
            .insert(neutral.to_string(), native.to_string());
        *self.reverse.write() = None;
    }

    /// Neutral → native. Falls back to the neutral form for venues with no
    /// rule (callers treat that as "unsupported", never silently mangled).
    pub fn to_exchange(&self, neutral: &str, venue: &str) -> String {
        let venue_key = venue.to_lowercase();
        if let Some(native) = self
            .direct
            .read()
            .get(&venue_key)
            .and_then(|map| map.get(neutral))
        {
            return native.clone();
        }
        let Some(format) = self.formats.get(&venue_key) else {
            debug!("⚠️ 不支持的交易所 {venue_key}，返回原始符号");
            return neutral.to_string();
        };
        auto_convert(neutral, format)
    }

    /// Native → neutral. Explicit reverse map first, then heuristics.
    pub fn from_exchange(&self, native: &str, venue: &str) -> String {
        let venue_key = venue.to_lowercase();
        self.ensure_reverse_cache();
        if let Some(neutral) = self
            .reverse
            .read()
            .as_ref()
            .and_then(|cache| cache.get(&venue_key))
            .and_then(|map| map.get(native))
        {
            return neutral.clone();
        }
        heuristic_from_exchange(native, &venue_key)
    }

    pub fn supported_venues(&self) -> Vec<String> {
        self.formats.keys().cloned().collect()
    }

    fn ensure_reverse_cache(&self) {
        if self.reverse.read().is_some() {
            return;
        }
        let direct = self.direct.read();
        let mut cache: HashMap<String, HashMap<String, String>> = HashMap::new();
        for (venue, map) in direct.iter() {
            let entry = cache.entry(venue.clone()).or_default();
            for (neutral, native) in map {
                entry.insert(native.clone(), neutral.clone());
            }
        }
        *self.reverse.write() = Some(cache);
    }
}

fn auto_convert(neutral: &str, format: &VenueFormat) -> String {
    let parts: Vec<&str> = neutral.split('-').collect();
    if parts.len() < 2 {
        return neutral.to_string();
    }
    let base = parts[0];
    if format.base_only {
        return base.to_string();
    }
    let mut quote = parts[1].to_string();
    for (from, to) in format.quote_mapping {
        if quote == *from {
            quote = to.to_string();
            break;
        }
    }
    let kind = parts.get(2).copied().unwrap_or("SPOT");
    let suffix = if kind == "PERP" {
        format.perp_suffix
    } else {
        format.spot_suffix
    };
    format!("{base}{}{quote}{suffix}", format.separator)
}

fn heuristic_from_exchange(native: &str, venue: &str) -> String {
    match venue {
        "lighter" | "hyperliquid" => {
            if let Some((base, rest)) = native.split_once('/') {
                // e.g. BTC/USDC:USDC
                let quote = rest.split(':').next().unwrap_or("USDC");
                let quote = if quote == "USD" { "USDC" } else { quote };
                return format!("{base}-{quote}-PERP");
            }
            if native.contains('-') {
                let parts: Vec<&str> = native.split('-').collect();
                let quote = if parts.get(1) == Some(&"USD") {
                    "USDC"
                } else {
                    parts.get(1).copied().unwrap_or("USDC")
                };
                return format!("{}-{quote}-PERP", parts[0]);
            }
            format!("{native}-USDC-PERP")
        }
        "edgex" => match native.strip_suffix("USD") {
            Some(base) if !base.is_empty() => format!("{base}-USDC-PERP"),
            _ => native.to_string(),
        },
        "backpack" => native.replace('_', "-"),
        "paradex" => {
            let parts: Vec<&str> = native.split('-').collect();
            if parts.len() >= 3 {
                let quote = if parts[1] == "USD" { "USDC" } else { parts[1] };
                return format!("{}-{quote}-{}", parts[0], parts[2]);
            }
            native.to_string()
        }
        "standx" => {
            let parts: Vec<&str> = native.split('-').collect();
            if parts.len() >= 2 {
                let quote = if parts[1] == "USD" { "USDC" } else { parts[1] };
                return format!("{}-{quote}-PERP", parts[0]);
            }
            native.to_string()
        }
        _ => native.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_rules_cover_known_venues() {
        let converter = SymbolConverter::new();
        assert_eq!(converter.to_exchange("BTC-USDC-PERP", "lighter"), "BTC");
        assert_eq!(converter.to_exchange("BTC-USDC-PERP", "hyperliquid"), "BTC");
        assert_eq!(
            converter.to_exchange("BTC-USDC-PERP", "backpack"),
            "BTC_USDC_PERP"
        );
        assert_eq!(converter.to_exchange("BTC-USDC-PERP", "edgex"), "BTCUSD");
        assert_eq!(
            converter.to_exchange("BTC-USDC-PERP", "paradex"),
            "BTC-USD-PERP"
        );
        assert_eq!(converter.to_exchange("BTC-USDC-PERP", "standx"), "BTC-USD");
    }

    #[test]
    fn reverse_heuristics_recover_neutral_form() {
        let converter = SymbolConverter::new();
        assert_eq!(converter.from_exchange("BTC", "lighter"), "BTC-USDC-PERP");
        assert_eq!(converter.from_exchange("ETHUSD", "edgex"), "ETH-USDC-PERP");
        assert_eq!(
            converter.from_exchange("SOL_USDC_PERP", "backpack"),
            "SOL-USDC-PERP"
        );
        assert_eq!(
            converter.from_exchange("BTC-USD-PERP", "paradex"),
            "BTC-USDC-PERP"
        );
        assert_eq!(converter.from_exchange("BTC-USD", "standx"), "BTC-USDC-PERP");
        assert_eq!(
            converter.from_exchange("BTC/USDC:USDC", "hyperliquid"),
            "BTC-USDC-PERP"
        );
    }

    #[test]
    fn explicit_map_round_trips() {
        let converter = SymbolConverter::new();
        converter.add_mapping("edgex", "HYPE-USDC-PERP", "HYPEUSD");
        converter.add_mapping("lighter", "PAXG-USDC-PERP", "PAXG");
        for (venue, neutral) in [("edgex", "HYPE-USDC-PERP"), ("lighter", "PAXG-USDC-PERP")] {
            let native = converter.to_exchange(neutral, venue);
            assert_eq!(converter.from_exchange(&native, venue), neutral);
        }
    }

    #[test]
    fn add_mapping_invalidates_reverse_cache() {
        let converter = SymbolConverter::new();
        // Prime the reverse cache.
        assert_eq!(converter.from_exchange("XAUUSD", "edgex"), "XAU-USDC-PERP");
        converter.add_mapping("edgex", "GOLD-USDC-PERP", "XAUUSD");
        assert_eq!(converter.from_exchange("XAUUSD", "edgex"), "GOLD-USDC-PERP");
    }

    #[test]
    fn unknown_venue_returns_input() {
        let converter = SymbolConverter::new();
        assert_eq!(
            converter.to_exchange("BTC-USDC-PERP", "unknown"),
            "BTC-USDC-PERP"
        );
    }
}
