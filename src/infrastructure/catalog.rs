//! Static asset master data: a built-in table of well-known NSE symbols
//! used directly as an `AssetCatalog`, and as the enrichment fallback when
//! an injected catalog has no answer.

use crate::domain::broker::BrokerKind;
use crate::domain::ports::AssetCatalog;
use rust_decimal::Decimal;

pub struct AssetInfo {
    pub symbol: &'static str,
    pub isin: &'static str,
    pub company_name: &'static str,
    pub sector: &'static str,
    pub asset_class: &'static str,
    /// Market cap in INR crores.
    pub market_cap_cr: i64,
}

static WELL_KNOWN: &[AssetInfo] = &[
    AssetInfo {
        symbol: "RELIANCE",
        isin: "INE002A01018",
        company_name: "Reliance Industries Ltd",
        sector: "Energy",
        asset_class: "EQUITY",
        market_cap_cr: 1_900_000,
    },
    AssetInfo {
        symbol: "TCS",
        isin: "INE467B01029",
        company_name: "Tata Consultancy Services Ltd",
        sector: "Information Technology",
        asset_class: "EQUITY",
        market_cap_cr: 1_400_000,
    },
    AssetInfo {
        symbol: "HDFCBANK",
        isin: "INE040A01034",
        company_name: "HDFC Bank Ltd",
        sector: "Financial Services",
        asset_class: "EQUITY",
        market_cap_cr: 1_300_000,
    },
    AssetInfo {
        symbol: "INFY",
        isin: "INE009A01021",
        company_name: "Infosys Ltd",
        sector: "Information Technology",
        asset_class: "EQUITY",
        market_cap_cr: 600_000,
    },
    AssetInfo {
        symbol: "ICICIBANK",
        isin: "INE090A01021",
        company_name: "ICICI Bank Ltd",
        sector: "Financial Services",
        asset_class: "EQUITY",
        market_cap_cr: 800_000,
    },
    AssetInfo {
        symbol: "SBIN",
        isin: "INE062A01020",
        company_name: "State Bank of India",
        sector: "Financial Services",
        asset_class: "EQUITY",
        market_cap_cr: 700_000,
    },
    AssetInfo {
        symbol: "BHARTIARTL",
        isin: "INE397D01024",
        company_name: "Bharti Airtel Ltd",
        sector: "Telecommunication",
        asset_class: "EQUITY",
        market_cap_cr: 900_000,
    },
    AssetInfo {
        symbol: "ITC",
        isin: "INE154A01025",
        company_name: "ITC Ltd",
        sector: "Consumer Goods",
        asset_class: "EQUITY",
        market_cap_cr: 550_000,
    },
    AssetInfo {
        symbol: "TATAMOTORS",
        isin: "INE155A01022",
        company_name: "Tata Motors Ltd",
        sector: "Automobile",
        asset_class: "EQUITY",
        market_cap_cr: 300_000,
    },
    AssetInfo {
        symbol: "NIFTYBEES",
        isin: "INF204KB14I2",
        company_name: "Nippon India ETF Nifty 50 BeES",
        sector: "Index Fund",
        asset_class: "ETF",
        market_cap_cr: 30_000,
    },
];

pub fn lookup(symbol: &str) -> Option<&'static AssetInfo> {
    WELL_KNOWN.iter().find(|a| a.symbol == symbol)
}

pub fn lookup_isin(isin: &str) -> Option<&'static AssetInfo> {
    WELL_KNOWN.iter().find(|a| a.isin == isin)
}

/// Derivative futures lot sizes for symbols commonly traded on NFO.
static LOT_SIZES: &[(&str, u32)] = &[
    ("NIFTY", 50),
    ("BANKNIFTY", 15),
    ("RELIANCE", 250),
    ("TCS", 175),
    ("HDFCBANK", 550),
    ("SBIN", 1500),
];

pub struct StaticAssetCatalog;

impl AssetCatalog for StaticAssetCatalog {
    fn company_name(&self, symbol: &str) -> Option<String> {
        lookup(symbol).map(|a| a.company_name.to_string())
    }

    fn sector(&self, symbol: &str) -> Option<String> {
        lookup(symbol).map(|a| a.sector.to_string())
    }

    fn asset_class(&self, symbol: &str) -> Option<String> {
        lookup(symbol).map(|a| a.asset_class.to_string())
    }

    fn market_cap(&self, symbol: &str) -> Option<Decimal> {
        lookup(symbol).map(|a| Decimal::from(a.market_cap_cr) * Decimal::from(10_000_000_i64))
    }

    fn lot_size(&self, symbol: &str) -> Option<u32> {
        LOT_SIZES
            .iter()
            .find(|(s, _)| symbol.starts_with(s))
            .map(|(_, lot)| *lot)
    }

    fn symbol_for_isin(&self, isin: &str) -> Option<String> {
        lookup_isin(isin).map(|a| a.symbol.to_string())
    }

    fn is_derivative(&self, symbol: &str) -> bool {
        symbol.ends_with("FUT") || symbol.contains("CE") && symbol.chars().any(|c| c.is_ascii_digit())
    }

    fn is_etf(&self, symbol: &str) -> bool {
        lookup(symbol).map(|a| a.asset_class == "ETF").unwrap_or(false)
    }

    fn reports_in_lots(&self, broker: BrokerKind, exchange: &str) -> bool {
        // Of the reference brokers only ICICI Direct reports derivative
        // quantities in lots; everyone else reports units.
        broker == BrokerKind::IciciDirect && matches!(exchange, "NFO" | "MCX")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isin_lookup_maps_to_symbol() {
        let catalog = StaticAssetCatalog;
        assert_eq!(
            catalog.symbol_for_isin("INE002A01018").as_deref(),
            Some("RELIANCE")
        );
        assert_eq!(catalog.symbol_for_isin("INE000000000"), None);
    }

    #[test]
    fn enrichment_fields_present_for_well_known() {
        let catalog = StaticAssetCatalog;
        assert_eq!(catalog.sector("TCS").as_deref(), Some("Information Technology"));
        assert_eq!(catalog.asset_class("NIFTYBEES").as_deref(), Some("ETF"));
        assert!(catalog.is_etf("NIFTYBEES"));
        assert!(!catalog.is_etf("TCS"));
    }

    #[test]
    fn lot_policy_only_for_icici_derivatives() {
        let catalog = StaticAssetCatalog;
        assert!(catalog.reports_in_lots(BrokerKind::IciciDirect, "NFO"));
        assert!(!catalog.reports_in_lots(BrokerKind::IciciDirect, "NSE"));
        assert!(!catalog.reports_in_lots(BrokerKind::Zerodha, "NFO"));
    }
}
