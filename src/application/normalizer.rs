//! Pure position normalization: broker-specific symbol cleanup, exchange
//! canonicalization, quantity and price rules. Same input always yields
//! the same output; nothing here performs I/O or fails loudly.

use crate::domain::broker::BrokerKind;
use crate::domain::portfolio::{NormalizedPosition, PositionSide, RawPosition, scale4};
use crate::domain::ports::AssetCatalog;
use rust_decimal::Decimal;
use tracing::warn;

/// Exchanges considered derivative venues for lot handling.
const DERIVATIVE_EXCHANGES: [&str; 2] = ["NFO", "MCX"];

const SYMBOL_SUFFIXES: [&str; 4] = ["-EQ", "-FO", "-CD", "-MCX"];

/// Canonical symbol for `raw_symbol` as reported by `kind`. Output is
/// uppercase `[A-Z0-9]` only; an empty result maps to `UNKNOWN`.
pub fn normalize_symbol(kind: BrokerKind, raw_symbol: &str, catalog: &dyn AssetCatalog) -> String {
    let upper = raw_symbol.trim().to_uppercase();

    let stripped = match kind {
        BrokerKind::Zerodha | BrokerKind::Iifl => upper,
        BrokerKind::AngelOne => strip_suffixes(upper),
        BrokerKind::Fyers => {
            let no_prefix = upper
                .strip_prefix("NSE:")
                .or_else(|| upper.strip_prefix("BSE:"))
                .unwrap_or(&upper)
                .to_string();
            strip_suffixes(no_prefix)
        }
        BrokerKind::Upstox => match upper.split_once('|').map(|(_, isin)| isin.to_string()) {
            Some(isin) => catalog.symbol_for_isin(&isin).unwrap_or(isin),
            None => upper,
        },
        BrokerKind::IciciDirect => upper
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string(),
    };

    let cleaned: String = stripped.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if cleaned.is_empty() {
        "UNKNOWN".to_string()
    } else {
        cleaned
    }
}

fn strip_suffixes(symbol: String) -> String {
    for suffix in SYMBOL_SUFFIXES {
        if let Some(stripped) = symbol.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    symbol
}

/// Canonical exchange code. Unknown values pass through unchanged;
/// missing values default to NSE.
pub fn normalize_exchange(raw: Option<&str>) -> String {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return "NSE".to_string();
    };
    let upper = raw.to_uppercase();
    match upper.as_str() {
        "NSE_EQ" => "NSE".to_string(),
        "NSE_FO" => "NFO".to_string(),
        "NSE_CD" => "CDS".to_string(),
        "BSE_EQ" => "BSE".to_string(),
        "MCX_FO" => "MCX".to_string(),
        "NCDEX_FO" => "NCDEX".to_string(),
        _ => upper,
    }
}

/// Side claimed by the broker's free-form position-type token, when the
/// token makes a claim at all.
fn claimed_side(position_type: Option<&str>) -> Option<PositionSide> {
    match position_type.map(|s| s.trim().to_uppercase()) {
        Some(t) if t == "LONG" || t == "BUY" || t == "B" => Some(PositionSide::Long),
        Some(t) if t == "SHORT" || t == "SELL" || t == "S" => Some(PositionSide::Short),
        _ => None,
    }
}

enum NormalizeIssue {
    /// Raw side token contradicts the signed quantity.
    Suspect(&'static str),
    /// Arithmetic rule failure; the position is preserved via fallback.
    Arithmetic(&'static str),
}

/// Normalize one raw position. Suspect positions (contradictory side
/// information) are excluded with `None`; every other rule failure falls
/// back to a raw-preserving record rather than dropping data.
pub fn normalize(
    kind: BrokerKind,
    raw: &RawPosition,
    catalog: &dyn AssetCatalog,
) -> Option<NormalizedPosition> {
    match try_normalize(kind, raw, catalog) {
        Ok(pos) => Some(pos),
        Err(NormalizeIssue::Suspect(reason)) => {
            warn!(
                broker = %kind,
                symbol = %raw.symbol,
                reason,
                "excluding suspect position"
            );
            None
        }
        Err(NormalizeIssue::Arithmetic(reason)) => {
            warn!(
                broker = %kind,
                symbol = %raw.symbol,
                reason,
                "normalization fell back to raw-preserving record"
            );
            Some(fallback(kind, raw))
        }
    }
}

fn try_normalize(
    kind: BrokerKind,
    raw: &RawPosition,
    catalog: &dyn AssetCatalog,
) -> Result<NormalizedPosition, NormalizeIssue> {
    let side = if raw.quantity < 0 {
        PositionSide::Short
    } else {
        PositionSide::Long
    };
    if let Some(claimed) = claimed_side(raw.position_type.as_deref()) {
        if raw.quantity != 0 && claimed != side {
            return Err(NormalizeIssue::Suspect("side token disagrees with quantity sign"));
        }
    }

    let normalized_symbol = normalize_symbol(kind, &raw.symbol, catalog);
    let normalized_exchange = normalize_exchange(raw.exchange.as_deref());

    let mut quantity = raw
        .quantity
        .checked_abs()
        .ok_or(NormalizeIssue::Arithmetic("quantity out of range"))?;

    if DERIVATIVE_EXCHANGES.contains(&normalized_exchange.as_str())
        && catalog.reports_in_lots(kind, &normalized_exchange)
    {
        let lot = catalog.lot_size(&normalized_symbol).unwrap_or(1) as i64;
        quantity = quantity
            .checked_mul(lot)
            .ok_or(NormalizeIssue::Arithmetic("lot multiplication overflow"))?;
    }

    Ok(NormalizedPosition {
        original_symbol: raw.symbol.clone(),
        normalized_symbol,
        original_exchange: raw.exchange.clone(),
        normalized_exchange,
        quantity,
        side,
        avg_price: scale4(raw.avg_price),
        last_traded_price: scale4(raw.last_traded_price),
        pnl: raw.pnl,
        day_change: raw.day_change.unwrap_or(Decimal::ZERO),
        broker: kind,
        connection_id: raw.connection_id,
    })
}

/// Raw-preserving record used when a normalization rule fails: cleaned
/// uppercase symbol, raw or default exchange, absolute quantity,
/// everything else zeroed.
fn fallback(kind: BrokerKind, raw: &RawPosition) -> NormalizedPosition {
    let cleaned: String = raw
        .symbol
        .trim()
        .to_uppercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    NormalizedPosition {
        original_symbol: raw.symbol.clone(),
        normalized_symbol: if cleaned.is_empty() { "UNKNOWN".into() } else { cleaned },
        original_exchange: raw.exchange.clone(),
        normalized_exchange: raw.exchange.clone().unwrap_or_else(|| "NSE".into()),
        quantity: raw.quantity.checked_abs().unwrap_or(0),
        side: if raw.quantity < 0 { PositionSide::Short } else { PositionSide::Long },
        avg_price: Decimal::ZERO,
        last_traded_price: Decimal::ZERO,
        pnl: Decimal::ZERO,
        day_change: Decimal::ZERO,
        broker: kind,
        connection_id: raw.connection_id,
    }
}
