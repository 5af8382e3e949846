//! Broker identities and their static capability profiles.
//!
//! The profile table is part of the binary contract of a release: changing
//! an endpoint or a capability flag requires a new build, there is no
//! runtime registration.

use crate::domain::orders::OrderType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BrokerKind {
    Zerodha,
    Upstox,
    AngelOne,
    IciciDirect,
    Fyers,
    Iifl,
}

impl BrokerKind {
    pub const ALL: [BrokerKind; 6] = [
        BrokerKind::Zerodha,
        BrokerKind::Upstox,
        BrokerKind::AngelOne,
        BrokerKind::IciciDirect,
        BrokerKind::Fyers,
        BrokerKind::Iifl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerKind::Zerodha => "zerodha",
            BrokerKind::Upstox => "upstox",
            BrokerKind::AngelOne => "angel_one",
            BrokerKind::IciciDirect => "icici_direct",
            BrokerKind::Fyers => "fyers",
            BrokerKind::Iifl => "iifl",
        }
    }

    pub fn profile(&self) -> &'static BrokerProfile {
        profile(*self)
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "zerodha" | "kite" => Ok(BrokerKind::Zerodha),
            "upstox" => Ok(BrokerKind::Upstox),
            "angel_one" | "angelone" | "angel" => Ok(BrokerKind::AngelOne),
            "icici_direct" | "icici" | "breeze" => Ok(BrokerKind::IciciDirect),
            "fyers" => Ok(BrokerKind::Fyers),
            "iifl" => Ok(BrokerKind::Iifl),
            _ => Err(format!("unknown broker: {}", s)),
        }
    }
}

/// Latency class of a broker's API, used to size HTTP timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    /// connect 30s, request 45s
    Fast,
    /// connect 45s, request 90s
    Slow,
}

#[derive(Debug)]
pub struct BrokerProfile {
    pub kind: BrokerKind,
    pub display_name: &'static str,
    pub base_url: &'static str,
    pub ws_url: &'static str,
    pub docs_url: &'static str,
    pub authorize_url: &'static str,
    pub token_url: &'static str,
    /// Cheap whoami endpoint used by health probes, relative to `base_url`.
    pub profile_path: &'static str,
    pub scope: &'static str,
    pub rate_limit_per_sec: u32,
    pub order_types: &'static [OrderType],
    pub exchanges: &'static [&'static str],
    pub supports_bracket: bool,
    pub supports_streaming: bool,
    pub supports_refresh: bool,
    /// Profile-declared execution cost in basis points; the router prefers
    /// the lowest among eligible brokers.
    pub execution_cost_bps: u32,
    pub timeout_class: TimeoutClass,
}

impl BrokerProfile {
    pub fn supports_order_type(&self, order_type: OrderType) -> bool {
        self.order_types.contains(&order_type)
    }

    pub fn supports_exchange(&self, exchange: &str) -> bool {
        self.exchanges.iter().any(|e| e.eq_ignore_ascii_case(exchange))
    }
}

static ZERODHA: BrokerProfile = BrokerProfile {
    kind: BrokerKind::Zerodha,
    display_name: "Zerodha Kite",
    base_url: "https://api.kite.trade",
    ws_url: "wss://ws.kite.trade",
    docs_url: "https://kite.trade/docs/connect/v3",
    authorize_url: "https://kite.zerodha.com/connect/login",
    token_url: "https://api.kite.trade/session/token",
    profile_path: "/user/profile",
    scope: "",
    rate_limit_per_sec: 3,
    order_types: &[
        OrderType::Market,
        OrderType::Limit,
        OrderType::StopLoss,
        OrderType::Bracket,
    ],
    exchanges: &["NSE", "BSE", "NFO", "CDS", "MCX"],
    supports_bracket: true,
    supports_streaming: true,
    supports_refresh: false,
    execution_cost_bps: 3,
    timeout_class: TimeoutClass::Fast,
};

static UPSTOX: BrokerProfile = BrokerProfile {
    kind: BrokerKind::Upstox,
    display_name: "Upstox",
    base_url: "https://api.upstox.com",
    ws_url: "wss://api.upstox.com/v2/feed",
    docs_url: "https://upstox.com/developer/api-documentation",
    authorize_url: "https://api.upstox.com/v2/login/authorization/dialog",
    token_url: "https://api.upstox.com/v2/login/authorization/token",
    profile_path: "/v2/user/profile",
    scope: "orders holdings profile",
    rate_limit_per_sec: 5,
    order_types: &[OrderType::Market, OrderType::Limit, OrderType::StopLoss],
    exchanges: &["NSE", "BSE", "NFO", "CDS", "MCX"],
    supports_bracket: false,
    supports_streaming: true,
    supports_refresh: true,
    execution_cost_bps: 2,
    timeout_class: TimeoutClass::Fast,
};

static ANGEL_ONE: BrokerProfile = BrokerProfile {
    kind: BrokerKind::AngelOne,
    display_name: "Angel One",
    base_url: "https://apiconnect.angelbroking.com",
    ws_url: "wss://smartapisocket.angelone.in/smart-stream",
    docs_url: "https://smartapi.angelbroking.com/docs",
    authorize_url: "https://smartapi.angelbroking.com/publisher-login",
    token_url: "https://apiconnect.angelbroking.com/rest/auth/angelbroking/jwt/v1/generateTokens",
    profile_path: "/rest/secure/angelbroking/user/v1/getProfile",
    scope: "trade",
    rate_limit_per_sec: 3,
    order_types: &[
        OrderType::Market,
        OrderType::Limit,
        OrderType::StopLoss,
        OrderType::Bracket,
    ],
    exchanges: &["NSE", "BSE", "NFO", "MCX"],
    supports_bracket: true,
    supports_streaming: true,
    supports_refresh: true,
    execution_cost_bps: 4,
    timeout_class: TimeoutClass::Slow,
};

static ICICI_DIRECT: BrokerProfile = BrokerProfile {
    kind: BrokerKind::IciciDirect,
    display_name: "ICICI Direct",
    base_url: "https://api.icicidirect.com",
    ws_url: "wss://livestream.icicidirect.com",
    docs_url: "https://api.icicidirect.com/apiuser/home",
    authorize_url: "https://api.icicidirect.com/apiuser/login",
    token_url: "https://api.icicidirect.com/breezeapi/api/v1/customerdetails",
    profile_path: "/breezeapi/api/v1/customerdetails",
    scope: "",
    rate_limit_per_sec: 2,
    order_types: &[OrderType::Market, OrderType::Limit, OrderType::StopLoss],
    exchanges: &["NSE", "BSE", "NFO"],
    supports_bracket: false,
    supports_streaming: true,
    supports_refresh: false,
    execution_cost_bps: 5,
    timeout_class: TimeoutClass::Slow,
};

static FYERS: BrokerProfile = BrokerProfile {
    kind: BrokerKind::Fyers,
    display_name: "Fyers",
    base_url: "https://api.fyers.in",
    ws_url: "wss://api.fyers.in/socket/v2/dataSock",
    docs_url: "https://myapi.fyers.in/docs",
    authorize_url: "https://api.fyers.in/api/v2/generate-authcode",
    token_url: "https://api.fyers.in/api/v2/validate-authcode",
    profile_path: "/api/v2/profile",
    scope: "openapi",
    rate_limit_per_sec: 3,
    order_types: &[
        OrderType::Market,
        OrderType::Limit,
        OrderType::StopLoss,
        OrderType::Bracket,
    ],
    exchanges: &["NSE", "BSE", "NFO", "MCX"],
    supports_bracket: true,
    supports_streaming: true,
    supports_refresh: true,
    execution_cost_bps: 3,
    timeout_class: TimeoutClass::Fast,
};

static IIFL: BrokerProfile = BrokerProfile {
    kind: BrokerKind::Iifl,
    display_name: "IIFL Securities",
    base_url: "https://ttblaze.iifl.com",
    ws_url: "wss://ttblaze.iifl.com/apimarketdata/socket.io",
    docs_url: "https://symphonyfintech.com/xts-trading-front-end-api",
    authorize_url: "https://ttblaze.iifl.com/interactive/user/session",
    token_url: "https://ttblaze.iifl.com/interactive/user/session",
    profile_path: "/interactive/user/profile",
    scope: "interactive",
    rate_limit_per_sec: 1,
    order_types: &[OrderType::Market, OrderType::Limit, OrderType::StopLoss],
    exchanges: &["NSE", "BSE", "NFO"],
    supports_bracket: false,
    supports_streaming: false,
    supports_refresh: true,
    execution_cost_bps: 6,
    timeout_class: TimeoutClass::Slow,
};

pub fn profile(kind: BrokerKind) -> &'static BrokerProfile {
    match kind {
        BrokerKind::Zerodha => &ZERODHA,
        BrokerKind::Upstox => &UPSTOX,
        BrokerKind::AngelOne => &ANGEL_ONE,
        BrokerKind::IciciDirect => &ICICI_DIRECT,
        BrokerKind::Fyers => &FYERS,
        BrokerKind::Iifl => &IIFL,
    }
}

/// Capability snapshot stored on a connection at connect time. Kept
/// serializable so a persisted connection reflects the profile it was
/// created under, even across releases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerCapabilities {
    pub order_types: Vec<OrderType>,
    pub exchanges: Vec<String>,
    pub supports_bracket: bool,
    pub supports_streaming: bool,
    pub supports_refresh: bool,
    pub execution_cost_bps: u32,
    pub rate_limit_per_sec: u32,
}

impl From<&BrokerProfile> for BrokerCapabilities {
    fn from(p: &BrokerProfile) -> Self {
        Self {
            order_types: p.order_types.to_vec(),
            exchanges: p.exchanges.iter().map(|e| e.to_string()).collect(),
            supports_bracket: p.supports_bracket,
            supports_streaming: p.supports_streaming,
            supports_refresh: p.supports_refresh,
            execution_cost_bps: p.execution_cost_bps,
            rate_limit_per_sec: p.rate_limit_per_sec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_profile() {
        for kind in BrokerKind::ALL {
            let p = profile(kind);
            assert_eq!(p.kind, kind);
            assert!(p.base_url.starts_with("https://"));
            assert!(p.rate_limit_per_sec >= 1 && p.rate_limit_per_sec <= 5);
            assert!(p.supports_order_type(OrderType::Market));
        }
    }

    #[test]
    fn bracket_flag_matches_order_types() {
        for kind in BrokerKind::ALL {
            let p = profile(kind);
            assert_eq!(p.supports_bracket, p.supports_order_type(OrderType::Bracket));
        }
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in BrokerKind::ALL {
            assert_eq!(kind.as_str().parse::<BrokerKind>().unwrap(), kind);
        }
        assert!("robinhood".parse::<BrokerKind>().is_err());
    }
}
