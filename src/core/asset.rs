//! Static asset-id/symbol table
//!
//! Snapshot of the venue's instrument list; `fetch_assets` supersedes it
//! at runtime with live payout and tradability data. Lookups here are
//! symbol resolution only.

/// Default venue endpoint (Europe cluster)
pub const DEFAULT_SERVER: &str = "wss://fr24g1eu.expertoption.com/";

/// Known asset ids and symbols
pub const ASSETS: &[(u32, &str)] = &[
    (142, "EURUSD"),
    (151, "AUDCAD"),
    (152, "AUDJPY"),
    (153, "AUDUSD"),
    (154, "EURGBP"),
    (155, "GBPUSD"),
    (156, "NZDUSD"),
    (157, "USDCAD"),
    (158, "USDCHF"),
    (159, "USDJPY"),
    (160, "BTCUSD"),
    (161, "LTCUSD"),
    (162, "ETHUSD"),
    (167, "BCHUSD"),
    (171, "XMRUSD"),
    (172, "ZECUSD"),
    (173, "XRPUSD"),
    (175, "ETCUSD"),
    (176, "XAUUSD"),
    (177, "UKOil"),
    (179, "EURUSD_OTC"),
    (180, "GBPUSD_OTC"),
    (181, "USDJPY_OTC"),
    (182, "USDCHF_OTC"),
    (183, "EURGBP_OTC"),
    (184, "AUDUSD_OTC"),
    (185, "USDCAD_OTC"),
    (186, "NZDUSD_OTC"),
    (187, "EURJPY_OTC"),
    (188, "EURCAD_OTC"),
    (190, "BABA"),
    (191, "GOOG"),
    (192, "AAPL"),
    (193, "AMZN"),
    (194, "MSFT"),
    (195, "TSLA"),
    (200, "IBM"),
    (202, "MCD"),
    (203, "DIS"),
    (209, "NFLX"),
    (211, "EURAUD"),
    (212, "EURCHF"),
    (214, "GBPCAD"),
    (216, "GBPCHF"),
    (217, "EURJPY"),
    (218, "AUDCHF"),
    (219, "AUDNZD"),
    (221, "XPTUSD"),
    (224, "USWALLST30"),
    (227, "GERMANY30"),
    (233, "USDX"),
    (235, "ADAUSD"),
    (247, "COPPER"),
    (252, "SPY"),
    (256, "GLD"),
    (271, "META"),
    (279, "CSCO"),
    (280, "NVDA"),
    (281, "XOM"),
    (316, "TRUMPUSD"),
];

/// Resolve a symbol to its asset id (case-insensitive).
/// When several ids share a symbol the lowest id wins.
pub fn asset_id(symbol: &str) -> Option<u32> {
    ASSETS
        .iter()
        .find(|(_, s)| s.eq_ignore_ascii_case(symbol))
        .map(|(id, _)| *id)
}

/// Resolve an asset id to its symbol
pub fn asset_symbol(id: u32) -> Option<&'static str> {
    ASSETS.iter().find(|(i, _)| *i == id).map(|(_, s)| *s)
}
