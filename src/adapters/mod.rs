pub mod backpack_futures;
pub mod binance_futures;
pub mod hyperliquid;
pub mod paper;
pub mod telegram;

pub use backpack_futures::{BackpackFuturesClient, QuantityFilter};
pub use binance_futures::{BinanceFuturesClient, SymbolFilters};
pub use hyperliquid::{HyperliquidClient, HyperliquidTrader};
pub use paper::PaperExchangeClient;
pub use telegram::{
    escape_markdown, TelegramClient, TelegramDailyLossNotifier, PARSE_MODE_MARKDOWN_V2,
};
