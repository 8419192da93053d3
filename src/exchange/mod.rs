pub mod factory;
pub mod precision;
mod traits;
pub mod types;

pub use factory::{build_exchange_client, build_exchange_client_for, ExchangeDeps};
pub use traits::{parse_exchange_kind, ExchangeClient, ExchangeKind};
pub use types::{
    CloseRequest, CloseResult, EntryRequest, EntryResult, Liquidity, PositionSide, TpslRequest,
    TpslResult,
};
