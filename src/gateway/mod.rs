//! Market gateways.
//!
//! One contract, two implementations:
//! - [`LiveGateway`] talks to the brokerage daemon over HTTP.
//! - [`SimGateway`] replays minute bars with simulated slippage and fees,
//!   used by backtests and as a test double.

pub mod bars;
mod live;
mod sim;
mod traits;
mod types;

pub use bars::BarStore;
pub use live::LiveGateway;
pub use sim::{SimCosts, SimGateway};
pub use traits::{GatewayError, MarketGateway};
pub use types::{
    AccountSnapshot, BrokerPosition, MinuteBar, OrderRequest, OrderResult, OrderSide, OrderStatus,
};
