//! Position control: the per-cycle loop and its order helpers.

pub mod controller;
pub mod executor;

pub use controller::PositionController;
pub use executor::{buy_limit_price, buy_quantity, minimum_sell_price, sell_limit_price};
