mod paper;
mod traits;

pub use paper::{FillMode, PaperExchange};
pub use traits::ExchangeGateway;
