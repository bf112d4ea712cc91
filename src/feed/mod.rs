pub mod backoff;
pub mod manager;
pub mod synthetic;
pub mod transport;
pub mod wire;
mod worker;

pub use manager::{select_mode, FeedSettings, TickStreamManager};
pub use transport::{FeedConnector, FeedMessage, FeedTransport, WsConnector};
