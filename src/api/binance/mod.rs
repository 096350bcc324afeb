pub mod ws;

pub use ws::FeedGateway;
