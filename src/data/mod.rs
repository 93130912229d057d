//! Market-data ingestion: adapter callbacks → bounded queues → latest
//! snapshot maps with freshness stamps.

pub mod processor;
pub mod receiver;

pub use processor::{DataProcessor, DataProcessorStats};
pub use receiver::{BoundedQueue, DataReceiver, OrderBookEnvelope, TickerEnvelope, VenueIngestStats};
