//! Typed client and domain model for the tracked entities.

mod client;
mod keys;
mod types;

pub use client::ApiClient;
pub use keys::ApiQuery;
pub use types::{
  apply_transit_update, merge_transit_event, StockItem, Transit, TransitState, TransitUpdate,
  Truck,
};
