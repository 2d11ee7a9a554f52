//! Order submission: validation, freezing, persistence and dispatch to the matching engine

pub mod repository;
pub mod request;
pub mod service;

pub use repository::{InMemoryOrderRepository, OrderRepository, PostgresOrderRepository};
pub use request::{generate_order_id, PlaceOrderRequest};
pub use service::OrderService;
