//! Order submission
//!
//! Placing an order reserves what it could consume, persists it together
//! with its open-order projection and an outbox row in one transaction, and
//! only then publishes the descriptor to the matching engine.

use std::sync::Arc;

use account_service::AccountService;
use chrono::{Duration, Utc};
use common::decimal::{precision, Amount, Price, Quantity};
use common::error::{Error, ErrorExt, Result};
use common::model::order::{Order, OrderDescriptor, OrderType, Side, UnfinishedOrder, ORDER_DESCRIPTOR_VERSION};
use common::model::trade::TradeLog;
use common::model::variety::TradingVariety;
use common::{DBTransaction, MessageQueue, QueueKey, VarietyRegistry};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::repository::OrderRepository;
use crate::request::{generate_order_id, PlaceOrderRequest};

/// Order submission service
pub struct OrderService {
    repo: Arc<dyn OrderRepository>,
    ledger: Arc<AccountService>,
    registry: Arc<dyn VarietyRegistry>,
    queue: Arc<dyn MessageQueue>,
}

impl OrderService {
    /// Create a new order service
    pub fn new(
        repo: Arc<dyn OrderRepository>,
        ledger: Arc<AccountService>,
        registry: Arc<dyn VarietyRegistry>,
        queue: Arc<dyn MessageQueue>,
    ) -> Self {
        Self {
            repo,
            ledger,
            registry,
            queue,
        }
    }

    /// Place a limit order
    pub async fn place_limit(&self, user_id: &str, symbol: &str, side: Side, price: Price, quantity: Quantity) -> Result<Order> {
        self.place(PlaceOrderRequest::limit(user_id, symbol, side, price, quantity)).await
    }

    /// Place a market order sized by target-asset quantity
    pub async fn place_market_by_qty(&self, user_id: &str, symbol: &str, side: Side, quantity: Quantity) -> Result<Order> {
        self.place(PlaceOrderRequest::market_by_qty(user_id, symbol, side, quantity)).await
    }

    /// Place a market order sized by base-asset amount
    pub async fn place_market_by_amount(&self, user_id: &str, symbol: &str, side: Side, amount: Amount) -> Result<Order> {
        self.place(PlaceOrderRequest::market_by_amount(user_id, symbol, side, amount)).await
    }

    /// Validate, reserve, persist and publish an order
    pub async fn place(&self, request: PlaceOrderRequest) -> Result<Order> {
        let variety = self
            .registry
            .resolve(&request.symbol)
            .await?
            .filter(|v| v.enabled)
            .ok_or_else(|| Error::InvalidSymbol(request.symbol.clone()))?;

        request.validate(&variety)?;

        let mut order = Order::new(
            generate_order_id(request.side, Utc::now()),
            variety.symbol.clone(),
            request.side,
            request.order_type,
            request.user_id.clone(),
            request.price.unwrap_or(Decimal::ZERO),
            request.quantity.unwrap_or(Decimal::ZERO),
            request.amount.unwrap_or(Decimal::ZERO),
            variety.fee_rate,
        );

        let mut tx = self.repo.begin_transaction().await
            .with_context(|| format!("Failed to start transaction for order {}", order.order_id))?;

        let result = async {
            let descriptor = self.reserve(&mut tx, &mut order, &variety).await?;
            self.repo.insert_order(&mut tx, &order).await?;
            self.repo.insert_unfinished(&mut tx, &UnfinishedOrder::from(&order)).await?;

            let payload = descriptor.to_bytes()?;
            self.repo.insert_outbox(&mut tx, &order.order_id, &order.symbol, &payload).await?;
            Ok::<_, Error>(payload)
        }
        .await;

        let payload = match result {
            Ok(payload) => {
                tx.commit().await
                    .with_context(|| format!("Failed to commit order {}", order.order_id))?;
                payload
            }
            Err(e) => {
                if e.is_rejection() {
                    warn!(order_id = %order.order_id, user_id = %order.user_id, error = %e, "Order rejected");
                } else {
                    error!(order_id = %order.order_id, error = %e, "Error placing order");
                }
                if let Err(rollback_err) = tx.rollback().await {
                    error!("Failed to roll back transaction: {}", rollback_err);
                }
                return Err(e);
            }
        };

        info!(
            order_id = %order.order_id,
            symbol = %order.symbol,
            side = order.side.as_str(),
            order_type = order.order_type.as_str(),
            "Order placed"
        );

        if let Err(e) = self.publish(&order.symbol, &order.order_id, payload).await {
            error!(
                order_id = %order.order_id,
                error = %e,
                "Failed to publish order to matching engine, left in outbox"
            );
        }

        Ok(order)
    }

    /// Freeze what the order could consume and build its descriptor
    async fn reserve(&self, tx: &mut DBTransaction, order: &mut Order, variety: &TradingVariety) -> Result<OrderDescriptor> {
        let ref_id = order.order_id.clone();
        let symbol = variety.symbol.as_str();
        let target = variety.target_asset.as_str();
        let base = variety.base_asset.as_str();
        let rate = order.fee_rate;

        let mut max_qty = Decimal::ZERO;
        let mut max_amount = Decimal::ZERO;

        match (order.side, order.order_type) {
            (Side::Sell, OrderType::Limit) => {
                self.ledger.freeze(tx, &order.user_id, target, order.quantity, &ref_id, symbol).await?;
                order.freeze_qty = order.quantity;
            }
            (Side::Buy, OrderType::Limit) => {
                let amount = precision::reserve(order.price * order.quantity * (Decimal::ONE + rate));
                self.ledger.freeze(tx, &order.user_id, base, amount, &ref_id, symbol).await?;
                order.freeze_amount = amount;
            }
            (Side::Sell, OrderType::MarketQty) => {
                self.ledger.freeze(tx, &order.user_id, target, order.quantity, &ref_id, symbol).await?;
                order.freeze_qty = order.quantity;
                max_qty = order.quantity;
            }
            (Side::Buy, OrderType::MarketAmount) => {
                self.ledger.freeze(tx, &order.user_id, base, order.amount, &ref_id, symbol).await?;
                order.freeze_amount = order.amount;
                max_amount = precision::settle(order.amount - order.amount * rate);
            }
            (Side::Buy, OrderType::MarketQty) => {
                self.ledger.freeze_all(tx, &order.user_id, base, &ref_id, symbol).await?;
                let frozen = self.ledger.query_freeze(tx, base, &ref_id).await?.amount;
                order.freeze_amount = frozen;
                max_amount = precision::settle(frozen - frozen * rate);
            }
            (Side::Sell, OrderType::MarketAmount) => {
                self.ledger.freeze_all(tx, &order.user_id, target, &ref_id, symbol).await?;
                let frozen = self.ledger.query_freeze(tx, target, &ref_id).await?.amount;
                order.freeze_qty = frozen;
                max_qty = frozen;
            }
        }

        debug!(order_id = %order.order_id, frozen = %order.frozen(), "Reserved funds for order");

        Ok(OrderDescriptor {
            v: ORDER_DESCRIPTOR_VERSION,
            order_id: order.order_id.clone(),
            order_type: order.order_type,
            side: order.side,
            price: order.price,
            qty: order.quantity,
            max_qty,
            amount: order.amount,
            max_amount,
            at: order.created_at_nanos(),
        })
    }

    async fn publish(&self, symbol: &str, order_id: &str, payload: Vec<u8>) -> Result<()> {
        self.queue.push(&QueueKey::NewOrder(symbol.to_string()), payload).await?;
        self.repo.delete_outbox(order_id).await
    }

    /// Republish outbox rows older than `min_age`, oldest first
    ///
    /// Returns how many descriptors were published.
    pub async fn redispatch_pending(&self, min_age: Duration, limit: i64) -> Result<usize> {
        let cutoff = Utc::now() - min_age;
        let pending = self.repo.pending_outbox(limit).await?;

        let mut published = 0;
        for dispatch in pending.into_iter().filter(|p| p.created_at <= cutoff) {
            self.publish(&dispatch.symbol, &dispatch.order_id, dispatch.payload)
                .await
                .with_context(|| format!("Failed to redispatch order {}", dispatch.order_id))?;
            info!(order_id = %dispatch.order_id, symbol = %dispatch.symbol, "Redispatched order to matching engine");
            published += 1;
        }
        Ok(published)
    }

    /// Get an order by id
    pub async fn get_order(&self, order_id: &str) -> Result<Order> {
        self.repo
            .find_order(order_id)
            .await?
            .ok_or_else(|| Error::OrderNotFound(order_id.to_string()))
    }

    /// Open orders of a symbol
    pub async fn open_orders(&self, symbol: &str) -> Result<Vec<UnfinishedOrder>> {
        self.repo.find_unfinished(symbol).await
    }

    /// Settled trades of a symbol
    pub async fn trade_logs(&self, symbol: &str) -> Result<Vec<TradeLog>> {
        self.repo.find_trade_logs(symbol).await
    }
}
