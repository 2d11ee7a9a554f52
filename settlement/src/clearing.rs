//! Trade application ("cleanflow") and cancellation settlement
//!
//! Both run in a single transaction and assume the caller holds the order
//! lock for every order they touch.

use std::sync::Arc;

use account_service::AccountService;
use chrono::Utc;
use common::decimal::precision;
use common::error::{Error, ErrorExt, Result};
use common::model::account::Behavior;
use common::model::order::{Order, Side, Status};
use common::model::trade::{TradeLog, TradeResult};
use common::model::variety::TradingVariety;
use common::{DBTransaction, VarietyRegistry};
use order_service::OrderRepository;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

/// Applies settled trades and cancellations to orders and the ledger
pub struct Clearing {
    orders: Arc<dyn OrderRepository>,
    ledger: Arc<AccountService>,
    registry: Arc<dyn VarietyRegistry>,
}

impl Clearing {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        ledger: Arc<AccountService>,
        registry: Arc<dyn VarietyRegistry>,
    ) -> Self {
        Self {
            orders,
            ledger,
            registry,
        }
    }

    async fn variety(&self, symbol: &str) -> Result<TradingVariety> {
        // disabled pairs still settle what was already matched
        self.registry
            .resolve(symbol)
            .await?
            .ok_or_else(|| Error::InvalidSymbol(symbol.to_string()))
    }

    /// Apply one trade result to both orders and the ledger
    pub async fn settle(&self, result: &TradeResult) -> Result<TradeLog> {
        let variety = self.variety(&result.symbol).await?;
        let trade_id = result.trade_id();

        let mut tx = self.orders.begin_transaction().await
            .with_context(|| format!("Failed to start transaction for trade {}", trade_id))?;

        let outcome = self.apply(&mut tx, result, &trade_id, &variety).await;

        match outcome {
            Ok(log) => {
                tx.commit().await
                    .with_context(|| format!("Failed to commit trade {}", trade_id))?;
                info!(
                    symbol = %result.symbol,
                    trade_id = %trade_id,
                    ask = %result.ask_order_id,
                    bid = %result.bid_order_id,
                    price = %result.trade_price,
                    qty = %result.trade_quantity,
                    "Trade settled"
                );
                Ok(log)
            }
            Err(e) => {
                if !matches!(e, Error::AlreadySettled(_)) {
                    error!(symbol = %result.symbol, trade_id = %trade_id, error = %e, "Settlement rolled back");
                }
                if let Err(rollback_err) = tx.rollback().await {
                    error!("Failed to roll back transaction: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        tx: &mut DBTransaction,
        result: &TradeResult,
        trade_id: &str,
        variety: &TradingVariety,
    ) -> Result<TradeLog> {
        if self.orders.trade_log_exists(tx, trade_id).await? {
            return Err(Error::AlreadySettled(trade_id.to_string()));
        }

        let mut ask = self.load(tx, &result.ask_order_id, result, Side::Sell).await?;
        let mut bid = self.load(tx, &result.bid_order_id, result, Side::Buy).await?;

        let target = variety.target_asset.as_str();
        let base = variety.base_asset.as_str();
        let fee_user = self.ledger.system_fee_user();

        self.ledger
            .lock_balances(
                tx,
                &[
                    (ask.user_id.as_str(), target),
                    (ask.user_id.as_str(), base),
                    (bid.user_id.as_str(), target),
                    (bid.user_id.as_str(), base),
                    (fee_user, base),
                ],
            )
            .await?;

        let qty = result.trade_quantity;
        let amount = precision::settle(result.amount());
        let ask_fee = precision::settle(amount * ask.fee_rate);
        let bid_fee = precision::settle(amount * bid.fee_rate);

        // seller's target goes to the buyer
        self.ledger
            .transfer_from_freeze(tx, target, &ask.order_id, &bid.user_id, qty, Behavior::Trade)
            .await?;
        ask.consume_freeze(qty)?;

        // buyer pays amount plus fee out of the base freeze
        self.ledger
            .transfer_from_freeze(tx, base, &bid.order_id, &ask.user_id, amount, Behavior::Trade)
            .await?;
        self.ledger
            .transfer_from_freeze(tx, base, &bid.order_id, fee_user, bid_fee, Behavior::Fee)
            .await?;
        bid.consume_freeze(amount + bid_fee)?;

        // seller's fee comes out of the proceeds
        self.ledger
            .transfer(tx, &ask.user_id, fee_user, base, ask_fee, trade_id, Behavior::Fee)
            .await?;

        ask.apply_fill(qty, amount, ask_fee)?;
        bid.apply_fill(qty, amount, bid_fee)?;

        let last = result.last.as_deref();
        self.advance(tx, &mut ask, last, variety).await?;
        self.advance(tx, &mut bid, last, variety).await?;

        let log = TradeLog {
            trade_id: trade_id.to_string(),
            symbol: result.symbol.clone(),
            ask_order_id: ask.order_id.clone(),
            bid_order_id: bid.order_id.clone(),
            ask_user_id: ask.user_id.clone(),
            bid_user_id: bid.user_id.clone(),
            price: result.trade_price,
            quantity: qty,
            amount,
            ask_fee,
            bid_fee,
            taker: if bid.created_at >= ask.created_at { Side::Buy } else { Side::Sell },
            trade_time: result.trade_time,
            created_at: Utc::now(),
        };
        self.orders.insert_trade_log(tx, &log).await?;

        Ok(log)
    }

    async fn load(&self, tx: &mut DBTransaction, order_id: &str, result: &TradeResult, side: Side) -> Result<Order> {
        let order = self
            .orders
            .get_order(tx, order_id)
            .await?
            .ok_or_else(|| Error::OrderNotFound(order_id.to_string()))?;

        if order.side != side {
            return Err(Error::InvalidOrder(format!(
                "order {} is a {} order, trade needs {}",
                order_id,
                order.side.as_str(),
                side.as_str()
            )));
        }
        if order.symbol != result.symbol {
            return Err(Error::InvalidOrder(format!(
                "order {} belongs to {}, trade is on {}",
                order_id, order.symbol, result.symbol
            )));
        }
        Ok(order)
    }

    /// Move an order after a fill; terminal orders give back what they still hold
    async fn advance(
        &self,
        tx: &mut DBTransaction,
        order: &mut Order,
        last: Option<&str>,
        variety: &TradingVariety,
    ) -> Result<()> {
        let exhausted = order.order_type.is_market() && last == Some(order.order_id.as_str());

        if order.target_reached() || exhausted {
            order.transition(Status::Filled)?;
            self.release_residual(tx, order, variety).await?;
            self.orders.delete_unfinished(tx, &order.order_id).await?;
            debug!(order_id = %order.order_id, "Order filled");
        } else {
            order.transition(Status::PartiallyFilled)?;
        }

        self.orders.update_order(tx, order).await
    }

    async fn release_residual(&self, tx: &mut DBTransaction, order: &mut Order, variety: &TradingVariety) -> Result<Decimal> {
        let asset = match order.side {
            Side::Sell => variety.target_asset.as_str(),
            Side::Buy => variety.base_asset.as_str(),
        };

        let residual = order.clear_freeze();
        let released = self.ledger.unfreeze(tx, asset, &order.order_id, None).await?;
        if released != residual {
            warn!(
                order_id = %order.order_id,
                order_residual = %residual,
                ledger_residual = %released,
                "Order and ledger disagree on residual freeze"
            );
        }
        Ok(released)
    }

    /// Cancel an open order and give back its residual freeze
    pub async fn cancel(&self, symbol: &str, order_id: &str) -> Result<Order> {
        let variety = self.variety(symbol).await?;

        let mut tx = self.orders.begin_transaction().await
            .with_context(|| format!("Failed to start transaction for cancelling {}", order_id))?;

        let outcome = async {
            let mut order = self
                .orders
                .get_order(&mut tx, order_id)
                .await?
                .ok_or_else(|| Error::OrderNotFound(order_id.to_string()))?;
            if order.symbol != symbol {
                return Err(Error::InvalidOrder(format!(
                    "order {} belongs to {}, not {}",
                    order_id, order.symbol, symbol
                )));
            }

            order.transition(Status::Cancelled)?;
            let released = self.release_residual(&mut tx, &mut order, &variety).await?;
            self.orders.delete_unfinished(&mut tx, order_id).await?;
            self.orders.update_order(&mut tx, &order).await?;
            Ok((order, released))
        }
        .await;

        match outcome {
            Ok((order, released)) => {
                tx.commit().await
                    .with_context(|| format!("Failed to commit cancellation of {}", order_id))?;
                info!(symbol, order_id, released = %released, "Order cancelled");
                Ok(order)
            }
            Err(e) => {
                warn!(symbol, order_id, error = %e, "Cancellation rolled back");
                if let Err(rollback_err) = tx.rollback().await {
                    error!("Failed to roll back transaction: {}", rollback_err);
                }
                Err(e)
            }
        }
    }
}
