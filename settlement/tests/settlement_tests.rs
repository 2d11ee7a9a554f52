mod support;

use std::time::Duration;

use common::decimal::dec;
use common::model::order::{Side, Status};
use common::model::variety::TradingVariety;
use common::Error;
use settlement::{LegOutcome, OrderLock};
use support::{harness, harness_with, settled, trade, fast_config, SYMBOL};

#[tokio::test]
async fn full_match_moves_funds_and_fees() {
    let h = harness();
    h.fund("seller", "usd", dec!(10000)).await;
    h.fund("buyer", "jpy", dec!(10000)).await;

    let ask = h.sell("seller", dec!(1.00), dec!(1)).await;
    let bid = h.buy("buyer", dec!(1.00), dec!(1)).await;

    let outcome = h.settle(trade(&ask, &bid, dec!(1.00), dec!(1))).await;
    let log = match outcome {
        LegOutcome::Settled(log) => log,
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(log.amount, dec!(1.00));
    assert_eq!(log.ask_fee, dec!(0.005));
    assert_eq!(log.bid_fee, dec!(0.005));
    assert_eq!(log.taker, Side::Buy);

    let seller_usd = h.balance("seller", "usd").await;
    assert_eq!(seller_usd.available, dec!(9999));
    assert_eq!(seller_usd.freeze, dec!(0));
    assert_eq!(h.balance("seller", "jpy").await.available, dec!(0.995));

    assert_eq!(h.balance("buyer", "usd").await.available, dec!(1));
    let buyer_jpy = h.balance("buyer", "jpy").await;
    assert_eq!(buyer_jpy.available, dec!(9998.995));
    assert_eq!(buyer_jpy.freeze, dec!(0));

    assert_eq!(h.balance("sys_fee", "jpy").await.available, dec!(0.010));

    for id in [&ask.order_id, &bid.order_id] {
        let order = h.order(id).await;
        assert_eq!(order.status, Status::Filled);
        assert_eq!(order.frozen(), dec!(0));
        assert_eq!(order.finished_qty, dec!(1));
    }
    assert!(h.orders.open_orders(SYMBOL).await.unwrap().is_empty());

    let quotes = h.quotes();
    assert_eq!(quotes.len(), 1);
    assert_eq!(quotes[0].ask_order_id, ask.order_id);
    assert_eq!(h.lock.get_lock(&ask.order_id).await.unwrap(), 0);
    assert_eq!(h.lock.holder(&bid.order_id).await, None);
}

#[tokio::test]
async fn price_improvement_releases_buyer_surplus() {
    let h = harness();
    h.fund("seller", "usd", dec!(10000)).await;
    h.fund("buyer", "jpy", dec!(10000)).await;

    let ask = h.sell("seller", dec!(1.00), dec!(1)).await;
    let bid = h.buy("buyer", dec!(2.00), dec!(1)).await;
    assert_eq!(h.balance("buyer", "jpy").await.freeze, dec!(2.01));

    assert!(settled(&h.settle(trade(&ask, &bid, dec!(1.00), dec!(1))).await));

    let buyer_jpy = h.balance("buyer", "jpy").await;
    assert_eq!(buyer_jpy.freeze, dec!(0));
    assert_eq!(buyer_jpy.available, dec!(9998.995));

    let bid = h.order(&bid.order_id).await;
    assert_eq!(bid.status, Status::Filled);
    assert_eq!(bid.avg_price, dec!(1));
    assert_eq!(bid.freeze_amount, dec!(0));
}

#[tokio::test]
async fn partial_fill_keeps_order_open() {
    let h = harness();
    h.fund("seller", "usd", dec!(10)).await;
    h.fund("buyer", "jpy", dec!(10000)).await;

    let ask = h.sell("seller", dec!(3), dec!(5)).await;
    let bid = h.buy("buyer", dec!(3), dec!(2)).await;

    assert!(settled(&h.settle(trade(&ask, &bid, dec!(3), dec!(2))).await));

    let ask = h.order(&ask.order_id).await;
    assert_eq!(ask.status, Status::PartiallyFilled);
    assert_eq!(ask.freeze_qty, dec!(3));
    assert_eq!(h.balance("seller", "usd").await.freeze, dec!(3));

    let open = h.orders.open_orders(SYMBOL).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].order_id, ask.order_id);
}

#[tokio::test]
async fn market_buy_settles_all_legs_before_filling() {
    let h = harness();
    h.fund("seller", "usd", dec!(10000)).await;
    h.fund("buyer", "jpy", dec!(10000)).await;

    let s1 = h.sell("seller", dec!(1), dec!(1)).await;
    let s2 = h.sell("seller", dec!(2), dec!(1)).await;
    let s3 = h.sell("seller", dec!(2), dec!(1)).await;
    let bid = h
        .orders
        .place_market_by_qty("buyer", SYMBOL, Side::Buy, dec!(3))
        .await
        .unwrap();
    assert_eq!(h.balance("buyer", "jpy").await.freeze, dec!(10000));

    let outcomes = h
        .settle_concurrently(vec![
            trade(&s1, &bid, dec!(1), dec!(1)),
            trade(&s2, &bid, dec!(2), dec!(1)),
            trade(&s3, &bid, dec!(2), dec!(1)).with_last(bid.order_id.clone()),
        ])
        .await;
    assert!(outcomes.iter().all(settled));

    assert_eq!(h.balance("seller", "usd").await.available, dec!(9997));
    assert_eq!(h.balance("seller", "jpy").await.available, dec!(4.975));
    assert_eq!(h.balance("buyer", "usd").await.available, dec!(3));
    let buyer_jpy = h.balance("buyer", "jpy").await;
    assert_eq!(buyer_jpy.available, dec!(9994.975));
    assert_eq!(buyer_jpy.freeze, dec!(0));
    assert_eq!(h.balance("sys_fee", "jpy").await.available, dec!(0.050));

    let bid = h.order(&bid.order_id).await;
    assert_eq!(bid.status, Status::Filled);
    assert_eq!(bid.finished_qty, dec!(3));
    assert_eq!(bid.finished_amount, dec!(5));
}

#[tokio::test]
async fn market_buy_without_enough_liquidity_ends_filled() {
    let h = harness();
    h.fund("seller", "usd", dec!(10000)).await;
    h.fund("buyer", "jpy", dec!(10000)).await;

    let s1 = h.sell("seller", dec!(1), dec!(1)).await;
    let s2 = h.sell("seller", dec!(2), dec!(1)).await;
    let s3 = h.sell("seller", dec!(2), dec!(1)).await;
    let s4 = h.sell("seller", dec!(2), dec!(1)).await;
    let bid = h
        .orders
        .place_market_by_qty("buyer", SYMBOL, Side::Buy, dec!(5))
        .await
        .unwrap();

    let r1 = trade(&s1, &bid, dec!(1), dec!(1));
    let r2 = trade(&s2, &bid, dec!(2), dec!(1));
    let r3 = trade(&s3, &bid, dec!(2), dec!(1));
    let r4 = trade(&s4, &bid, dec!(2), dec!(1)).with_last(bid.order_id.clone());
    let last_trade_id = r4.trade_id();

    // the closing leg arrives first and has to wait for its siblings
    let outcomes = h.settle_concurrently(vec![r4, r2, r1, r3]).await;
    assert!(outcomes.iter().all(settled));

    assert_eq!(h.balance("seller", "usd").await.available, dec!(9996));
    assert_eq!(h.balance("seller", "jpy").await.available, dec!(6.965));
    assert_eq!(h.balance("buyer", "usd").await.available, dec!(4));
    let buyer_jpy = h.balance("buyer", "jpy").await;
    assert_eq!(buyer_jpy.available, dec!(9992.965));
    assert_eq!(buyer_jpy.freeze, dec!(0));
    assert_eq!(h.balance("sys_fee", "jpy").await.available, dec!(0.070));

    let bid = h.order(&bid.order_id).await;
    assert_eq!(bid.status, Status::Filled);
    assert_eq!(bid.finished_qty, dec!(4));
    assert_eq!(bid.freeze_amount, dec!(0));

    let state = h.state.lock().await;
    let last = &state.trade_logs[&last_trade_id];
    assert!(state.trade_logs.values().all(|log| log.created_at <= last.created_at));
}

#[tokio::test]
async fn limit_order_is_not_closed_by_last_flag() {
    let h = harness();
    h.fund("seller", "usd", dec!(10)).await;
    h.fund("buyer", "jpy", dec!(100)).await;

    let ask = h.sell("seller", dec!(1), dec!(1)).await;
    let bid = h.buy("buyer", dec!(1), dec!(3)).await;

    let leg = trade(&ask, &bid, dec!(1), dec!(1)).with_last(bid.order_id.clone());
    assert!(settled(&h.settle(leg).await));

    let bid = h.order(&bid.order_id).await;
    assert_eq!(bid.status, Status::PartiallyFilled);
    assert_eq!(bid.freeze_amount, dec!(2.01));
}

#[tokio::test]
async fn replayed_result_is_not_applied_twice() {
    let h = harness();
    h.fund("seller", "usd", dec!(10)).await;
    h.fund("buyer", "jpy", dec!(100)).await;

    let ask = h.sell("seller", dec!(1), dec!(5)).await;
    let bid = h.buy("buyer", dec!(1), dec!(5)).await;
    let leg = trade(&ask, &bid, dec!(1), dec!(1));

    assert!(settled(&h.settle(leg.clone()).await));
    assert!(matches!(h.settle(leg).await, LegOutcome::Duplicate));

    assert_eq!(h.balance("buyer", "usd").await.available, dec!(1));
    assert_eq!(h.balance("seller", "jpy").await.available, dec!(0.995));
    assert_eq!(h.order(&ask.order_id).await.finished_qty, dec!(1));
    assert_eq!(h.quotes().len(), 1);
    assert_eq!(h.lock.get_lock(&ask.order_id).await.unwrap(), 0);
}

#[tokio::test]
async fn legs_sharing_a_resting_order_all_apply() {
    let h = harness();
    h.fund("seller", "usd", dec!(5)).await;
    let ask = h.sell("seller", dec!(1), dec!(5)).await;

    let mut legs = Vec::new();
    for i in 0..5 {
        let buyer = format!("buyer-{}", i);
        h.fund(&buyer, "jpy", dec!(10)).await;
        let bid = h.buy(&buyer, dec!(1), dec!(1)).await;
        legs.push(trade(&ask, &bid, dec!(1), dec!(1)));
    }

    let outcomes = h.settle_concurrently(legs).await;
    assert!(outcomes.iter().all(settled));

    let ask = h.order(&ask.order_id).await;
    assert_eq!(ask.status, Status::Filled);
    assert_eq!(ask.finished_qty, dec!(5));
    let seller_usd = h.balance("seller", "usd").await;
    assert_eq!(seller_usd.available, dec!(0));
    assert_eq!(seller_usd.freeze, dec!(0));
    assert_eq!(h.balance("seller", "jpy").await.available, dec!(4.975));
    assert_eq!(h.state.lock().await.trade_logs.len(), 5);
    assert_eq!(h.lock.get_lock(&ask.order_id).await.unwrap(), 0);
}

#[tokio::test]
async fn stalled_dependency_parks_the_leg() {
    let mut config = fast_config();
    config.dependency_timeout = Duration::from_millis(100);
    let h = harness_with(config);
    h.fund("seller", "usd", dec!(10)).await;
    h.fund("buyer", "jpy", dec!(100)).await;

    let ask = h.sell("seller", dec!(1), dec!(1)).await;
    let bid = h
        .orders
        .place_market_by_qty("buyer", SYMBOL, Side::Buy, dec!(1))
        .await
        .unwrap();

    // a sibling leg that never finishes
    h.lock.lock(&[bid.order_id.as_str()]).await.unwrap();

    let leg = trade(&ask, &bid, dec!(1), dec!(1)).with_last(bid.order_id.clone());
    assert!(matches!(h.settle(leg.clone()).await, LegOutcome::Stalled));

    let parked = h.stalled();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0], leg.to_bytes().unwrap());

    // only the stuck sibling's registration is left
    assert_eq!(h.lock.get_lock(&bid.order_id).await.unwrap(), 1);
    assert_eq!(h.lock.get_lock(&ask.order_id).await.unwrap(), 0);

    assert_eq!(h.balance("seller", "usd").await.freeze, dec!(1));
    assert_eq!(h.balance("buyer", "usd").await.available, dec!(0));
    assert_eq!(h.order(&bid.order_id).await.status, Status::New);
    assert!(h.quotes().is_empty());
}

#[tokio::test]
async fn held_order_times_out_as_stall() {
    let mut config = fast_config();
    config.dependency_timeout = Duration::from_millis(100);
    let h = harness_with(config);
    h.fund("seller", "usd", dec!(10)).await;
    h.fund("buyer", "jpy", dec!(100)).await;

    let ask = h.sell("seller", dec!(1), dec!(1)).await;
    let bid = h.buy("buyer", dec!(1), dec!(1)).await;
    assert!(h.lock.try_acquire(&[ask.order_id.as_str()], "crashed").await.unwrap());

    assert!(matches!(h.settle(trade(&ask, &bid, dec!(1), dec!(1))).await, LegOutcome::Stalled));
    assert_eq!(h.lock.holder(&ask.order_id).await.as_deref(), Some("crashed"));
    assert_eq!(h.lock.holder(&bid.order_id).await, None);
    assert_eq!(h.order(&ask.order_id).await.status, Status::New);
}

#[tokio::test]
async fn failed_leg_rolls_back_and_releases_lock() {
    let h = harness();
    h.fund("seller", "usd", dec!(10)).await;
    let ask = h.sell("seller", dec!(1), dec!(1)).await;
    let mut ghost = ask.clone();
    ghost.order_id = "B000000000000ghost".to_string();

    let outcome = h.settle(trade(&ask, &ghost, dec!(1), dec!(1))).await;
    assert!(matches!(outcome, LegOutcome::Failed(Error::OrderNotFound(_))));

    assert_eq!(h.balance("seller", "usd").await.freeze, dec!(1));
    assert_eq!(h.order(&ask.order_id).await.status, Status::New);
    assert_eq!(h.lock.get_lock(&ask.order_id).await.unwrap(), 0);
    assert_eq!(h.lock.holder(&ask.order_id).await, None);
    assert!(h.state.lock().await.trade_logs.is_empty());
}

#[tokio::test]
async fn leg_larger_than_remaining_quantity_is_rejected() {
    let h = harness();
    h.fund("seller", "usd", dec!(10)).await;
    h.fund("buyer", "jpy", dec!(100)).await;
    let ask = h.sell("seller", dec!(1), dec!(2)).await;
    let bid = h.buy("buyer", dec!(2), dec!(1)).await;

    // the price-improved freeze would cover 1.5 at 1, but only 1 was ordered
    let outcome = h.settle(trade(&ask, &bid, dec!(1), dec!(1.5))).await;
    assert!(matches!(outcome, LegOutcome::Failed(Error::InvalidOrder(_))));

    assert_eq!(h.balance("buyer", "usd").await.available, dec!(0));
    assert_eq!(h.balance("buyer", "jpy").await.freeze, dec!(2.01));
    assert_eq!(h.balance("seller", "usd").await.freeze, dec!(2));
    assert_eq!(h.order(&bid.order_id).await.finished_qty, dec!(0));
    assert!(h.state.lock().await.trade_logs.is_empty());

    assert!(settled(&h.settle(trade(&ask, &bid, dec!(1), dec!(1))).await));
    let bid = h.order(&bid.order_id).await;
    assert_eq!(bid.status, Status::Filled);
    assert_eq!(bid.finished_qty, bid.quantity);
    assert_eq!(h.balance("buyer", "usd").await.available, dec!(1));
}

#[tokio::test]
async fn eight_decimal_fill_stays_within_storage_scale() {
    let h = harness();
    h.registry.insert(TradingVariety::new(SYMBOL, "usd", "jpy", dec!(0.003)));
    h.fund("seller", "usd", dec!(1)).await;
    h.fund("buyer", "jpy", dec!(1)).await;

    let price = dec!(0.12345671);
    let qty = dec!(0.12345671);
    let ask = h.sell("seller", price, qty).await;
    let bid = h.buy("buyer", price, qty).await;

    // price * qty * 1.003 has 19 places; the reservation rounds up
    assert_eq!(bid.freeze_amount, dec!(0.015287283921756173));
    assert_eq!(h.balance("buyer", "jpy").await.freeze, bid.freeze_amount);

    let log = match h.settle(trade(&ask, &bid, price, qty)).await {
        LegOutcome::Settled(log) => log,
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(log.amount, dec!(0.0152415592440241));
    assert_eq!(log.bid_fee, dec!(0.000045724677732072));
    assert_eq!(log.ask_fee, log.bid_fee);
    assert!(log.amount + log.bid_fee <= bid.freeze_amount);

    let buyer_jpy = h.balance("buyer", "jpy").await;
    assert_eq!(buyer_jpy.freeze, dec!(0));
    assert_eq!(buyer_jpy.available, dec!(0.984712716078243828));
    assert_eq!(h.balance("seller", "jpy").await.available, dec!(0.015195834566292028));
    assert_eq!(h.balance("sys_fee", "jpy").await.available, dec!(0.000091449355464144));
    assert_eq!(h.order(&bid.order_id).await.status, Status::Filled);
    assert_eq!(h.order(&ask.order_id).await.status, Status::Filled);
}

#[tokio::test]
async fn swapped_sides_are_rejected() {
    let h = harness();
    h.fund("seller", "usd", dec!(10)).await;
    h.fund("buyer", "jpy", dec!(100)).await;
    let ask = h.sell("seller", dec!(1), dec!(1)).await;
    let bid = h.buy("buyer", dec!(1), dec!(1)).await;

    let outcome = h.settle(trade(&bid, &ask, dec!(1), dec!(1))).await;
    assert!(matches!(outcome, LegOutcome::Failed(Error::InvalidOrder(_))));
    assert_eq!(h.balance("buyer", "jpy").await.freeze, dec!(1.005));
}

#[tokio::test]
async fn disabled_symbol_still_settles() {
    let h = harness();
    h.fund("seller", "usd", dec!(10)).await;
    h.fund("buyer", "jpy", dec!(100)).await;
    let ask = h.sell("seller", dec!(1), dec!(1)).await;
    let bid = h.buy("buyer", dec!(1), dec!(1)).await;

    let mut variety = TradingVariety::new(SYMBOL, "usd", "jpy", dec!(0.005));
    variety.enabled = false;
    h.registry.insert(variety);

    assert!(settled(&h.settle(trade(&ask, &bid, dec!(1), dec!(1))).await));
}

#[tokio::test]
async fn cancel_releases_residual_freeze() {
    let h = harness();
    h.fund("seller", "usd", dec!(10)).await;
    h.fund("buyer", "jpy", dec!(100)).await;

    let ask = h.sell("seller", dec!(1), dec!(1)).await;
    let bid = h.buy("buyer", dec!(1), dec!(2)).await;
    assert!(settled(&h.settle(trade(&ask, &bid, dec!(1), dec!(1))).await));

    let cancelled = h.pipeline.cancel(SYMBOL, &bid.order_id).await.unwrap();
    assert_eq!(cancelled.status, Status::Cancelled);
    assert_eq!(cancelled.frozen(), dec!(0));
    assert_eq!(cancelled.finished_qty, dec!(1));

    let buyer_jpy = h.balance("buyer", "jpy").await;
    assert_eq!(buyer_jpy.freeze, dec!(0));
    assert_eq!(buyer_jpy.available, dec!(98.995));
    assert!(h.orders.open_orders(SYMBOL).await.unwrap().is_empty());

    let err = h.pipeline.cancel(SYMBOL, &bid.order_id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidOrder(_)));
    let err = h.pipeline.cancel(SYMBOL, &ask.order_id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidOrder(_)));
}

#[tokio::test]
async fn cancel_of_unknown_order_or_wrong_symbol_fails() {
    let h = harness();
    h.registry.insert(TradingVariety::new("btcjpy", "btc", "jpy", dec!(0.001)));
    h.fund("seller", "usd", dec!(10)).await;
    let ask = h.sell("seller", dec!(1), dec!(1)).await;

    assert!(matches!(
        h.pipeline.cancel(SYMBOL, "A-missing").await,
        Err(Error::OrderNotFound(_))
    ));
    assert!(matches!(
        h.pipeline.cancel("btcjpy", &ask.order_id).await,
        Err(Error::InvalidOrder(_))
    ));
    assert_eq!(h.balance("seller", "usd").await.freeze, dec!(1));
    assert_eq!(h.lock.holder(&ask.order_id).await, None);
}

#[tokio::test]
async fn cancel_waits_for_pending_legs() {
    let h = harness();
    h.fund("seller", "usd", dec!(10)).await;
    h.fund("buyer", "jpy", dec!(100)).await;
    let ask = h.sell("seller", dec!(1), dec!(3)).await;
    let bid = h.buy("buyer", dec!(1), dec!(1)).await;

    let leg = trade(&ask, &bid, dec!(1), dec!(1));
    let raw = leg.to_bytes().unwrap();
    let accepted = h.pipeline.accept(SYMBOL, &raw).await.unwrap();

    let pipeline = h.pipeline.clone();
    let ask_id = ask.order_id.clone();
    let cancel = tokio::spawn(async move { pipeline.cancel(SYMBOL, &ask_id).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!cancel.is_finished());

    assert!(settled(&h.pipeline.settle_leg(accepted, raw).await));
    let cancelled = cancel.await.unwrap().unwrap();
    assert_eq!(cancelled.status, Status::Cancelled);
    assert_eq!(cancelled.finished_qty, dec!(1));

    let seller_usd = h.balance("seller", "usd").await;
    assert_eq!(seller_usd.available, dec!(9));
    assert_eq!(seller_usd.freeze, dec!(0));
}
