//! Integration tests for the market data subscription service

use chrono::Utc;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::timeout;
use unlock_trader::exchange::{
    BookLevel, Candle, ExchangeError, ExchangeRegistry, OrderBook, PaperConnector,
};
use unlock_trader::market_data::{
    DataKind, MarketDataError, MarketDataEvent, MarketDataService, MarketPayload,
};

const FAST: Duration = Duration::from_millis(20);
const WAIT: Duration = Duration::from_secs(5);

async fn setup() -> (Arc<PaperConnector>, MarketDataService) {
    let paper = Arc::new(PaperConnector::new("binance", dec!(0)));
    paper.set_ticker("BTC/USDT", dec!(65000), dec!(1200)).await;

    let registry = Arc::new(ExchangeRegistry::new());
    registry.add_connector(paper.clone()).await.unwrap();

    let service = MarketDataService::new(registry);
    service.start();
    (paper, service)
}

#[tokio::test]
async fn test_resubscribe_returns_same_id() {
    let (_paper, service) = setup().await;

    let first = service
        .subscribe_ticker("BTC/USDT", Some("binance"), FAST)
        .await
        .unwrap();
    let second = service
        .subscribe_ticker("BTC/USDT", Some("binance"), FAST)
        .await
        .unwrap();
    // Default exchange resolves to the same key
    let third = service.subscribe_ticker("BTC/USDT", None, FAST).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first, third);
    assert_eq!(first.as_str(), "ticker:BTC/USDT:binance");
    assert_eq!(service.subscription_count().await, 1);
}

#[tokio::test]
async fn test_failed_polls_do_not_stop_subscription() {
    let (paper, service) = setup().await;
    let mut events = service.events();
    paper
        .fail_symbol("BTC/USDT", ExchangeError::RateLimited("429".into()))
        .await;

    let id = service
        .subscribe_ticker("BTC/USDT", None, FAST)
        .await
        .unwrap();
    let mut updates = service.listen(&id).await.unwrap();

    let mut failures = 0;
    while failures < 2 {
        match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            MarketDataEvent::Error {
                subscription_id,
                error,
            } => {
                assert_eq!(subscription_id, id);
                assert!(error.is_transient());
                failures += 1;
            }
            _ => {}
        }
    }
    assert!(service.subscription(&id).await.is_some());

    paper.clear_failure("BTC/USDT").await;
    let update = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(update.ticker().unwrap().last, dec!(65000));
}

#[tokio::test]
async fn test_nothing_published_after_unsubscribe() {
    let (_paper, service) = setup().await;
    let id = service
        .subscribe_ticker("BTC/USDT", None, FAST)
        .await
        .unwrap();
    let mut updates = service.listen(&id).await.unwrap();
    timeout(WAIT, updates.recv()).await.unwrap().unwrap();

    assert!(service.unsubscribe(&id).await);
    assert!(!service.unsubscribe(&id).await);
    tokio::time::sleep(FAST * 5).await;

    // Drain anything published before the call returned; then the channel is closed
    let last = loop {
        match updates.try_recv() {
            Ok(_) => continue,
            Err(e) => break e,
        }
    };
    assert_eq!(last, TryRecvError::Closed);
    assert_eq!(service.subscription_count().await, 0);
}

#[tokio::test]
async fn test_candle_and_order_book_feeds() {
    let (paper, service) = setup().await;
    let now = Utc::now();
    paper
        .set_candles(
            "BTC/USDT",
            vec![
                Candle {
                    timestamp: now - chrono::Duration::minutes(1),
                    open: dec!(64900),
                    high: dec!(65100),
                    low: dec!(64850),
                    close: dec!(65000),
                    volume: dec!(12),
                },
                Candle {
                    timestamp: now,
                    open: dec!(65000),
                    high: dec!(65050),
                    low: dec!(64990),
                    close: dec!(65020),
                    volume: dec!(3),
                },
            ],
        )
        .await;
    paper
        .set_order_book(OrderBook {
            symbol: "BTC/USDT".to_string(),
            bids: vec![BookLevel {
                price: dec!(64999),
                amount: dec!(0.5),
            }],
            asks: vec![BookLevel {
                price: dec!(65001),
                amount: dec!(0.7),
            }],
            timestamp: now,
        })
        .await;

    let candles = service
        .subscribe_ohlcv("BTC/USDT", "1m", None, FAST)
        .await
        .unwrap();
    let book = service
        .subscribe_order_book("BTC/USDT", None, 10, FAST)
        .await
        .unwrap();
    assert_ne!(candles, book);
    assert_eq!(candles.as_str(), "ohlcv:BTC/USDT:binance:1m");

    let mut candle_rx = service.listen(&candles).await.unwrap();
    let mut book_rx = service.listen(&book).await.unwrap();

    let update = timeout(WAIT, candle_rx.recv()).await.unwrap().unwrap();
    assert_eq!(update.kind(), DataKind::Ohlcv);
    match update.payload {
        MarketPayload::Candle(candle) => assert_eq!(candle.close, dec!(65020)),
        other => panic!("unexpected payload {:?}", other),
    }

    let update = timeout(WAIT, book_rx.recv()).await.unwrap().unwrap();
    match update.payload {
        MarketPayload::OrderBook(book) => {
            assert_eq!(book.best_bid(), Some(dec!(64999)));
            assert_eq!(book.best_ask(), Some(dec!(65001)));
        }
        other => panic!("unexpected payload {:?}", other),
    }

    let subscriptions = service.subscriptions().await;
    assert_eq!(subscriptions.len(), 2);
    assert_eq!(
        subscriptions
            .iter()
            .find(|s| s.kind == DataKind::OrderBook)
            .unwrap()
            .depth,
        Some(10)
    );

    service.stop().await;
    assert!(!service.is_active());
    assert_eq!(service.subscription_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_subscribe_racing_stop_leaves_no_feed_running() {
    for _ in 0..50 {
        let (_paper, service) = setup().await;
        let service = Arc::new(service);

        let subscriber = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.subscribe_ticker("BTC/USDT", None, FAST).await })
        };
        let stopper = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.stop().await })
        };

        let subscribed = subscriber.await.unwrap();
        stopper.await.unwrap();

        // Either the feed was drained by stop or it was never created
        if let Err(e) = subscribed {
            assert!(matches!(e, MarketDataError::NotRunning));
        }
        assert_eq!(service.subscription_count().await, 0);
    }
}
