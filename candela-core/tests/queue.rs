use std::sync::Arc;
use std::time::Duration;

use candela_core::{DualQueue, Quote};
use chrono::{DateTime, Utc};

fn quote(symbol: &str, ts_ms: i64, is_final: bool) -> Quote {
    Quote {
        venue: "mock".to_string(),
        symbol: symbol.to_string(),
        contract_family: "spot".to_string(),
        event_time: DateTime::<Utc>::from_timestamp_millis(ts_ms).unwrap(),
        open: 1.0,
        high: 1.0,
        low: 1.0,
        close: 1.0,
        volume: 1.0,
        trade_count: 0,
        is_final,
    }
}

#[tokio::test]
async fn closed_candles_drain_before_open_updates() {
    let q = DualQueue::new(16, None);
    q.put(quote("OPEN1", 1, false)).await;
    q.put(quote("CLOSED1", 2, true)).await;
    q.put(quote("OPEN2", 3, false)).await;
    q.put(quote("CLOSED2", 4, true)).await;

    assert_eq!(q.get().await.symbol, "CLOSED1");
    assert_eq!(q.get().await.symbol, "CLOSED2");
    // Open updates pop newest-first.
    assert_eq!(q.get().await.symbol, "OPEN2");
    assert_eq!(q.get().await.symbol, "OPEN1");
    assert!(q.is_empty());
}

#[tokio::test]
async fn open_overflow_drops_oldest_and_counts() {
    let q = DualQueue::new(16, Some(2));
    q.put(quote("A", 1, false)).await;
    q.put(quote("B", 2, false)).await;
    q.put(quote("C", 3, false)).await;

    assert_eq!(q.open_overflow_events(), 1);
    assert_eq!(q.open_len(), 2);
    // Newest first; "A" (the bottom of the stack) was the casualty.
    assert_eq!(q.get().await.symbol, "C");
    assert_eq!(q.get().await.symbol, "B");
}

#[tokio::test]
async fn full_closed_queue_blocks_the_producer() {
    let q = Arc::new(DualQueue::new(1, None));
    q.put(quote("FIRST", 1, true)).await;

    let producer = {
        let q = Arc::clone(&q);
        tokio::spawn(async move {
            q.put(quote("SECOND", 2, true)).await;
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!producer.is_finished(), "producer must block on a full FIFO");
    assert_eq!(q.blocking_events(), 1);

    assert_eq!(q.get().await.symbol, "FIRST");
    tokio::time::timeout(Duration::from_secs(1), producer)
        .await
        .expect("producer unblocked after a slot freed")
        .unwrap();
    assert_eq!(q.get().await.symbol, "SECOND");
}

#[tokio::test]
async fn final_candles_are_never_dropped() {
    let q = Arc::new(DualQueue::new(2, Some(1)));
    for i in 0..10 {
        // Interleave provisional noise with finals; drain concurrently.
        q.put(quote("NOISE", i, false)).await;
    }
    let consumer = {
        let q = Arc::clone(&q);
        tokio::spawn(async move {
            let mut finals = 0;
            for _ in 0..40 {
                if q.get().await.is_final {
                    finals += 1;
                }
                if finals == 20 {
                    break;
                }
            }
            finals
        })
    };
    for i in 0..20 {
        q.put(quote("FINAL", 100 + i, true)).await;
    }
    let finals = tokio::time::timeout(Duration::from_secs(5), consumer)
        .await
        .expect("all finals must come through")
        .unwrap();
    assert_eq!(finals, 20);
}

#[tokio::test]
async fn get_waits_until_an_item_arrives() {
    let q = Arc::new(DualQueue::new(4, None));
    let waiter = {
        let q = Arc::clone(&q);
        tokio::spawn(async move { q.get().await.symbol })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());
    q.put(quote("LATE", 1, false)).await;
    let got = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter woke up")
        .unwrap();
    assert_eq!(got, "LATE");
}
