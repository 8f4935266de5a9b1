//! Out-of-order ingestion within the lateness window

mod common;

use common::{at, raw_signal, service, unit_config};
use relink_core::ledger::{LedgerPayload, TransitionCause};
use relink_core::{LinkageService, PairId, RawSignal, SignalId};
use serde_json::json;
use std::sync::Arc;

/// Every scored observation in the ledger as (pair, pre, post, score bits)
async fn scored_observations(service: &LinkageService) -> Vec<(PairId, SignalId, SignalId, u64)> {
    let snapshot = service.ledger().snapshot().await;
    let mut observations: Vec<_> = snapshot
        .records()
        .iter()
        .filter_map(|stored| match &stored.payload {
            LedgerPayload::Transition(t) => match &t.cause {
                TransitionCause::Evidence {
                    pre_signal,
                    post_signal,
                    score,
                    ..
                } => Some((t.pair_id.clone(), *pre_signal, *post_signal, score.to_bits())),
                _ => None,
            },
            _ => None,
        })
        .collect();
    observations.sort();
    observations
}

fn stream() -> Vec<RawSignal> {
    vec![
        raw_signal("pre", 0, -40, json!({"screen_w": 0.9, "clock_skew": 0.5})),
        raw_signal("pre", 0, -20, json!({"screen_w": 0.9, "clock_skew": 0.49})),
        raw_signal("post", 1, 10, json!({"screen_w": 0.88, "clock_skew": 0.52})),
        raw_signal("post", 1, 30, json!({"screen_w": 0.9, "clock_skew": 0.51})),
    ]
}

async fn replay(order: &[usize]) -> LinkageService {
    let service = service(unit_config(&["screen_w", "clock_skew"])).await;
    service.submit_reset_event(0, 1, at(0)).await.unwrap();

    let signals = stream();
    for &i in order {
        service.submit_signal(&signals[i]).await.unwrap();
        // Pull after every signal so the reorder buffer does the work
        service.process_pending().await.unwrap();
    }
    service.flush().await.unwrap();
    service
}

#[tokio::test]
async fn test_out_of_order_within_lateness_matches_in_order() {
    let in_order = replay(&[0, 1, 2, 3]).await;
    let shuffled = replay(&[3, 1, 2, 0]).await;

    let expected = scored_observations(&in_order).await;
    assert_eq!(expected.len(), 4);
    assert_eq!(scored_observations(&shuffled).await, expected);

    let pair = PairId::new(relink_core::ResetEventId(1), "pre", "post");
    let a = in_order.get_decision(&pair).await.unwrap();
    let b = shuffled.get_decision(&pair).await.unwrap();
    assert_eq!(a.verdict, b.verdict);
    assert_eq!(a.evidence_count, b.evidence_count);
    assert!((a.confidence - b.confidence).abs() < 1e-12);
}

#[tokio::test]
async fn test_signals_held_until_watermark_passes() {
    let service = service(unit_config(&["screen_w"])).await;
    service.submit_reset_event(0, 1, at(0)).await.unwrap();

    service
        .submit_signal(&raw_signal("pre", 0, -10, json!({"screen_w": 0.5})))
        .await
        .unwrap();
    service
        .submit_signal(&raw_signal("post", 1, 10, json!({"screen_w": 0.5})))
        .await
        .unwrap();
    let summary = service.process_pending().await.unwrap();
    assert_eq!(summary.dequeued, 2);
    assert_eq!(summary.released, 0);
    assert_eq!(service.buffered().await, 2);

    // Watermark moves 60s past both signals
    service
        .submit_signal(&raw_signal("tick", 1, 71, json!({"screen_w": 0.5})))
        .await
        .unwrap();
    let summary = service.process_pending().await.unwrap();
    assert_eq!(summary.released, 2);
    assert_eq!(summary.candidates, 1);
    assert_eq!(service.buffered().await, 1);
}

#[tokio::test]
async fn test_reset_arriving_after_signals_still_pairs() {
    let service = service(unit_config(&["screen_w"])).await;

    service
        .submit_signal(&raw_signal("pre", 0, -10, json!({"screen_w": 0.5})))
        .await
        .unwrap();
    service
        .submit_signal(&raw_signal("post", 1, 10, json!({"screen_w": 0.5})))
        .await
        .unwrap();
    service.flush().await.unwrap();
    assert!(service.decisions().await.is_empty());

    let reset = service.submit_reset_event(0, 1, at(0)).await.unwrap();
    let decision = service
        .get_decision(&PairId::new(reset, "pre", "post"))
        .await
        .unwrap();
    assert_eq!(decision.evidence_count, 1);
}

#[tokio::test]
async fn test_concurrent_consumers_release_in_collection_order() {
    let service = Arc::new(service(unit_config(&["screen_w"])).await);
    service.submit_reset_event(0, 1, at(0)).await.unwrap();

    let mut consumers = Vec::new();
    for _ in 0..4 {
        let service = Arc::clone(&service);
        consumers.push(tokio::spawn(async move {
            for _ in 0..100 {
                service.process_pending().await.unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }

    // Submitted in collection order, interleaved with the consumers
    for secs in (-400..0).step_by(10).chain((1..400).step_by(10)) {
        let (source, epoch) = if secs < 0 { ("pre", 0) } else { ("post", 1) };
        service
            .submit_signal(&raw_signal(source, epoch, secs, json!({"screen_w": 0.5})))
            .await
            .unwrap();
        tokio::task::yield_now().await;
    }
    for consumer in consumers {
        consumer.await.unwrap();
    }
    service.flush().await.unwrap();

    assert_eq!(service.late_arrivals().await, 0);

    let snapshot = service.ledger().snapshot().await;
    let accepted: Vec<_> = snapshot
        .records()
        .iter()
        .filter_map(|stored| match &stored.payload {
            LedgerPayload::SignalAccepted { collected_at, .. } => Some(*collected_at),
            _ => None,
        })
        .collect();
    assert_eq!(accepted.len(), 80);
    assert!(accepted.windows(2).all(|w| w[0] <= w[1]));

    let decision = service
        .get_decision(&PairId::new(relink_core::ResetEventId(1), "pre", "post"))
        .await
        .unwrap();
    assert_eq!(decision.evidence_count, 40 * 40);
}
