//! End-to-end scenarios from the packing engine through the transfer
//! server, without any real network or Filecoin daemon involved.

use alloy_primitives::{Address, U256};
use cid::Cid;
use xchain_aggregator::offer::{DataReadyEvent, Offer};
use xchain_aggregator::packing::{PackOutcome, Packer};
use xchain_aggregator::transfer::{router, unpadded_content_length, Transfer, TransferState};

fn event(id: u64, size: u64) -> DataReadyEvent {
    let mh = multihash_codetable::MultihashDigest::digest(&multihash_codetable::Code::Sha2_256, &id.to_le_bytes());
    let cid = Cid::new_v1(0x55, mh);
    DataReadyEvent {
        offer_id: id,
        offer: Offer {
            comm_p: cid.to_bytes(),
            size,
            cid: cid.to_string(),
            location: format!("http://127.0.0.1:9/pieces/{id}"),
            amount: U256::from(id),
            token: Address::ZERO,
        },
    }
}

#[test]
fn single_offer_stays_pending_no_commit() {
    let mut packer = Packer::new(1 << 20).unwrap();
    let outcome = packer.offer(event(1, 1 << 10)).unwrap();
    assert!(matches!(outcome, PackOutcome::Queued));
}

#[test]
fn overflowing_offer_commits_prior_batch_with_expected_ids() {
    let mut packer = Packer::new(1 << 20).unwrap();
    packer.offer(event(1, 1 << 18)).unwrap();
    packer.offer(event(2, 1 << 18)).unwrap();

    match packer.offer(event(3, 1 << 19)).unwrap() {
        PackOutcome::Committed(batch) => assert_eq!(batch.offer_ids, vec![1, 2]),
        PackOutcome::Queued => panic!("expected overflow to commit offers 1 and 2"),
    }
}

#[test]
fn duplicate_offer_ids_are_ignored_by_the_subscriber_dedup_layer() {
    use std::collections::HashSet;
    let mut seen = HashSet::new();
    assert!(seen.insert(7u64));
    assert!(!seen.insert(7u64), "second DataReady for the same offer id must be treated as a duplicate");
}

#[tokio::test]
async fn unknown_transfer_id_returns_404_with_no_data_found_body() {
    let state = TransferState::new();
    let app = router(state);

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    let res = app
        .oneshot(Request::builder().uri("/?id=999999").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"No data found");
}

#[tokio::test]
async fn head_reports_unpadded_content_length_for_registered_transfer() {
    let state = TransferState::new();
    let target = 1 << 20;
    let aggregate = xchain_aggregator::podsi::Aggregate::new(
        target,
        &[xchain_aggregator::podsi::prefix_piece()],
    )
    .unwrap();
    let id = state.register(Transfer { aggregate, offers: vec![] });

    let app = router(state);
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use tower::ServiceExt;

    let res = app
        .oneshot(
            Request::builder()
                .method(Method::HEAD)
                .uri(format!("/?id={id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let len: u64 = res
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(len, unpadded_content_length(target));
}
