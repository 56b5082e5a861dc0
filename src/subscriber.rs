//! Event subscriber (C4).
//!
//! Subscribes to `DataReady` logs emitted by the OnRamp contract and
//! forwards deduplicated events into a bounded channel for the packing
//! engine to consume. Mirrors the reconnect-on-transient-error loop in
//! `examples/original_source/xchain.go`'s `SubscribeQuery`, but per the
//! REDESIGN FLAG in spec.md §4.4 classifies failures by
//! `std::io::ErrorKind` instead of matching the substring `"read tcp"`.

use std::collections::HashSet;

use alloy_primitives::Address;
use alloy_provider::{Provider, ProviderBuilder, WsConnect};
use alloy_rpc_types_eth::Filter;
use alloy_sol_types::SolEvent;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::error::{AggregatorError, Result};
use crate::offer::{DataReadyEvent, Offer};
use crate::onramp::DataReady;

/// How failures surfaced by the log subscription are treated.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Reopen the subscription against the same endpoint.
    Reconnect,
    /// Give up; the worker (and with it, the aggregator) shuts down.
    Fatal,
}

/// Classifies a transport failure per spec.md §4.4's redesign: resets,
/// connection aborts, and broken pipes are treated as transient; anything
/// else (auth failures, malformed responses, DNS failures) is fatal.
pub fn classify(err: &std::io::Error) -> Disposition {
    use std::io::ErrorKind::*;
    match err.kind() {
        ConnectionReset | ConnectionAborted | BrokenPipe | TimedOut | UnexpectedEof => {
            Disposition::Reconnect
        }
        _ => Disposition::Fatal,
    }
}

/// Walks `err`'s `source()` chain looking for an `io::Error` to hand to
/// [`classify`]. Errors with no `io::Error` anywhere in their chain (a
/// malformed WS handshake, an RPC protocol mismatch) default to
/// [`Disposition::Fatal`] per spec.md §4.4: "Any other error terminates
/// C4."
fn classify_dyn(err: &(dyn std::error::Error + 'static)) -> Disposition {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
            return classify(io_err);
        }
        cur = e.source();
    }
    Disposition::Fatal
}

/// Maps a boxed transport error to the appropriate [`AggregatorError`]
/// variant via [`classify_dyn`].
fn to_transport_error(err: impl std::error::Error + 'static) -> AggregatorError {
    match classify_dyn(&err) {
        Disposition::Reconnect => AggregatorError::TransportRetryable(err.to_string()),
        Disposition::Fatal => AggregatorError::TransportFatal(err.to_string()),
    }
}

pub struct Subscriber {
    ws_url: String,
    on_ramp: Address,
    seen: HashSet<u64>,
}

impl Subscriber {
    pub fn new(ws_url: impl Into<String>, on_ramp: Address) -> Self {
        Self { ws_url: ws_url.into(), on_ramp, seen: HashSet::new() }
    }

    /// Runs until `cancel` fires or a fatal transport error occurs.
    /// Successfully decoded, not-yet-seen events are sent on `tx`; the
    /// channel's bounded capacity is the backpressure mechanism described
    /// in spec.md §5 — a slow packer stalls log delivery rather than
    /// buffering unboundedly.
    pub async fn run(&mut self, tx: Sender<DataReadyEvent>, cancel: CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.subscribe_once(&tx, &cancel).await {
                Ok(()) => return Ok(()),
                Err(AggregatorError::TransportRetryable(msg)) => {
                    tracing::warn!(error = %msg, "subscription dropped, reconnecting");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn subscribe_once(
        &mut self,
        tx: &Sender<DataReadyEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ws = WsConnect::new(self.ws_url.clone());
        let provider = ProviderBuilder::new()
            .connect_ws(ws)
            .await
            .map_err(to_transport_error)?;

        let filter = Filter::new().address(self.on_ramp).event_signature(DataReady::SIGNATURE_HASH);
        let sub = provider
            .subscribe_logs(&filter)
            .await
            .map_err(to_transport_error)?;
        let mut stream = sub.into_stream();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                maybe_log = futures::StreamExt::next(&mut stream) => {
                    let Some(log) = maybe_log else {
                        return Err(AggregatorError::TransportRetryable(
                            "log stream closed".to_string(),
                        ));
                    };
                    if let Some(event) = self.decode(&log) {
                        if tx.send(event).await.is_err() {
                            // receiver dropped: aggregator is shutting down
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn decode(&mut self, log: &alloy_rpc_types_eth::Log) -> Option<DataReadyEvent> {
        let decoded = match DataReady::decode_log(&log.inner) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable DataReady log");
                return None;
            }
        };
        let offer_id = decoded.offerId;
        if !self.seen.insert(offer_id) {
            tracing::debug!(offer_id, "duplicate DataReady event, skipping");
            return None;
        }
        Some(DataReadyEvent {
            offer_id,
            offer: Offer {
                comm_p: decoded.commP.to_vec(),
                size: decoded.size,
                cid: decoded.cid.clone(),
                location: decoded.location.clone(),
                amount: decoded.amount,
                token: decoded.token,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_is_reconnectable() {
        let err = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert_eq!(classify(&err), Disposition::Reconnect);
    }

    #[test]
    fn permission_denied_is_fatal() {
        let err = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(classify(&err), Disposition::Fatal);
    }

    #[test]
    fn classify_dyn_finds_io_error_in_source_chain() {
        #[derive(Debug)]
        struct Wrapper(std::io::Error);
        impl std::fmt::Display for Wrapper {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "wrapped: {}", self.0)
            }
        }
        impl std::error::Error for Wrapper {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }
        let wrapped = Wrapper(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert_eq!(classify_dyn(&wrapped), Disposition::Reconnect);
    }

    #[test]
    fn classify_dyn_defaults_to_fatal_with_no_io_error_in_chain() {
        #[derive(Debug)]
        struct NotIo;
        impl std::fmt::Display for NotIo {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "not an io error")
            }
        }
        impl std::error::Error for NotIo {}
        assert_eq!(classify_dyn(&NotIo), Disposition::Fatal);
    }

    #[test]
    fn to_transport_error_maps_reconnect_and_fatal() {
        let reconnectable = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert!(matches!(to_transport_error(reconnectable), AggregatorError::TransportRetryable(_)));
        let fatal = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(matches!(to_transport_error(fatal), AggregatorError::TransportFatal(_)));
    }

    #[test]
    fn dedup_drops_repeat_offer_ids() {
        let mut sub = Subscriber::new("ws://example.invalid", Address::ZERO);
        assert!(sub.seen.insert(1));
        assert!(!sub.seen.insert(1));
    }
}
