//! Property-based tests for Flightline
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Outbound flow control
// ============================================================================

mod flow_control_properties {
    use super::*;
    use bytes::Bytes;
    use flightline_core::{
        ChannelMessage, FlightError, OutboundFile, PeerChannel, Result, Sender, SenderOutput,
        SpeedConfig, TransferConfig,
    };
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    /// Channel that records the buffered amount seen by every binary write
    struct MeteredChannel {
        writes: Mutex<Vec<ChannelMessage>>,
        buffered_at_write: Mutex<Vec<usize>>,
        buffered: AtomicUsize,
    }

    impl MeteredChannel {
        fn new() -> Self {
            Self {
                writes: Mutex::new(Vec::new()),
                buffered_at_write: Mutex::new(Vec::new()),
                buffered: AtomicUsize::new(0),
            }
        }

        fn release(&self, amount: usize) -> usize {
            let before = self.buffered.load(Ordering::SeqCst);
            let after = before.saturating_sub(amount);
            self.buffered.store(after, Ordering::SeqCst);
            after
        }
    }

    impl PeerChannel for MeteredChannel {
        fn send_text(&self, text: &str) -> Result<()> {
            self.buffered.fetch_add(text.len(), Ordering::SeqCst);
            self.writes
                .lock()
                .unwrap()
                .push(ChannelMessage::Text(text.to_string()));
            Ok(())
        }

        fn send_binary(&self, data: Bytes) -> Result<()> {
            let before = self.buffered.fetch_add(data.len(), Ordering::SeqCst);
            self.buffered_at_write.lock().unwrap().push(before);
            self.writes.lock().unwrap().push(ChannelMessage::Binary(data));
            Ok(())
        }

        fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        fn set_buffered_amount_low_threshold(&self, _threshold: usize) {}

        fn is_open(&self) -> bool {
            true
        }

        fn close(&self) {}
    }

    #[derive(Debug, Clone)]
    enum Step {
        Produce(usize),
        Release(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (1usize..=64).prop_map(Step::Produce),
            (1usize..=256).prop_map(Step::Release),
        ]
    }

    fn completed(outputs: &[SenderOutput]) -> bool {
        outputs.iter().any(|o| {
            matches!(
                o,
                SenderOutput::Event(flightline_core::SessionEvent::TransferCompleted { .. })
            )
        })
    }

    proptest! {
        /// No chunk is written while the buffer sits at or above the
        /// high-water mark, and chunks leave in production order
        #[test]
        fn never_writes_past_high_water(
            high_water in 32usize..256,
            steps in prop::collection::vec(step(), 1..80),
        ) {
            let transfer = TransferConfig {
                chunk_size: 64,
                high_water_mark: high_water,
                max_pending_chunks: usize::MAX,
                ..TransferConfig::default()
            };
            let low_water = transfer.low_water_mark();
            let mut sender = Sender::new(&transfer, &SpeedConfig::default());
            let channel = MeteredChannel::new();
            let now = Instant::now();

            let ids = sender.enqueue(
                vec![OutboundFile::new("/unused", "prop.bin", "application/octet-stream", 0)],
                Some(&channel),
                now,
            );
            let id = ids[0];
            let mut outputs = sender.take_outputs();
            prop_assert!(outputs.iter().any(|o| matches!(o, SenderOutput::StartProduction { .. })), "expected StartProduction output");

            let mut produced = Vec::new();
            for (n, step) in steps.into_iter().enumerate() {
                match step {
                    Step::Produce(len) => {
                        let chunk: Vec<u8> = (0..len).map(|i| (i + n) as u8).collect();
                        produced.extend_from_slice(&chunk);
                        sender.on_chunk_produced(id, Bytes::from(chunk), Some(&channel), now);
                    }
                    Step::Release(amount) => {
                        let before = channel.buffered_amount();
                        let after = channel.release(amount);
                        if before > low_water && after <= low_water {
                            sender.on_low_water(Some(&channel), now);
                        }
                    }
                }
                outputs.extend(sender.take_outputs());
            }

            sender.on_production_done(id, Some(&channel), now);
            outputs.extend(sender.take_outputs());
            for _ in 0..10_000 {
                if completed(&outputs) {
                    break;
                }
                channel.release(usize::MAX);
                sender.on_low_water(Some(&channel), now);
                outputs.extend(sender.take_outputs());
            }
            prop_assert!(completed(&outputs));

            for seen in channel.buffered_at_write.lock().unwrap().iter() {
                prop_assert!(*seen < high_water, "wrote at {} with mark {}", seen, high_water);
            }

            let writes = channel.writes.lock().unwrap().clone();
            let sent: Vec<u8> = writes
                .iter()
                .filter_map(|w| match w {
                    ChannelMessage::Binary(b) => Some(b.to_vec()),
                    ChannelMessage::Text(_) => None,
                })
                .flatten()
                .collect();
            prop_assert_eq!(sent, produced);
            prop_assert_eq!(writes.last(), Some(&ChannelMessage::Text("EOF".to_string())));
            prop_assert!(!outputs.iter().any(|o| matches!(
                o,
                SenderOutput::Event(flightline_core::SessionEvent::TransferFailed { error: FlightError::Channel(_), .. })
            )), "unexpected channel TransferFailed event");
        }
    }
}

// ============================================================================
// Send queue
// ============================================================================

mod queue_properties {
    use super::*;
    use flightline_core::OutboundFile;
    use flightline_core::SendQueue;
    use flightline_core::queue::SendQueueEntry;

    fn entry(n: usize) -> SendQueueEntry {
        SendQueueEntry::new(OutboundFile::new(
            format!("/tmp/{n}"),
            format!("file-{n}"),
            "text/plain",
            n as u64,
        ))
    }

    proptest! {
        /// Entries activate in the order they were queued
        #[test]
        fn activation_is_fifo(count in 1usize..30) {
            let mut queue = SendQueue::new();
            let entries: Vec<_> = (0..count).map(entry).collect();
            let expected: Vec<_> = entries.iter().map(|e| e.id).collect();
            for e in entries {
                queue.push(e);
            }

            let mut order = Vec::new();
            while let Some(active) = queue.activate_head() {
                order.push(active.id);
                queue.complete_active();
            }
            prop_assert_eq!(order, expected);
            prop_assert!(queue.is_empty());
        }

        /// Reordering never displaces the active entry or loses entries
        #[test]
        fn reorder_keeps_active_first(count in 2usize..20, from in 0usize..20, to in 0usize..40) {
            let mut queue = SendQueue::new();
            for n in 0..count {
                queue.push(entry(n));
            }
            let active = queue.activate_head().map(|e| e.id);
            let before = queue.ids();
            let target = before[from % count];

            let result = queue.reorder(target, to);
            prop_assert_eq!(result.is_err(), Some(target) == active);

            let after = queue.ids();
            prop_assert_eq!(after.first().copied(), active);
            let mut sorted_before = before.clone();
            let mut sorted_after = after.clone();
            sorted_before.sort();
            sorted_after.sort();
            prop_assert_eq!(sorted_before, sorted_after);
        }
    }
}

// ============================================================================
// Reconnect
// ============================================================================

mod reconnect_properties {
    use super::*;
    use flightline_core::{
        ConnectionState, FlightError, ReconnectAction, ReconnectConfig, ReconnectEngine,
        ServerMessage, SessionEvent, SignalingEvent, backoff_delay,
    };
    use std::time::Duration;

    fn config(base_ms: u64, max_ms: u64, max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            max_attempts,
            grace_slack: Duration::from_millis(0),
        }
    }

    /// Registered and in a flight
    fn in_flight(config: ReconnectConfig) -> ReconnectEngine {
        let mut engine = ReconnectEngine::new(config, "prop");
        engine.connect();
        engine.on_link_event(SignalingEvent::Opened);
        engine.on_link_event(SignalingEvent::Message(ServerMessage::Registered {
            id: "me".to_string(),
            session_token: "tok".to_string(),
        }));
        engine.on_link_event(SignalingEvent::Message(ServerMessage::FlightCreated {
            flight_code: "ABC123".to_string(),
        }));
        engine
    }

    proptest! {
        /// Delay doubles from the base and never exceeds the cap
        #[test]
        fn backoff_is_capped_and_monotonic(
            base_ms in 1u64..5_000,
            max_ms in 1u64..120_000,
            attempt in 1u32..64,
        ) {
            let config = config(base_ms, max_ms, 10);
            let delay = backoff_delay(&config, attempt);
            let next = backoff_delay(&config, attempt + 1);

            prop_assert!(delay <= config.max_delay);
            prop_assert!(next >= delay);
            if attempt < 16 {
                let uncapped = Duration::from_millis(base_ms) * 2u32.pow(attempt - 1);
                prop_assert_eq!(delay, uncapped.min(config.max_delay));
            }
        }

        /// Unreachable relay: exactly `max_attempts` retries, then a
        /// terminal failure
        #[test]
        fn exhausts_after_max_attempts(max_attempts in 1u32..12) {
            let mut engine = in_flight(config(100, 30_000, max_attempts));
            let mut actions = engine.on_link_event(SignalingEvent::Closed);
            prop_assert_eq!(engine.state(), ConnectionState::Reconnecting);

            let mut retries = 0;
            loop {
                let scheduled = actions
                    .iter()
                    .any(|a| matches!(a, ReconnectAction::ScheduleRetry { .. }));
                let failed = actions.iter().find_map(|a| match a {
                    ReconnectAction::Emit(SessionEvent::SessionFailed(e)) => Some(e.clone()),
                    _ => None,
                });
                if let Some(error) = failed {
                    prop_assert!(matches!(error, FlightError::ReconnectExhausted(n) if n == max_attempts));
                    break;
                }
                prop_assert!(scheduled);
                retries += 1;
                prop_assert!(retries <= max_attempts);

                let open = engine.on_retry_timer();
                prop_assert!(matches!(open.as_slice(), [ReconnectAction::OpenLink]));
                actions = engine.on_link_event(SignalingEvent::Closed);
            }

            prop_assert_eq!(retries, max_attempts);
            prop_assert_eq!(engine.state(), ConnectionState::Disconnected);
            prop_assert!(engine.is_terminal());
            prop_assert!(engine.flight_code().is_none());
        }
    }
}

// ============================================================================
// Buffer tier selection
// ============================================================================

mod tier_properties {
    use super::*;
    use flightline_files::{Tier, TierPolicy};

    proptest! {
        /// Durable only when enabled, available and at or above the threshold
        #[test]
        fn durable_requires_all_conditions(
            enabled in any::<bool>(),
            available in any::<bool>(),
            threshold in 0u64..1_000_000,
            size in 0u64..2_000_000,
        ) {
            let policy = TierPolicy {
                durable_enabled: enabled,
                durable_threshold: threshold,
                durable_available: available,
            };
            let expected = if enabled && available && size >= threshold {
                Tier::Durable
            } else {
                Tier::Memory
            };
            prop_assert_eq!(policy.select(size), expected);
        }
    }
}

// ============================================================================
// Peer message parsing
// ============================================================================

mod wire_properties {
    use super::*;
    use flightline_core::{FileMetadata, PeerMessage};

    proptest! {
        /// Arbitrary text never panics and never decodes as a chunk
        #[test]
        fn parse_text_total(text in ".*") {
            let message = PeerMessage::parse_text(&text);
            prop_assert!(!matches!(message, PeerMessage::Chunk(_)));
        }

        /// Metadata text decodes to the same metadata
        #[test]
        fn metadata_text_decodes(name in "[^\u{0}]{1,40}", size in any::<u64>()) {
            let meta = FileMetadata {
                name,
                mime_type: "application/octet-stream".to_string(),
                size,
            };
            prop_assert_eq!(PeerMessage::parse_text(&meta.to_text()), PeerMessage::Metadata(meta));
        }
    }
}
