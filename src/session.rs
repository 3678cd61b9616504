use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::bwe::{BandwidthEstimate, BandwidthEstimator, Bwe, CcState, FeedbackOutcome};
use crate::bwe::{SentPacket, StreamRegistration, StreamTable};
use crate::config::SessionConfig;
use crate::feedback::{Ecn, Feedback, FeedbackGenerator};
use crate::queue::FrameQueue;
use crate::rate::{Encoder, RateController, RateDecision};
use crate::rtp::{DataSize, RtpHeader, SeqUnwrapper, Ssrc};
use crate::util::Soonest;
use crate::RoqError;

/// Something that happened in a [`Session`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A new estimate for a stream.
    Estimate(BandwidthEstimate),
    /// The encoder of the stream should produce a keyframe.
    KeyframeRequest(Ssrc),
    /// The stream ended, either removed or because the session closed.
    EndOfStream(Ssrc),
}

type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

/// Keeps a listener registered with [`Session::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    subscribers: Weak<Mutex<Subscribers>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.lock().listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

struct Core {
    bwe: Bwe,
    streams: StreamTable,
    controllers: HashMap<Ssrc, Arc<RateController>>,
    generator: FeedbackGenerator,
    rtp_seqs: HashMap<Ssrc, SeqUnwrapper>,
    transport_seqs: SeqUnwrapper,
    /// Stamps each round of estimates so controllers can drop stale ones.
    estimate_seq: u64,
}

/// One media session over an unreliable datagram transport.
///
/// The session owns the [`FrameQueue`], the bandwidth estimator, the stream table and one
/// [`RateController`] per stream.
///
/// On the sending side, report every RTP packet put on the wire with
/// [`Session::on_rtp_sent`] and every received feedback packet with
/// [`Session::on_feedback_bytes`]. The latter updates the estimates and hands them to the
/// encoders.
///
/// On the receiving side, report every received RTP packet with
/// [`Session::observe_rtp`], and call [`Session::flush_feedback`] regularly to send
/// feedback back to the peer.
pub struct Session {
    config: SessionConfig,
    queue: Arc<FrameQueue>,
    core: Mutex<Core>,
    subscribers: Arc<Mutex<Subscribers>>,
    streams_ended: AtomicBool,
}

impl Session {
    /// Create a session.
    ///
    /// `has_data` is called every time a frame is queued for sending.
    pub fn new(
        config: SessionConfig,
        has_data: impl Fn() + Send + Sync + 'static,
    ) -> Result<Session, RoqError> {
        config.validate()?;

        let queue = Arc::new(FrameQueue::new(config.inbound_capacity(), has_data));

        let core = Core {
            bwe: Bwe::new(&config),
            streams: StreamTable::new(),
            controllers: HashMap::new(),
            generator: FeedbackGenerator::new(
                config.feedback_format(),
                config.feedback_ssrc(),
                config.feedback_interval(),
            ),
            rtp_seqs: HashMap::new(),
            transport_seqs: SeqUnwrapper::new(),
            estimate_seq: 0,
        };

        info!(
            "New session {:?} with {:?} feedback",
            config.estimator(),
            config.feedback_format()
        );

        Ok(Session {
            config,
            queue,
            core: Mutex::new(core),
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
            streams_ended: AtomicBool::new(false),
        })
    }

    /// The config the session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The frame queue shared with the transport.
    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }

    /// Fails with the close reason once the session is closed.
    fn check_open(&self) -> Result<(), RoqError> {
        if self.queue.is_closed() {
            return Err(self.queue.closed_error().into());
        }
        Ok(())
    }

    /// Add a stream and the encoder that produces it.
    ///
    /// A registration without a positive priority gets the configured default.
    pub fn add_stream(
        &self,
        mut reg: StreamRegistration,
        encoder: impl Encoder + 'static,
    ) -> Result<(), RoqError> {
        let ssrc = reg.ssrc;
        if !(reg.priority > 0.0) {
            reg.priority = self.config.default_priority();
        }
        let controller = RateController::new(
            encoder,
            self.config.rate_interval(),
            reg.min_bitrate,
            reg.max_bitrate,
        );

        let mut core = self.core.lock();
        // Checked under the lock, so close either sees this stream or we see close.
        self.check_open()?;
        if core.streams.insert(reg).is_err() {
            return Err(RoqError::DuplicateStream(ssrc));
        }
        core.controllers.insert(ssrc, Arc::new(controller));
        core.bwe.stream_added(ssrc);
        debug!("Add stream {}", ssrc);

        Ok(())
    }

    /// Remove a stream. Subscribers get [`SessionEvent::EndOfStream`].
    pub fn remove_stream(&self, ssrc: Ssrc) -> Result<(), RoqError> {
        self.check_open()?;

        {
            let mut core = self.core.lock();
            if core.streams.remove(ssrc).is_none() {
                return Err(RoqError::UnknownStream(ssrc));
            }
            core.controllers.remove(&ssrc);
            core.rtp_seqs.remove(&ssrc);
        }

        debug!("Remove stream {}", ssrc);
        self.emit(&SessionEvent::EndOfStream(ssrc));

        Ok(())
    }

    /// Listen to session events.
    ///
    /// The listener is called without any session lock held.
    pub fn subscribe(&self, f: impl Fn(&SessionEvent) + Send + Sync + 'static) -> Subscription {
        let mut subscribers = self.subscribers.lock();
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        subscribers.listeners.push((id, Arc::new(f)));

        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    fn emit(&self, event: &SessionEvent) {
        let listeners: Vec<Listener> = self
            .subscribers
            .lock()
            .listeners
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        for l in listeners {
            l(event);
        }
    }

    /// Record an RTP packet that was handed to the network.
    pub fn on_rtp_sent(&self, buf: &[u8], now: Instant) -> Result<(), RoqError> {
        self.check_open()?;

        let header = RtpHeader::parse(buf, Some(self.config.twcc_extension_id()))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid RTP header"))?;

        let mut core = self.core.lock();
        let seq = core
            .rtp_seqs
            .entry(header.ssrc)
            .or_default()
            .unwrap(header.sequence_number);
        let transport_seq = header.transport_cc.map(|v| core.transport_seqs.unwrap(v));

        core.bwe.on_packet_sent(
            SentPacket {
                ssrc: header.ssrc,
                seq,
                transport_seq,
                size: DataSize::from(buf.len()),
            },
            now,
        );

        Ok(())
    }

    /// Record a sent packet whose details are already known.
    pub fn on_packet_sent(&self, packet: SentPacket, now: Instant) {
        if self.is_closed() {
            return;
        }
        self.core.lock().bwe.on_packet_sent(packet, now);
    }

    /// Account for a media frame produced by the encoder of `ssrc`.
    ///
    /// Only the self-clocked estimator uses this.
    pub fn new_media_frame(&self, ssrc: Ssrc, bytes: DataSize, now: Instant) {
        if self.is_closed() {
            return;
        }
        if let Bwe::SelfClocked(v) = &mut self.core.lock().bwe {
            v.new_media_frame(ssrc, bytes, now);
        }
    }

    /// Time until the next packet of `ssrc` may be sent, or `None` if the congestion
    /// window is full or the session is closed.
    pub fn time_until_send(&self, ssrc: Ssrc, now: Instant) -> Option<Duration> {
        if self.is_closed() {
            return None;
        }
        let mut core = self.core.lock();
        let Core { bwe, streams, .. } = &mut *core;
        bwe.time_until_send(streams, ssrc, now)
    }

    /// The shortest [`Session::time_until_send`] over all streams.
    pub fn time_until_next_send(&self, now: Instant) -> Option<Duration> {
        if self.is_closed() {
            return None;
        }
        let mut core = self.core.lock();
        let Core { bwe, streams, .. } = &mut *core;

        let ssrcs: Vec<Ssrc> = streams.iter().map(|s| s.ssrc).collect();
        ssrcs.into_iter().fold(None::<Duration>, |soonest, ssrc| {
            soonest.soonest(bwe.time_until_send(streams, ssrc, now))
        })
    }

    /// Handle received feedback.
    ///
    /// Malformed feedback, and any feedback after close, is logged and discarded.
    /// Processed feedback updates the estimates of all streams, see
    /// [`Session::update_estimates`].
    pub fn on_feedback_bytes(&self, buf: &[u8], now: Instant) -> FeedbackOutcome {
        if self.is_closed() {
            debug!("Discard feedback, session closed");
            return FeedbackOutcome::Dropped;
        }

        let feedback = match Feedback::parse(buf) {
            Ok(v) => v,
            Err(e) => {
                warn!("Discard feedback: {}", e);
                return FeedbackOutcome::Dropped;
            }
        };

        let outcome = {
            let mut core = self.core.lock();
            let Core { bwe, streams, .. } = &mut *core;

            let mut outcome = FeedbackOutcome::Dropped;
            for fb in feedback {
                let report = bwe.decode(fb);
                outcome = outcome.merge(bwe.on_feedback(&report, streams, now));
            }
            outcome
        };

        if outcome != FeedbackOutcome::Dropped {
            self.update_estimates(now);
        } else {
            debug!("Feedback dropped");
        }

        outcome
    }

    /// Query the estimator for every stream and hand the result to the rate controllers.
    ///
    /// Subscribers get an [`SessionEvent::Estimate`] per stream, and a
    /// [`SessionEvent::KeyframeRequest`] when loss was detected. A closed session
    /// produces no estimates.
    pub fn update_estimates(&self, now: Instant) -> Vec<(BandwidthEstimate, RateDecision)> {
        let (seq, pending) = {
            let mut core = self.core.lock();
            if self.is_closed() {
                return vec![];
            }

            core.estimate_seq += 1;
            let Core {
                bwe,
                streams,
                controllers,
                estimate_seq,
                ..
            } = &mut *core;

            let mut ssrcs: Vec<Ssrc> = streams.iter().map(|s| s.ssrc).collect();
            ssrcs.sort();

            let pending: Vec<_> = ssrcs
                .into_iter()
                .filter_map(|ssrc| {
                    let target = bwe.target_bitrate(ssrc, streams);
                    let controller = controllers.get(&ssrc)?.clone();
                    let estimate = BandwidthEstimate {
                        ssrc,
                        target,
                        at: now,
                    };
                    Some((estimate, controller))
                })
                .collect();

            (*estimate_seq, pending)
        };

        let mut out = Vec::with_capacity(pending.len());

        for (estimate, controller) in pending {
            if self.is_closed() {
                break;
            }
            self.emit(&SessionEvent::Estimate(estimate));

            let decision = controller.on_estimate_in_order(&estimate, seq, now);
            if decision == RateDecision::KeyframeRequested {
                self.emit(&SessionEvent::KeyframeRequest(estimate.ssrc));
            }

            out.push((estimate, decision));
        }

        out
    }

    /// Record a received RTP packet for feedback.
    pub fn observe_rtp(&self, buf: &[u8], ecn: Ecn, now: Instant) -> Result<RtpHeader, RoqError> {
        self.check_open()?;

        let header = RtpHeader::parse(buf, Some(self.config.twcc_extension_id()))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid RTP header"))?;

        self.core.lock().generator.on_packet(&header, ecn, now);

        Ok(header)
    }

    /// Send feedback to the peer if it is due.
    ///
    /// Returns whether a feedback packet was queued.
    pub fn flush_feedback(&self, now: Instant) -> Result<bool, RoqError> {
        self.check_open()?;

        let Some(buf) = self.core.lock().generator.poll_feedback(now) else {
            return Ok(false);
        };

        trace!("Queue feedback of {} bytes", buf.len());
        self.queue.enqueue_send_with(buf, |_| {})?;

        Ok(true)
    }

    /// Congestion control state of the estimator.
    pub fn state(&self) -> CcState {
        self.core.lock().bwe.state()
    }

    /// Bytes sent and not yet acked or declared lost.
    pub fn bytes_in_flight(&self) -> DataSize {
        self.core.lock().bwe.bytes_in_flight()
    }

    /// A summary line from the self-clocked estimator.
    pub fn statistics(&self, now: Instant) -> Option<String> {
        match &self.core.lock().bwe {
            Bwe::SelfClocked(v) => Some(v.statistics(now)),
            Bwe::Window(_) => None,
        }
    }

    /// Close the session.
    ///
    /// Closes the frame queue with `err` and ends all streams. Only the first call has
    /// any effect, also when several threads close at once. If the transport already
    /// closed the queue, the streams are still ended exactly once.
    ///
    /// Afterwards the session is inert: fallible calls fail with the close reason and
    /// the rest do nothing.
    pub fn close(&self, err: io::Error) {
        let reason = err.to_string();
        if self.queue.close(err) {
            info!("Close session: {}", reason);
        }

        if self.streams_ended.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut ssrcs: Vec<Ssrc> = self.core.lock().streams.iter().map(|s| s.ssrc).collect();
        ssrcs.sort();

        for ssrc in ssrcs {
            self.emit(&SessionEvent::EndOfStream(ssrc));
        }
    }

    /// Whether [`Session::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock();
        f.debug_struct("Session")
            .field("bwe", &core.bwe)
            .field("streams", &core.streams)
            .field("queue", &self.queue)
            .finish()
    }
}
