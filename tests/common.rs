#![allow(unused)]
use std::collections::VecDeque;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use roq::bwe::{BandwidthEstimator, Bwe, SentPacket, StreamTable, TargetBitrate};
use roq::feedback::{Ecn, Feedback, FeedbackGenerator};
use roq::rtp::{Bitrate, DataSize, RtpHeader, Ssrc};
use roq::{Encoder, SessionConfig};

pub fn init_log() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    static START: Once = Once::new();

    START.call_once(|| {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(env_filter)
            .init();
    });
}

/// Encoder that records what it was told.
#[derive(Debug, Clone)]
pub struct TestEncoder {
    pub state: Arc<Mutex<EncoderState>>,
}

#[derive(Debug, Default)]
pub struct EncoderState {
    pub bitrate: Option<Bitrate>,
    pub history: Vec<Bitrate>,
}

impl TestEncoder {
    pub fn new(bitrate: Bitrate) -> Self {
        TestEncoder {
            state: Arc::new(Mutex::new(EncoderState {
                bitrate: Some(bitrate),
                history: vec![],
            })),
        }
    }

    pub fn current(&self) -> Bitrate {
        self.state.lock().bitrate.unwrap_or(Bitrate::ZERO)
    }

    pub fn changes(&self) -> Vec<Bitrate> {
        self.state.lock().history.clone()
    }
}

impl Encoder for TestEncoder {
    fn set_bitrate(&mut self, bitrate: Bitrate) {
        let mut s = self.state.lock();
        s.bitrate = Some(bitrate);
        s.history.push(bitrate);
    }

    fn bitrate(&self) -> Bitrate {
        self.state.lock().bitrate.unwrap_or(Bitrate::ZERO)
    }
}

/// Serialize an RTP packet with a transport-wide sequence number and a zeroed payload.
pub fn rtp_packet(
    ssrc: Ssrc,
    seq: u16,
    transport_seq: Option<u16>,
    marker: bool,
    payload_len: usize,
    twcc_id: u8,
) -> Vec<u8> {
    let header = RtpHeader {
        marker,
        payload_type: 96,
        sequence_number: seq,
        timestamp: seq as u32 * 3000,
        ssrc,
        transport_cc: transport_seq,
        header_len: 0,
    };

    let mut buf = vec![0; 20 + payload_len];
    let n = header.write_to(&mut buf, twcc_id);
    buf.truncate(n + payload_len);
    buf
}

/// A one-way path with a fixed delay and random loss.
pub struct Link {
    pub delay: Duration,
    pub loss: f64,
    rng: fastrand::Rng,
}

impl Link {
    pub fn new(delay: Duration, loss: f64, seed: u64) -> Self {
        Link {
            delay,
            loss,
            rng: fastrand::Rng::with_seed(seed),
        }
    }

    /// Whether the next packet makes it through.
    pub fn delivers(&mut self) -> bool {
        self.rng.f64() >= self.loss
    }
}

/// Drives an estimator against a simulated receiver.
///
/// Each tick sends what the current target allows, in 1000 byte packets, over a link
/// with the given loss. Feedback travels back with the same delay.
pub struct Simulation {
    pub bwe: Bwe,
    pub streams: StreamTable,
    pub ssrc: Ssrc,
    pub now: Instant,
    pub target: Bitrate,
    pub loss_events: usize,
    link: Link,
    generator: FeedbackGenerator,
    in_transit: VecDeque<(Instant, Vec<u8>)>,
    seq: u64,
}

pub const TICK: Duration = Duration::from_millis(10);
pub const PACKET_SIZE: usize = 1000;

impl Simulation {
    pub fn new(config: &SessionConfig, link: Link) -> Self {
        Simulation {
            bwe: Bwe::new(config),
            streams: StreamTable::new(),
            ssrc: 1.into(),
            now: Instant::now(),
            target: config.initial_bitrate(),
            loss_events: 0,
            link,
            generator: FeedbackGenerator::new(
                config.feedback_format(),
                2.into(),
                config.feedback_interval(),
            ),
            in_transit: VecDeque::new(),
            seq: 0,
        }
    }

    pub fn tick(&mut self) {
        self.deliver_feedback();

        let budget = self.target * TICK;
        let count = (budget.as_bytes_usize() / PACKET_SIZE).max(1);

        let arrival = self.now + self.link.delay;

        for _ in 0..count {
            let seq = self.seq;
            self.seq += 1;

            self.bwe.on_packet_sent(
                SentPacket {
                    ssrc: self.ssrc,
                    seq: seq.into(),
                    transport_seq: Some(seq.into()),
                    size: DataSize::from(PACKET_SIZE),
                },
                self.now,
            );

            if self.link.delivers() {
                let header = RtpHeader {
                    marker: false,
                    payload_type: 96,
                    sequence_number: seq as u16,
                    timestamp: 0,
                    ssrc: self.ssrc,
                    transport_cc: Some(seq as u16),
                    header_len: 12,
                };
                self.generator.on_packet(&header, Ecn::Ect0, arrival);
            }
        }

        if let Some(buf) = self.generator.poll_feedback(arrival) {
            self.in_transit.push_back((arrival + self.link.delay, buf));
        }

        self.now += TICK;
    }

    fn deliver_feedback(&mut self) {
        while let Some((at, _)) = self.in_transit.front() {
            if *at > self.now {
                break;
            }
            let Some((_, buf)) = self.in_transit.pop_front() else {
                break;
            };

            for fb in Feedback::parse(&buf).expect("valid feedback") {
                let report = self.bwe.decode(fb);
                self.bwe.on_feedback(&report, &self.streams, self.now);
            }

            match self.bwe.target_bitrate(self.ssrc, &self.streams) {
                TargetBitrate::Rate(v) => self.target = v,
                TargetBitrate::LossDetected => self.loss_events += 1,
            }
        }
    }

    /// Run for `duration`, returning the mean target over the second half.
    pub fn run(&mut self, duration: Duration) -> Bitrate {
        let ticks = (duration.as_millis() / TICK.as_millis()) as usize;
        let mut sum = 0.0;
        let mut n = 0;

        for i in 0..ticks {
            self.tick();
            if i >= ticks / 2 {
                sum += self.target.as_f64();
                n += 1;
            }
        }

        Bitrate::from(sum / n.max(1) as f64)
    }
}
