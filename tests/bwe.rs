use std::time::{Duration, Instant};

use roq::bwe::{BandwidthEstimator, Bwe, SentPacket, StreamTable, TargetBitrate};
use roq::feedback::{Ecn, FeedbackReport, PacketReport};
use roq::rtp::{Bitrate, DataSize};
use roq::{CcState, EstimatorKind, FeedbackFormat, SessionConfig};

mod common;
use common::{init_log, Link, Simulation};

fn config(kind: EstimatorKind) -> SessionConfig {
    let format = match kind {
        EstimatorKind::Window => FeedbackFormat::Twcc,
        EstimatorKind::SelfClocked => FeedbackFormat::Ccfb,
    };
    SessionConfig::new()
        .set_estimator(kind)
        .set_feedback_format(format)
        .set_initial_bitrate(Bitrate::mbps(1))
        .set_max_bitrate(Bitrate::mbps(10))
}

fn run(kind: EstimatorKind, loss: f64) -> (Bitrate, usize, CcState) {
    let link = Link::new(Duration::from_millis(20), loss, 42);
    let mut sim = Simulation::new(&config(kind), link);
    let mean = sim.run(Duration::from_secs(10));
    (mean, sim.loss_events, sim.bwe.state())
}

fn assert_monotonic(kind: EstimatorKind) {
    let (clean, clean_events, _) = run(kind, 0.0);
    let (some, some_events, _) = run(kind, 0.05);
    let (heavy, heavy_events, _) = run(kind, 0.3);

    println!("{kind:?} 0%: {clean}, 5%: {some}, 30%: {heavy}");

    assert_eq!(clean_events, 0);
    assert!(some_events > 0);
    assert!(heavy_events > 0);

    assert!(clean > some, "{clean} > {some}");
    assert!(some >= heavy, "{some} >= {heavy}");
    assert!(clean > heavy, "{clean} > {heavy}");
}

#[test]
pub fn window_monotonic_under_loss() {
    init_log();
    assert_monotonic(EstimatorKind::Window);
}

#[test]
pub fn self_clocked_monotonic_under_loss() {
    init_log();
    assert_monotonic(EstimatorKind::SelfClocked);
}

#[test]
pub fn clean_path_reaches_max() {
    init_log();

    for kind in [EstimatorKind::Window, EstimatorKind::SelfClocked] {
        let link = Link::new(Duration::from_millis(20), 0.0, 1);
        let mut sim = Simulation::new(&config(kind), link);
        sim.run(Duration::from_secs(10));

        assert!(sim.target >= Bitrate::mbps(9), "{kind:?} {}", sim.target);
        assert!(sim.target <= Bitrate::mbps(10), "{kind:?} {}", sim.target);
        assert_ne!(sim.bwe.state(), CcState::LossRecovery);
        assert_eq!(sim.loss_events, 0);
    }
}

/// One estimator fed rounds of 20 packets where round `k` loses the first `k`.
///
/// Returns the rate after each round.
fn rising_loss_rates(kind: EstimatorKind) -> Vec<Bitrate> {
    let config = config(kind);
    let format = config.feedback_format();
    let mut bwe = Bwe::new(&config);
    let streams = StreamTable::new();
    let start = Instant::now();

    let TargetBitrate::Rate(seed) = bwe.target_bitrate(1.into(), &streams) else {
        panic!("expected a rate");
    };
    let mut rates = vec![seed];

    for k in 1..=10_u64 {
        let sent_at = start + Duration::from_millis(50 * k);
        let first = (k - 1) * 20;
        let seqs = first..first + 20;

        for seq in seqs.clone() {
            bwe.on_packet_sent(
                SentPacket {
                    ssrc: 1.into(),
                    seq: seq.into(),
                    transport_seq: Some(seq.into()),
                    size: DataSize::bytes(1000),
                },
                sent_at,
            );
        }

        let arrival = Duration::from_millis(50 * k + 20);
        let report = FeedbackReport {
            format,
            sender_ssrc: 2.into(),
            packets: seqs
                .map(|seq| PacketReport {
                    ssrc: 1.into(),
                    seq: seq.into(),
                    arrival: (seq >= first + k).then_some(arrival),
                    ecn: Ecn::NotEct,
                })
                .collect(),
            report_time: None,
        };
        bwe.on_feedback(&report, &streams, sent_at + Duration::from_millis(40));

        let rate = match bwe.target_bitrate(1.into(), &streams) {
            TargetBitrate::Rate(v) => v,
            TargetBitrate::LossDetected => match bwe.target_bitrate(1.into(), &streams) {
                TargetBitrate::Rate(v) => v,
                TargetBitrate::LossDetected => panic!("loss reported twice"),
            },
        };
        rates.push(rate);
    }

    rates
}

#[test]
pub fn rising_loss_never_raises_rate() {
    init_log();

    for kind in [EstimatorKind::Window, EstimatorKind::SelfClocked] {
        let rates = rising_loss_rates(kind);
        println!("{kind:?} {rates:?}");

        for w in rates.windows(2) {
            assert!(w[1] <= w[0], "{kind:?} {} > {}", w[1], w[0]);
        }
        assert!(rates[10] < rates[0], "{kind:?} {rates:?}");
    }
}
