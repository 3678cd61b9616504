macro_rules! log_delay_variation {
    ($($arg:expr),+) => {
        crate::log_stat!("DELAY_VARIATION", $($arg),+);
    }
}

macro_rules! log_trendline_estimate {
    ($($arg:expr),+) => {
        crate::log_stat!("TRENDLINE_ESTIMATE", $($arg),+);
    }
}

macro_rules! log_trendline_modified_trend {
    ($($arg:expr),+) => {
        crate::log_stat!("TRENDLINE_MODIFIED_TREND", $($arg),+);
    }
}

macro_rules! log_congestion_window {
    ($($arg:expr),+) => {
        crate::log_stat!("CONGESTION_WINDOW", $($arg),+);
    }
}

macro_rules! log_rtt {
    ($($arg:expr),+) => {
        crate::log_stat!("RTT", $($arg),+);
    }
}

macro_rules! log_queue_delay {
    ($($arg:expr),+) => {
        crate::log_stat!("QUEUE_DELAY_ESTIMATE", $($arg),+);
    }
}

macro_rules! log_loss {
    ($($arg:expr),+) => {
        crate::log_stat!("LOSS", $($arg),+);
    }
}

macro_rules! log_target_bitrate {
    ($($arg:expr),+) => {
        crate::log_stat!("TARGET_BITRATE", $($arg),+);
    }
}

macro_rules! log_pacer_debt {
    ($($arg:expr),+) => {
        crate::log_stat!("PACER_DEBT", $($arg),+);
    }
}

pub(crate) use log_congestion_window;
pub(crate) use log_delay_variation;
pub(crate) use log_loss;
pub(crate) use log_pacer_debt;
pub(crate) use log_queue_delay;
pub(crate) use log_rtt;
pub(crate) use log_target_bitrate;
pub(crate) use log_trendline_estimate;
pub(crate) use log_trendline_modified_trend;
