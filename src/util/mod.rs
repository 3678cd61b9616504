mod time;
pub(crate) use time::{already_happened, Soonest};
