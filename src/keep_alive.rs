use crate::time;

/// What the housekeeping pass must do about liveness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    Idle,
    Ping,
    Expired,
}

/// Keep-alive thresholds: ping after 70% of the interval without sending,
/// give up after 110% without receiving. A zero interval disables both.
#[derive(Clone, Copy, Debug)]
pub(crate) struct KeepAlive {
    ping_after_ms: u64,
    expire_after_ms: u64,
    enabled: bool,
}

impl KeepAlive {
    pub(crate) fn new(keep_alive_secs: u16) -> Self {
        let interval_ms = time::seconds_to_ms(keep_alive_secs.into());

        Self {
            ping_after_ms: interval_ms * 7 / 10,
            expire_after_ms: interval_ms * 11 / 10,
            enabled: keep_alive_secs != 0,
        }
    }

    pub(crate) fn check(&self, since_send_ms: u64, since_receive_ms: u64) -> Verdict {
        if !self.enabled {
            return Verdict::Idle;
        }

        if since_receive_ms >= self.expire_after_ms {
            Verdict::Expired
        } else if since_send_ms >= self.ping_after_ms {
            Verdict::Ping
        } else {
            Verdict::Idle
        }
    }
}
