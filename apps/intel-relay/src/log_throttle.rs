use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum LogKind {
    DeliveryFailure,
    PingFailure,
    MalformedBusPayload,
}

impl LogKind {
    fn interval(self) -> Duration {
        match self {
            LogKind::DeliveryFailure => Duration::from_secs(10),
            LogKind::PingFailure => Duration::from_secs(30),
            LogKind::MalformedBusPayload => Duration::from_secs(60),
        }
    }
}

#[derive(Eq, PartialEq, Hash)]
struct LogKey {
    kind: LogKind,
    subject: String,
}

static LOG_MEMORY: Lazy<Mutex<HashMap<LogKey, Instant>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Rate-limits repetitive warnings per `(kind, subject)`.
pub fn should_log(kind: LogKind, subject: &str) -> bool {
    let mut guard = LOG_MEMORY.lock();
    let key = LogKey {
        kind,
        subject: subject.to_string(),
    };
    let now = Instant::now();
    if let Some(last) = guard.get(&key) {
        if now.duration_since(*last) < kind.interval() {
            return false;
        }
    }
    guard.insert(key, now);
    true
}

/// Drops memory for a subject that will not log again, e.g. a closed connection.
pub fn forget(subject: &str) {
    LOG_MEMORY.lock().retain(|key, _| key.subject != subject);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn repeats_are_suppressed_per_subject() {
        assert!(should_log(LogKind::DeliveryFailure, "throttle-a"));
        assert!(!should_log(LogKind::DeliveryFailure, "throttle-a"));
        assert!(should_log(LogKind::PingFailure, "throttle-a"));
        assert!(should_log(LogKind::DeliveryFailure, "throttle-b"));
        forget("throttle-a");
        assert!(should_log(LogKind::DeliveryFailure, "throttle-a"));
    }
}
