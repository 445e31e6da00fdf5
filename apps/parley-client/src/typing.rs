use std::time::{Duration, Instant};

use parley_protocol::{
    encode_event, DirectTypingCommand, ProtocolError, RoomTypingCommand,
    DIRECT_TYPING_START_EVENT, DIRECT_TYPING_STOP_EVENT, TYPING_START_EVENT, TYPING_STOP_EVENT,
};

pub const TYPING_IDLE_INTERVAL: Duration = Duration::from_millis(1_500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Stop,
}

/// Where typing frames are addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingTarget {
    Room(String),
    Direct(String),
}

/// Turns keystrokes into start/stop signals: one start per burst, one stop
/// after the idle interval or on send.
#[derive(Debug, Clone)]
pub struct TypingDebounce {
    idle: Duration,
    last_input: Option<Instant>,
}

impl Default for TypingDebounce {
    fn default() -> Self {
        Self::new(TYPING_IDLE_INTERVAL)
    }
}

impl TypingDebounce {
    #[must_use]
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            last_input: None,
        }
    }

    #[must_use]
    pub fn is_typing(&self) -> bool {
        self.last_input.is_some()
    }

    pub fn on_input(&mut self, now: Instant) -> Option<TypingSignal> {
        let started = self.last_input.is_none();
        self.last_input = Some(now);
        started.then_some(TypingSignal::Start)
    }

    pub fn on_tick(&mut self, now: Instant) -> Option<TypingSignal> {
        let last = self.last_input?;
        if now.saturating_duration_since(last) < self.idle {
            return None;
        }
        self.last_input = None;
        Some(TypingSignal::Stop)
    }

    pub fn on_send(&mut self) -> Option<TypingSignal> {
        self.last_input.take().map(|_| TypingSignal::Stop)
    }

    /// When the pending stop falls due, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.last_input.map(|last| last + self.idle)
    }
}

/// Encodes the gateway frame for `signal` aimed at `target`.
///
/// # Errors
/// Returns [`ProtocolError`] if the frame cannot be encoded.
pub fn typing_frame(target: &TypingTarget, signal: TypingSignal) -> Result<String, ProtocolError> {
    match (target, signal) {
        (TypingTarget::Room(room_id), signal) => {
            let event = match signal {
                TypingSignal::Start => TYPING_START_EVENT,
                TypingSignal::Stop => TYPING_STOP_EVENT,
            };
            encode_event(
                event,
                &RoomTypingCommand {
                    room_id: room_id.clone(),
                },
            )
        }
        (TypingTarget::Direct(receiver_id), signal) => {
            let event = match signal {
                TypingSignal::Start => DIRECT_TYPING_START_EVENT,
                TypingSignal::Stop => DIRECT_TYPING_STOP_EVENT,
            };
            encode_event(
                event,
                &DirectTypingCommand {
                    receiver_id: receiver_id.clone(),
                },
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use serde_json::Value;

    use super::{typing_frame, TypingDebounce, TypingSignal, TypingTarget};

    #[test]
    fn burst_of_keystrokes_emits_one_start() {
        let start = Instant::now();
        let mut debounce = TypingDebounce::default();
        assert_eq!(debounce.on_input(start), Some(TypingSignal::Start));
        assert_eq!(debounce.on_input(start + Duration::from_millis(300)), None);
        assert_eq!(debounce.on_input(start + Duration::from_millis(900)), None);
        assert!(debounce.is_typing());
    }

    #[test]
    fn stop_fires_after_idle_interval_measured_from_last_input() {
        let start = Instant::now();
        let mut debounce = TypingDebounce::new(Duration::from_millis(1_500));
        debounce.on_input(start);
        debounce.on_input(start + Duration::from_millis(1_000));
        assert_eq!(debounce.on_tick(start + Duration::from_millis(2_000)), None);
        assert_eq!(
            debounce.deadline(),
            Some(start + Duration::from_millis(2_500))
        );
        assert_eq!(
            debounce.on_tick(start + Duration::from_millis(2_500)),
            Some(TypingSignal::Stop)
        );
        assert_eq!(debounce.on_tick(start + Duration::from_millis(4_000)), None);
        assert_eq!(
            debounce.on_input(start + Duration::from_millis(4_100)),
            Some(TypingSignal::Start)
        );
    }

    #[test]
    fn sending_stops_typing_once() {
        let mut debounce = TypingDebounce::default();
        debounce.on_input(Instant::now());
        assert_eq!(debounce.on_send(), Some(TypingSignal::Stop));
        assert_eq!(debounce.on_send(), None);
        assert_eq!(debounce.deadline(), None);
    }

    #[test]
    fn frames_address_room_or_direct_partner() {
        let room = typing_frame(&TypingTarget::Room(String::from("r1")), TypingSignal::Start)
            .unwrap();
        let room: Value = serde_json::from_str(&room).unwrap();
        assert_eq!(room["t"], "typing_start");
        assert_eq!(room["d"]["room_id"], "r1");

        let direct = typing_frame(&TypingTarget::Direct(String::from("u2")), TypingSignal::Stop)
            .unwrap();
        let direct: Value = serde_json::from_str(&direct).unwrap();
        assert_eq!(direct["t"], "direct_typing_stop");
        assert_eq!(direct["d"]["receiver_id"], "u2");
    }
}
