use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Suppresses repeated outbound typing-start frames. A stop frame always
/// passes and re-arms the window.
pub struct TypingNotifier {
    last_start: Mutex<Option<Instant>>,
    debounce: Duration,
}

impl TypingNotifier {
    pub fn new(debounce: Duration) -> Self {
        Self {
            last_start: Mutex::new(None),
            debounce,
        }
    }

    /// Whether a typing frame carrying this flag should go out now.
    pub fn should_send(&self, is_typing: bool) -> bool {
        let mut guard = self.last_start.lock();
        if !is_typing {
            *guard = None;
            return true;
        }
        let now = Instant::now();
        let due = match *guard {
            Some(prev) => now.duration_since(prev) >= self.debounce,
            None => true,
        };
        if due {
            *guard = Some(now);
        }
        due
    }
}
