use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag for the relay loop and client wait loops.
///
/// Polling code checks the token once per cycle, so a stop request takes
/// effect within one poll interval. Cloning is cheap and every clone
/// observes the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Idempotent.
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_running() {
        let token = StopToken::new();
        assert!(!token.is_stopped());
    }

    #[test]
    fn test_stop_is_visible_to_clones() {
        let token = StopToken::new();
        let clone = token.clone();
        token.stop();
        assert!(clone.is_stopped());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let token = StopToken::new();
        token.stop();
        token.stop();
        assert!(token.is_stopped());
    }
}
