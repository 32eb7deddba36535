use crate::ValidationError;
use std::time::Duration;

/// An admission ceiling over a trailing window.
///
/// A key may have at most `max_requests` admitted requests whose timestamps lie within
/// `(now - window_ms, now]`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct WindowPolicy {
    max_requests: u64,
    window_ms: u64,
}

impl WindowPolicy {
    /// # Errors
    ///
    /// Both values must be non-zero, construction fails fast with a [ValidationError]
    /// otherwise.
    pub fn new(max_requests: u64, window_ms: u64) -> Result<Self, ValidationError> {
        if max_requests == 0 {
            return Err(ValidationError::ZeroMaxRequests);
        }
        if window_ms == 0 {
            return Err(ValidationError::ZeroWindow);
        }
        Ok(Self {
            max_requests,
            window_ms,
        })
    }

    /// The total requests to be allowed within the window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// The sliding window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_zero_values() {
        assert_eq!(
            WindowPolicy::new(0, 1000),
            Err(ValidationError::ZeroMaxRequests)
        );
        assert_eq!(WindowPolicy::new(3, 0), Err(ValidationError::ZeroWindow));
    }

    #[test]
    fn test_accessors() {
        let policy = WindowPolicy::new(3, 1500).unwrap();
        assert_eq!(policy.max_requests(), 3);
        assert_eq!(policy.window_ms(), 1500);
        assert_eq!(policy.window(), Duration::from_millis(1500));
    }
}
