//! Exchange of a pre-shared setup code for a bearer token, with lockout after
//! repeated failures.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use {
    secrecy::{ExposeSecret, Secret},
    subtle::ConstantTimeEq,
    tracing::warn,
};

use crate::error::PairingError;

const DEFAULT_MAX_FAILURES: u32 = 5;
const DEFAULT_LOCKOUT: Duration = Duration::from_secs(300);

#[derive(Default)]
struct Attempts {
    failures: u32,
    locked_until: Option<Instant>,
}

pub struct PairingGuard {
    code: Option<Secret<String>>,
    max_failures: u32,
    lockout: Duration,
    attempts: Mutex<Attempts>,
}

impl PairingGuard {
    #[must_use]
    pub fn new(code: Option<Secret<String>>) -> Self {
        Self {
            code: code.filter(|c| !c.expose_secret().is_empty()),
            max_failures: DEFAULT_MAX_FAILURES,
            lockout: DEFAULT_LOCKOUT,
            attempts: Mutex::new(Attempts::default()),
        }
    }

    #[must_use]
    pub fn with_lockout(mut self, max_failures: u32, lockout: Duration) -> Self {
        self.max_failures = max_failures.max(1);
        self.lockout = lockout;
        self
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.code.is_some()
    }

    /// Check a presented setup code. Success clears the failure count.
    pub fn check(&self, presented: &str) -> Result<(), PairingError> {
        let Some(code) = &self.code else {
            return Err(PairingError::NotConfigured);
        };

        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if let Some(until) = attempts.locked_until {
            if until > now {
                let remaining = until - now;
                return Err(PairingError::LockedOut {
                    retry_after_secs: remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0),
                });
            }
            attempts.locked_until = None;
        }

        let matches: bool = code
            .expose_secret()
            .as_bytes()
            .ct_eq(presented.as_bytes())
            .into();
        if matches {
            attempts.failures = 0;
            return Ok(());
        }

        attempts.failures += 1;
        if attempts.failures >= self.max_failures {
            attempts.failures = 0;
            attempts.locked_until = Some(now + self.lockout);
            warn!(
                lockout_secs = self.lockout.as_secs(),
                "too many failed pairing attempts, locking out"
            );
        }
        Err(PairingError::InvalidCode)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn guard(code: &str) -> PairingGuard {
        PairingGuard::new(Some(Secret::new(code.to_string())))
    }

    #[test]
    fn unconfigured_guard_refuses() {
        let g = PairingGuard::new(None);
        assert!(!g.is_configured());
        assert_eq!(g.check("anything"), Err(PairingError::NotConfigured));

        let empty = PairingGuard::new(Some(Secret::new(String::new())));
        assert_eq!(empty.check(""), Err(PairingError::NotConfigured));
    }

    #[test]
    fn correct_code_passes() {
        let g = guard("123456");
        assert!(g.check("123456").is_ok());
        assert_eq!(g.check("12345"), Err(PairingError::InvalidCode));
    }

    #[test]
    fn locks_out_after_max_failures() {
        let g = guard("123456");
        for _ in 0..5 {
            assert_eq!(g.check("000000"), Err(PairingError::InvalidCode));
        }
        match g.check("123456") {
            Err(PairingError::LockedOut { retry_after_secs }) => {
                assert!(retry_after_secs > 0 && retry_after_secs <= 300);
            },
            other => panic!("expected lockout, got {other:?}"),
        }
    }

    #[test]
    fn lockout_expires() {
        let g = guard("123456").with_lockout(2, Duration::from_millis(20));
        let _ = g.check("x");
        let _ = g.check("y");
        assert!(matches!(g.check("123456"), Err(PairingError::LockedOut { .. })));
        std::thread::sleep(Duration::from_millis(40));
        assert!(g.check("123456").is_ok());
    }

    #[test]
    fn success_resets_failure_count() {
        let g = guard("abc").with_lockout(3, Duration::from_secs(60));
        let _ = g.check("x");
        let _ = g.check("y");
        assert!(g.check("abc").is_ok());
        let _ = g.check("z");
        let _ = g.check("w");
        assert!(g.check("abc").is_ok());
    }
}
