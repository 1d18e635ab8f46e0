use super::error::LedgerError;

/// Bounded retry for optimistic balance updates.
///
/// Only `OptimisticLockConflict` is retried; every other error returns at
/// once. `op` receives the zero-based attempt number and must re-read the
/// state it modifies on every call.
#[derive(Debug, Clone, Copy)]
pub struct LockRetry {
    max_attempts: u32,
}

impl LockRetry {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn run<T>(
        &self,
        mut op: impl FnMut(u32) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Err(LedgerError::OptimisticLockConflict { user_id }) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(LedgerError::OptimisticLockConflict { user_id });
                    }
                    tracing::debug!(%user_id, attempt, "Balance version conflict, retrying");
                }
                other => return other,
            }
        }
    }
}

impl Default for LockRetry {
    fn default() -> Self {
        Self::new(2)
    }
}
