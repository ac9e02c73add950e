//! Readiness probing for a freshly started server.
//!
//! Repeatedly tries to open a TCP connection, backing off exponentially
//! between attempts, until one succeeds or the overall budget runs out.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Exponential back-off between connect attempts.
///
/// The delay starts at `initial_delay` and doubles after every failed
/// attempt, capped at `max_delay`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl Backoff {
    /// Delay to sleep after `attempt` failures (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Outcome of a readiness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A connection was accepted after this many attempts
    Ready { attempts: u32 },
    /// Nothing accepted within the budget
    TimedOut { attempts: u32 },
    /// The probe was abandoned because the server went away
    Abandoned { attempts: u32 },
}

/// Wait until `addr` accepts a TCP connection.
///
/// `still_alive` is consulted between attempts; returning `false` ends the
/// probe early (for example when the server process has exited).
pub async fn wait_for_listener<F>(
    addr: &str,
    budget: Duration,
    backoff: Backoff,
    mut still_alive: F,
) -> Readiness
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + budget;
    let mut attempts = 0;

    loop {
        attempts += 1;
        match tokio::time::timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => {
                debug!(addr, attempts, "Listener is accepting connections");
                return Readiness::Ready { attempts };
            }
            Ok(Err(e)) => trace!(addr, attempts, error = %e, "Not ready yet"),
            Err(_) => return Readiness::TimedOut { attempts },
        }

        if !still_alive() {
            return Readiness::Abandoned { attempts };
        }

        let pause = backoff.delay(attempts - 1);
        if Instant::now() + pause >= deadline {
            tokio::time::sleep_until(deadline).await;
            return Readiness::TimedOut { attempts };
        }
        tokio::time::sleep(pause).await;
    }
}
