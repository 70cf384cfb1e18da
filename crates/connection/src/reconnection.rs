//! Reconnection controller with exponential backoff.
//!
//! Drives sessions back to back: each failed session schedules the next one
//! after a jittered delay, until the stop signal fires or the attempt budget
//! runs out.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TerminalReconnectError;
use crate::session::{SessionContext, SessionOutcome, run_session};
use crate::types::{ConnectionState, MonitorEvent};

/// Runs sessions until stopped (`Ok`) or out of attempts (`Err`).
pub(crate) async fn run(
    ctx: SessionContext,
    cancel: CancellationToken,
) -> Result<(), TerminalReconnectError> {
    let policy = &ctx.config.reconnect;
    // Consecutive failures since the last stable session.
    let mut attempt: u32 = 0;

    loop {
        let (error, connected_for) = match run_session(&ctx, &cancel).await {
            SessionOutcome::Stopped => break,
            SessionOutcome::Failed {
                error,
                connected_for,
            } => (error, connected_for),
        };
        if cancel.is_cancelled() {
            break;
        }

        if connected_for.is_some_and(|uptime| uptime >= policy.stability_window) {
            debug!(previous_attempts = attempt, "session was stable, resetting backoff");
            attempt = 0;
        }

        if let Some(max) = policy.max_attempts
            && attempt >= max
        {
            let terminal = TerminalReconnectError {
                attempts: attempt,
                last_error: error.to_string(),
            };
            warn!(attempts = attempt, error = %error, "giving up on reconnection");
            ctx.notifier.set_state(ConnectionState::Failed {
                reason: terminal.to_string(),
            });
            return Err(terminal);
        }

        let delay = policy.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        let delay_secs = delay.as_secs_f64();

        ctx.notifier
            .set_state(ConnectionState::Reconnecting { attempt });
        ctx.notifier.emit(MonitorEvent::Reconnecting {
            attempt,
            next_retry_secs: delay_secs,
        });
        info!(
            attempt,
            delay_secs = format_args!("{delay_secs:.1}"),
            error = %error,
            "reconnecting"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reconnect cancelled");
                break;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    ctx.notifier.set_state(ConnectionState::Disconnected);
    Ok(())
}
