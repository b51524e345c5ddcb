use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::app::AppState;

const ARCHIVE_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Background maintenance: daily session archival and periodic cache
/// sweeping.
pub fn spawn(state: Arc<AppState>) {
    let archiver = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ARCHIVE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            archive_inactive(&archiver);
        }
    });

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            state.cache.sweep();
        }
    });
}

fn archive_inactive(state: &Arc<AppState>) {
    match state
        .sessions
        .archive_older_than(state.config.session.archive_days)
    {
        Ok(session_ids) => {
            for session_id in &session_ids {
                state.context.clear_context(session_id);
                if let Ok(session) = state.sessions.get(session_id) {
                    state
                        .context
                        .remove_active_session(session.user_id, session_id);
                }
            }
            if !session_ids.is_empty() {
                info!(count = session_ids.len(), "archived inactive sessions");
            }
        }
        Err(e) => error!(error = %e, "session archival failed"),
    }
}
