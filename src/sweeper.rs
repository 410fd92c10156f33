//! Periodic scan raising the time-based triggers and reminding staff about
//! booking requests that have waited too long.
//!
//! The sweeper keeps a watermark: the time of its previous pass. Each pass
//! scans `[last - threshold, now - threshold)` for every band, so the windows
//! of consecutive passes tile without gaps however long a pass takes, and a
//! conversation crosses each threshold in exactly one pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{error, info};

use crate::AppState;
use crate::booking;
use crate::models::execution::TriggerContext;
use crate::models::rule::TriggerType;
use crate::rule_engine;

const JITTER_PCT: u64 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub triggers_raised: usize,
    pub rules_fired: usize,
    pub reminders_sent: usize,
}

struct Band {
    trigger: TriggerType,
    after: chrono::Duration,
    unanswered_only: bool,
}

fn bands() -> [Band; 3] {
    [
        Band {
            trigger: TriggerType::NoResponse24h,
            after: chrono::Duration::hours(24),
            unanswered_only: true,
        },
        Band {
            trigger: TriggerType::NoResponse48h,
            after: chrono::Duration::hours(48),
            unanswered_only: true,
        },
        Band {
            trigger: TriggerType::CustomerIdle7d,
            after: chrono::Duration::days(7),
            unanswered_only: false,
        },
    ]
}

/// Sweep state carried between passes.
#[derive(Debug, Clone, Copy)]
pub struct Sweeper {
    last_swept: DateTime<Utc>,
}

impl Sweeper {
    /// The first pass covers everything that crossed a threshold after `at`.
    pub fn starting_at(at: DateTime<Utc>) -> Self {
        Self { last_swept: at }
    }

    pub fn last_swept(&self) -> DateTime<Utc> {
        self.last_swept
    }

    /// Runs one pass up to the clock's current time and advances the
    /// watermark to it.
    pub async fn sweep(&mut self, state: &AppState) -> SweepReport {
        let now = state.clock.now();
        let report = sweep_between(state, self.last_swept, now).await;
        self.last_swept = self.last_swept.max(now);
        report
    }
}

/// Raises every band's trigger for conversations that crossed the threshold
/// in `[since, until)`, then sends due booking reminders.
pub async fn sweep_between(
    state: &AppState,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> SweepReport {
    let mut report = SweepReport::default();

    if until > since {
        for band in bands() {
            sweep_band(state, &band, since - band.after, until - band.after, &mut report).await;
        }
    }

    report.reminders_sent = remind_pending_bookings(state, until).await;

    if report != SweepReport::default() {
        info!(
            triggers_raised = report.triggers_raised,
            rules_fired = report.rules_fired,
            reminders_sent = report.reminders_sent,
            "Sweep finished"
        );
    }
    report
}

async fn sweep_band(
    state: &AppState,
    band: &Band,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    report: &mut SweepReport,
) {
    let page_size = state.settings.sweep_page_size.max(1);
    let mut cursor = None;

    loop {
        let page = match state
            .store
            .conversations_by_last_customer_message(
                from,
                to,
                band.unanswered_only,
                cursor,
                page_size,
            )
            .await
        {
            Ok(page) => page,
            Err(e) => {
                error!(trigger = band.trigger.as_str(), error = %e, "Sweep query failed");
                return;
            }
        };

        let Some(last) = page.last() else { return };
        let Some(last_at) = last.last_customer_message_at else {
            return;
        };
        cursor = Some((last_at, last.id));
        let exhausted = (page.len() as i64) < page_size;

        for conversation in page {
            let ctx = TriggerContext {
                tenant_id: Some(conversation.tenant_id),
                conversation_id: Some(conversation.id),
                customer_id: Some(conversation.customer_id),
                ..Default::default()
            };
            let results = rule_engine::process_trigger(state, band.trigger, ctx).await;
            report.triggers_raised += 1;
            report.rules_fired += results.len();
        }

        if exhausted {
            return;
        }
    }
}

/// A request notified `n` times gets its next reminder once it has waited
/// `n * booking_renotify_minutes`.
async fn remind_pending_bookings(state: &AppState, now: DateTime<Utc>) -> usize {
    let step = state.settings.booking_renotify_minutes;
    if step <= 0 {
        return 0;
    }

    let pending = match state.store.pending_booking_requests(None).await {
        Ok(pending) => pending,
        Err(e) => {
            error!(error = %e, "Failed to list pending booking requests");
            return 0;
        }
    };

    let mut sent = 0;
    for request in pending {
        let waited = now.signed_duration_since(request.created_at).num_minutes();
        let due_after = step * i64::from(request.notification_count.max(1));
        if waited < due_after {
            continue;
        }
        match booking::notify_staff(state, &request, true).await {
            Ok(()) => sent += 1,
            Err(e) => error!(
                booking_request_id = %request.id,
                error = %e,
                "Failed to send booking reminder"
            ),
        }
    }
    sent
}

/// Sweeps forever, sleeping `interval` plus up to 10% random jitter between
/// passes so several workers do not scan in lockstep. The first pass also
/// covers the interval before startup.
pub async fn run(state: Arc<AppState>, interval: Duration) {
    info!(interval_secs = interval.as_secs(), "Trigger sweeper started");
    let lookback = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::minutes(5));
    let mut sweeper = Sweeper::starting_at(state.clock.now() - lookback);
    loop {
        let base = interval.as_millis() as u64;
        let variance = base * JITTER_PCT / 100;
        let jitter = if variance > 0 {
            rand::thread_rng().gen_range(0..=variance)
        } else {
            0
        };
        let pause = Duration::from_millis(base + jitter);
        tokio::time::sleep(pause).await;
        sweeper.sweep(&state).await;
    }
}
