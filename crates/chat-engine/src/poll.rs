use std::{sync::Arc, time::Duration};

use chat_core::{
    AccountData, ChatError, ChatEvent, ChatMap, ChatsRequest, PollBatch, RateCategory,
    advance_watermark, normalize_account_data_response, normalize_chats_response,
};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{EngineShared, cancellable};

pub(crate) struct RunningPollTask {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningPollTask {
    pub(crate) async fn stop(self) {
        self.stop.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "poll task ended abnormally");
        }
    }
}

/// Spawn the poll timer: one cycle per poll interval until stopped.
///
/// A failed cycle is reported as [`ChatEvent::PollFailed`] and the timer
/// fires again on the next interval; only cancellation ends the loop. The rate
/// is re-read before every tick.
pub(crate) fn spawn_poll_loop(shared: Arc<EngineShared>) -> RunningPollTask {
    let stop = shared.shutdown.child_token();
    let stop_child = stop.clone();

    let task = tokio::spawn(async move {
        debug!(poll_rate_ms = shared.poll_rate_ms(), "poll task started");
        loop {
            let delay = Duration::from_millis(shared.poll_rate_ms());
            tokio::select! {
                _ = stop_child.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            match shared.run_cycle(&stop_child).await {
                Ok(Some(batch)) => {
                    let new_messages: usize = batch.values().map(Vec::len).sum();
                    debug!(users = batch.len(), new_messages, "poll cycle completed");
                }
                Ok(None) => debug!("previous poll cycle still running; tick skipped"),
                Err(err) if err.is_cancelled() => break,
                Err(err) => {
                    warn!(
                        category = ?err.category,
                        code = %err.code,
                        message = %err.message,
                        recoverable = err.is_recoverable(),
                        "poll cycle failed"
                    );
                    shared.channels.emit(ChatEvent::PollFailed { error: err });
                }
            }
        }
        debug!("poll task stopped");
    });

    RunningPollTask { stop, task }
}

impl EngineShared {
    /// Run one poll cycle unless another one is in flight.
    ///
    /// Returns `Ok(None)` when the cycle was skipped. A failure leaves the
    /// known-ID set and the watermark untouched.
    pub(crate) async fn run_cycle(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<PollBatch>, ChatError> {
        let Ok(_cycle) = self.cycle_gate.try_lock() else {
            return Ok(None);
        };
        let token = self.session.require_token()?;

        let slot = self.limiter.acquire(RateCategory::Chats, cancel).await?;
        let users = self.session.user_keys();
        let watermark = self.session.watermark();
        let request = ChatsRequest::after(token, users, watermark - 1.0);
        let response = cancellable(cancel, self.transport.get_chats(&request)).await?;
        let chats = normalize_chats_response(response)?;

        let outcome = self.session.fold(chats, watermark);
        self.channels.emit(ChatEvent::MessagesReceived {
            batch: outcome.batch.clone(),
        });
        let new_messages = outcome.new_message_count();
        self.session.replace_known_ids(outcome.seen_ids);

        let next = advance_watermark(
            outcome.max_timestamp,
            self.clock.now_secs(),
            self.config.drift_limit_secs,
        );
        if next > outcome.max_timestamp {
            debug!(from = outcome.max_timestamp, to = next, "watermark pulled up to now");
        }
        self.session.set_watermark(next);
        slot.release();

        if new_messages > 0 {
            debug!(new_messages, watermark = next, "new messages received");
        }

        let interval = Duration::from_secs(self.config.refresh_interval_secs);
        if self.session.refresh_due(Instant::now(), interval) {
            self.refresh_account_data(cancel).await?;
        }

        Ok(Some(outcome.batch))
    }

    /// Fetch account/channel metadata and merge it into the cached mapping.
    pub(crate) async fn refresh_account_data(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AccountData, ChatError> {
        let token = self.session.require_token()?;

        let slot = self
            .limiter
            .acquire(RateCategory::AccountData, cancel)
            .await?;
        let response = cancellable(cancel, self.transport.get_account_data(&token)).await?;
        self.session.mark_refreshed(Instant::now());
        slot.release();

        let fresh = normalize_account_data_response(response)?;
        let mut users: Vec<String> = fresh.keys().cloned().collect();
        users.sort_unstable();
        let merged = self.session.merge_account_data(fresh);

        info!(users = users.len(), "account data refreshed");
        self.channels
            .emit(ChatEvent::AccountDataRefreshed { users });
        Ok(merged)
    }

    /// One bounded chat query for every account user, outside the poll cycle.
    pub(crate) async fn fetch_chats(
        &self,
        before: Option<f64>,
        after: Option<f64>,
        cancel: &CancellationToken,
    ) -> Result<ChatMap, ChatError> {
        let token = self.session.require_token()?;
        let request = ChatsRequest::new(token, self.session.user_keys(), before, after)?;

        let _slot = self.limiter.acquire(RateCategory::Chats, cancel).await?;
        let response = cancellable(cancel, self.transport.get_chats(&request)).await?;
        normalize_chats_response(response)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use std::time::Duration;

    use chat_core::{ChatError, ChatErrorCategory, ChatEvent, Message, RateCategory};

    use crate::test_support::{Fixture, fixture, message, next_matching};

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    async fn connected(start_secs: f64) -> Fixture {
        let fx = fixture(start_secs);
        fx.engine.connect_token("tok").await.expect("connect");
        fx.engine.set_polling(false).await.expect("stop timer");
        fx
    }

    #[tokio::test(start_paused = true)]
    async fn reports_each_message_once_across_cycles() {
        let fx = connected(90.0).await;
        assert_eq!(fx.engine.watermark(), 90.0);

        fx.service.deliver("alice", message("a", 100.0)).expect("deliver");
        fx.service.deliver("alice", message("b", 105.0)).expect("deliver");
        fx.clock.set(106.0);
        let first = fx
            .engine
            .poll_once()
            .await
            .expect("first cycle")
            .expect("cycle ran");
        assert_eq!(ids(&first["alice"]), vec!["a", "b"]);
        assert_eq!(fx.engine.watermark(), 105.0);

        fx.service.deliver("alice", message("c", 110.0)).expect("deliver");
        fx.clock.set(111.0);
        let second = fx
            .engine
            .poll_once()
            .await
            .expect("second cycle")
            .expect("cycle ran");
        assert_eq!(ids(&second["alice"]), vec!["c"]);
        assert_eq!(
            fx.engine.known_message_ids(),
            HashSet::from(["b".to_owned(), "c".to_owned()])
        );
        assert_eq!(fx.engine.watermark(), 110.0);
    }

    #[tokio::test(start_paused = true)]
    async fn replayed_response_yields_empty_lists() {
        let fx = connected(90.0).await;
        fx.service.deliver("alice", message("a", 100.0)).expect("deliver");
        fx.clock.set(101.0);
        fx.engine.poll_once().await.expect("first cycle");

        let replay = fx
            .engine
            .poll_once()
            .await
            .expect("replay cycle")
            .expect("cycle ran");
        assert!(replay["alice"].is_empty());
        assert!(!replay.contains_key("bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn every_cycle_notifies_subscribers() {
        let fx = connected(90.0).await;
        let mut events = fx.engine.subscribe();

        fx.engine.poll_once().await.expect("cycle");
        let event = next_matching(&mut events, |event| {
            matches!(event, ChatEvent::MessagesReceived { .. })
        })
        .await;
        assert_eq!(
            event,
            ChatEvent::MessagesReceived {
                batch: Default::default()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cycle_leaves_state_untouched() {
        let fx = connected(90.0).await;
        fx.service.deliver("alice", message("a", 100.0)).expect("deliver");
        fx.clock.set(101.0);
        fx.engine.poll_once().await.expect("first cycle");

        fx.service.fail_next_polls(1, "db down").expect("queue failure");
        let err = fx.engine.poll_once().await.expect_err("rejected cycle");
        assert_eq!(err.category, ChatErrorCategory::Poll);
        assert!(err.message.contains("db down"));
        assert_eq!(fx.engine.watermark(), 100.0);
        assert_eq!(
            fx.engine.known_message_ids(),
            HashSet::from(["a".to_owned()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_watermark_is_pulled_up_to_now() {
        let fx = connected(1_000.0).await;
        fx.clock.set(2_000.0);

        fx.engine.poll_once().await.expect("cycle");
        assert_eq!(fx.engine.watermark(), 2_000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_messages_are_reported_without_lowering_watermark() {
        let fx = connected(500.0).await;
        fx.service.deliver("alice", message("late", 499.5)).expect("deliver");

        let batch = fx
            .engine
            .poll_once()
            .await
            .expect("cycle")
            .expect("cycle ran");
        assert_eq!(ids(&batch["alice"]), vec!["late"]);
        assert_eq!(fx.engine.watermark(), 500.0);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_cycle_is_skipped() {
        let fx = connected(90.0).await;
        fx.engine.poll_once().await.expect("warm-up cycle");

        // The first of these waits out the chats spacing while holding the
        // cycle, so the second one finds it busy.
        let (a, b) = tokio::join!(fx.engine.poll_once(), fx.engine.poll_once());
        let ran = [a.expect("first"), b.expect("second")]
            .iter()
            .filter(|outcome| outcome.is_some())
            .count();
        assert_eq!(ran, 1);
        assert_eq!(fx.service.calls(RateCategory::Chats), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_account_data_hourly() {
        let fx = connected(90.0).await;
        assert_eq!(fx.service.calls(RateCategory::AccountData), 1);

        fx.engine.poll_once().await.expect("cycle");
        assert_eq!(fx.service.calls(RateCategory::AccountData), 1);

        fx.service.join_channel("carol", "0000").expect("join carol");
        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        fx.engine.poll_once().await.expect("cycle");
        assert_eq!(fx.service.calls(RateCategory::AccountData), 2);
        assert!(fx.engine.account_data().contains_key("carol"));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_keeps_polling_after_failure() {
        let fx = fixture(90.0);
        let mut events = fx.engine.subscribe();
        fx.service.fail_next_polls(1, "db down").expect("queue failure");
        fx.engine.connect_token("tok").await.expect("connect");

        let failed = next_matching(&mut events, |event| {
            matches!(event, ChatEvent::PollFailed { .. })
        })
        .await;
        let ChatEvent::PollFailed { error } = failed else {
            unreachable!("filtered above");
        };
        assert_eq!(error.category, ChatErrorCategory::Poll);

        fx.service.deliver("alice", message("a", 95.0)).expect("deliver");
        let received = next_matching(&mut events, |event| {
            matches!(event, ChatEvent::MessagesReceived { .. })
        })
        .await;
        let ChatEvent::MessagesReceived { batch } = received else {
            unreachable!("filtered above");
        };
        assert_eq!(ids(&batch["alice"]), vec!["a"]);
        assert!(fx.engine.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_hourly_refresh_still_delivers_the_batch() {
        let fx = connected(90.0).await;
        let mut events = fx.engine.subscribe();
        fx.service.deliver("alice", message("a", 100.0)).expect("deliver");
        fx.clock.set(101.0);
        fx.service
            .fail_next_account_data(1, "maintenance")
            .expect("queue failure");
        tokio::time::advance(Duration::from_secs(60 * 60)).await;

        let err = fx.engine.poll_once().await.expect_err("refresh failed");
        assert_eq!(err.category, ChatErrorCategory::Refresh);
        assert!(err.message.contains("maintenance"));
        assert_eq!(fx.service.calls(RateCategory::AccountData), 2);

        let received = next_matching(&mut events, |event| {
            matches!(event, ChatEvent::MessagesReceived { .. })
        })
        .await;
        let ChatEvent::MessagesReceived { batch } = received else {
            unreachable!("filtered above");
        };
        assert_eq!(ids(&batch["alice"]), vec!["a"]);
        assert_eq!(fx.engine.watermark(), 100.0);
        assert_eq!(
            fx.engine.known_message_ids(),
            HashSet::from(["a".to_owned()])
        );

        // The attempt counts as this hour's refresh; the timer carries on.
        fx.service.deliver("alice", message("b", 102.0)).expect("deliver");
        fx.engine.set_polling(true).await.expect("start timer");
        let received = next_matching(&mut events, |event| {
            matches!(event, ChatEvent::MessagesReceived { batch }
                if batch.get("alice").is_some_and(|messages| !messages.is_empty()))
        })
        .await;
        let ChatEvent::MessagesReceived { batch } = received else {
            unreachable!("filtered above");
        };
        assert_eq!(ids(&batch["alice"]), vec!["b"]);
        assert_eq!(fx.service.calls(RateCategory::AccountData), 2);
        assert!(fx.engine.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_survives_a_cycle_error_it_cannot_recover_from() {
        let fx = fixture(90.0);
        let mut events = fx.engine.subscribe();
        fx.service
            .error_next_polls(1, ChatError::authentication("token revoked"))
            .expect("queue error");
        fx.engine.connect_token("tok").await.expect("connect");

        let failed = next_matching(&mut events, |event| {
            matches!(event, ChatEvent::PollFailed { .. })
        })
        .await;
        let ChatEvent::PollFailed { error } = failed else {
            unreachable!("filtered above");
        };
        assert_eq!(error.category, ChatErrorCategory::Authentication);
        assert!(!error.is_recoverable());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(fx.engine.is_polling());
        let polls = fx.service.calls(RateCategory::Chats);
        assert!(polls > 1, "timer stopped after {polls} polls");

        // The reported state and the timer agree in both directions.
        fx.engine.set_polling(false).await.expect("stop timer");
        assert!(!fx.engine.is_polling());
        let stopped_at = fx.service.calls(RateCategory::Chats);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fx.service.calls(RateCategory::Chats), stopped_at);

        fx.engine.set_polling(true).await.expect("restart timer");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(fx.engine.is_polling());
        assert!(fx.service.calls(RateCategory::Chats) > stopped_at);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_history_query_is_rejected_locally() {
        let fx = connected(90.0).await;
        let before = fx.service.calls(RateCategory::Chats);

        let err = fx
            .engine
            .fetch_chats(None, None)
            .await
            .expect_err("unbounded query");
        assert_eq!(err.category, ChatErrorCategory::InvalidArgument);
        assert_eq!(fx.service.calls(RateCategory::Chats), before);
    }

    #[tokio::test(start_paused = true)]
    async fn history_fetch_returns_older_messages() {
        let fx = connected(200.0).await;
        fx.service.deliver("alice", message("old", 50.0)).expect("deliver");
        fx.service.deliver("alice", message("new", 150.0)).expect("deliver");

        let history = fx.engine.fetch_history(100.0).await.expect("history");
        assert_eq!(ids(&history["alice"]), vec!["old"]);
        assert!(fx.engine.known_message_ids().is_empty());
    }
}
