use chat_core::{
    ChatError, RATE_LIMITED_MARKER, RateCategory, SendKind, SendRejection, SendRequest,
    SendResponse, normalize_send_response, sleep_cancellable,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{EngineShared, cancellable};

impl EngineShared {
    /// Deliver one message, retrying "too fast" rejections with linear backoff.
    ///
    /// The create-chat slot is held across every attempt, so concurrent sends
    /// go out one at a time in arrival order. Any other rejection, a transport
    /// failure or cancellation ends the send at once.
    pub(crate) async fn send(
        &self,
        request: &SendRequest,
        cancel: &CancellationToken,
    ) -> Result<(), ChatError> {
        let token = self.session.require_token()?;
        let policy = self.config.send_retry;

        let _slot = self
            .limiter
            .acquire(RateCategory::CreateChat, cancel)
            .await?;

        let mut last_rejection = None;
        for attempt in 0..policy.max_attempts() {
            let delay = policy.delay_before_attempt(attempt);
            if !delay.is_zero() {
                sleep_cancellable(delay, cancel).await?;
            }
            if cancel.is_cancelled() {
                return Err(ChatError::cancelled());
            }

            let response = cancellable(cancel, self.dispatch(&token, request)).await?;
            match normalize_send_response(response) {
                None => {
                    debug!(
                        kind = ?request.kind,
                        username = %request.username,
                        target = %request.target,
                        attempt,
                        "message sent"
                    );
                    return Ok(());
                }
                Some(SendRejection::RateLimited { message }) => {
                    warn!(attempt, max_attempts = policy.max_attempts(), "send rate limited");
                    last_rejection = Some(message);
                }
                Some(SendRejection::Rejected { message }) => {
                    warn!(kind = ?request.kind, message = %message, "send rejected");
                    return Err(ChatError::send(message));
                }
            }
        }

        Err(ChatError::send_rate_limited(
            last_rejection.unwrap_or_else(|| RATE_LIMITED_MARKER.to_owned()),
        ))
    }

    async fn dispatch(&self, token: &str, request: &SendRequest) -> Result<SendResponse, ChatError> {
        match request.kind {
            SendKind::Channel => {
                self.transport
                    .send_channel(token, &request.username, &request.target, &request.body)
                    .await
            }
            SendKind::Tell => {
                self.transport
                    .send_tell(token, &request.username, &request.target, &request.body)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chat_core::{ChatErrorCategory, RateCategory, SendRequest};
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use crate::test_support::{Fixture, fixture};

    const TOO_FAST: &str = "You are sending messages too fast.";

    async fn connected() -> Fixture {
        let fx = fixture(1_000.0);
        fx.engine.connect_token("tok").await.expect("connect");
        fx.engine.set_polling(false).await.expect("stop timer");
        fx
    }

    #[tokio::test(start_paused = true)]
    async fn channel_send_goes_to_the_channel_endpoint() {
        let fx = connected().await;

        fx.engine
            .send_channel("alice", "0000", "hello")
            .await
            .expect("send");

        assert_eq!(
            fx.service.sent(),
            vec![SendRequest::channel("alice", "0000", "hello")]
        );
        let history = fx.engine.fetch_history(1_001.0).await.expect("history");
        assert_eq!(history["bob"][0].channel.as_deref(), Some("0000"));
    }

    #[tokio::test(start_paused = true)]
    async fn tell_reaches_recipient() {
        let fx = connected().await;

        fx.engine.send_tell("alice", "bob", "psst").await.expect("tell");

        let history = fx.engine.fetch_history(1_001.0).await.expect("history");
        assert!(history["bob"][0].is_direct());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_five_rate_limited_attempts() {
        let fx = connected().await;
        fx.service.reject_next_sends(5, TOO_FAST).expect("queue");
        let start = Instant::now();

        let err = fx
            .engine
            .send_tell("alice", "bob", "hey")
            .await
            .expect_err("out of attempts");

        assert_eq!(err.category, ChatErrorCategory::Send);
        assert_eq!(err.message, TOO_FAST);
        assert_eq!(fx.service.calls(RateCategory::CreateChat), 5);
        // One create-chat spacing, then 100 + 200 + 300 + 400 ms of backoff.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2_000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(2_100), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_rate_limit_clears() {
        let fx = connected().await;
        fx.service.reject_next_sends(2, TOO_FAST).expect("queue");
        let start = Instant::now();

        fx.engine
            .send_tell("alice", "bob", "hey")
            .await
            .expect("third attempt succeeds");

        assert_eq!(fx.service.calls(RateCategory::CreateChat), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1_300), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1_400), "{elapsed:?}");
        assert_eq!(fx.service.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn other_rejections_are_not_retried() {
        let fx = connected().await;

        let err = fx
            .engine
            .send_channel("alice", "town", "hi")
            .await
            .expect_err("not a member");

        assert_eq!(err.category, ChatErrorCategory::Send);
        assert!(err.message.contains("town"));
        assert_eq!(fx.service.calls(RateCategory::CreateChat), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_backoff() {
        let fx = connected().await;
        fx.service.reject_next_sends(5, TOO_FAST).expect("queue");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_150)).await;
            trigger.cancel();
        });

        let err = fx
            .engine
            .send(SendRequest::tell("alice", "bob", "hey"), &cancel)
            .await
            .expect_err("cancelled");

        assert!(err.is_cancelled());
        assert_eq!(fx.service.calls(RateCategory::CreateChat), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn first_send_waits_a_full_spacing() {
        let fx = fixture(1_000.0);
        let start = Instant::now();

        fx.engine.connect_token("tok").await.expect("connect");
        fx.engine.set_polling(false).await.expect("stop timer");
        let connected_after = start.elapsed();
        assert!(connected_after >= Duration::from_millis(1_000), "{connected_after:?}");

        tokio::time::advance(Duration::from_millis(5_000)).await;
        let before_send = Instant::now();
        fx.engine.send_tell("alice", "bob", "hey").await.expect("tell");
        let elapsed = before_send.elapsed();
        assert!(elapsed >= Duration::from_millis(1_000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1_100), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn sending_requires_a_token() {
        let fx = fixture(1_000.0);

        let err = fx
            .engine
            .send_tell("alice", "bob", "hey")
            .await
            .expect_err("no token");

        assert_eq!(err.category, ChatErrorCategory::NotAuthenticated);
        assert_eq!(fx.service.calls(RateCategory::CreateChat), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_sends_are_spaced() {
        let fx = connected().await;
        fx.engine.send_tell("alice", "bob", "one").await.expect("first");
        let start = Instant::now();
        fx.engine.send_tell("alice", "bob", "two").await.expect("second");

        assert!(start.elapsed() >= Duration::from_millis(1_000));
        assert_eq!(fx.service.sent().len(), 2);
    }
}
