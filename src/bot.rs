use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::WATCH_CHANNEL_NAME;
use crate::platform::{ChatPlatform, IncomingMessage, Marker};
use crate::relay::{Outcome, Relay, RelayRequest};

/// Shared, read-only state for every relay task
pub struct AppState {
    pub platform: Arc<dyn ChatPlatform>,
    pub relay: Arc<dyn Relay>,
}

impl AppState {
    pub fn new(platform: Arc<dyn ChatPlatform>, relay: Arc<dyn Relay>) -> Self {
        Self { platform, relay }
    }
}

/// Whether a message should be relayed: human author, at least one attachment,
/// and posted in the watched channel or a DM.
pub fn should_relay(msg: &IncomingMessage) -> bool {
    if msg.author_is_bot {
        return false;
    }
    if msg.attachments.is_empty() {
        return false;
    }
    let in_watched_channel = msg.channel_name.as_deref() == Some(WATCH_CHANNEL_NAME);
    in_watched_channel || msg.is_direct_message()
}

/// Consume queued messages until the queue closes, relaying accepted ones
/// concurrently. Waits for in-flight relays before returning.
pub async fn run(state: Arc<AppState>, mut events: mpsc::Receiver<IncomingMessage>) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            maybe_msg = events.recv() => {
                let Some(msg) = maybe_msg else { break };
                if !should_relay(&msg) {
                    continue;
                }
                let state = state.clone();
                tasks.spawn(async move { handle_message(&state, msg).await });
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                log_join(joined);
            }
        }
    }

    info!("Event queue closed, waiting for {} relay(s) in flight", tasks.len());
    while let Some(joined) = tasks.join_next().await {
        log_join(joined);
    }
}

// A panicking relay only loses its own message.
fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!("Relay task failed: {}", e);
    }
}

/// Relay one accepted message and reflect the verdict back onto it.
pub async fn handle_message(state: &AppState, msg: IncomingMessage) {
    let Some(request) = RelayRequest::from_message(&msg) else {
        return;
    };

    info!("Receipt from {} ({})", msg.user_name, msg.user_id);

    if let Err(e) = state.platform.react(&msg, Marker::Pending).await {
        warn!("{:#}", e);
    }

    let result = state.relay.send(&request).await;
    match &result {
        Ok(response) => info!(
            "Relay for message {} returned success={}",
            msg.message_id, response.success
        ),
        Err(e) => error!("Error relaying message {}: {:#}", msg.message_id, e),
    }

    apply_outcome(state.platform.as_ref(), &msg, Outcome::from_result(&result)).await;
}

/// Clear reactions, add the outcome marker, then reply. Each step runs even
/// if an earlier one failed.
async fn apply_outcome(platform: &dyn ChatPlatform, msg: &IncomingMessage, outcome: Outcome) {
    if let Err(e) = platform.clear_reactions(msg).await {
        warn!("{:#}", e);
    }

    let (marker, reply) = match outcome {
        Outcome::Success { reply } => (Marker::Success, reply),
        Outcome::Failure { reply } => (Marker::Failure, Some(reply)),
    };

    if let Err(e) = platform.react(msg, marker).await {
        warn!("{:#}", e);
    }

    if let Some(text) = reply {
        if let Err(e) = platform.reply(msg, &text).await {
            warn!("{:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Attachment;
    use crate::relay::{RelayResponse, ERROR_REPLY, FAILURE_REPLY};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        React(u64, Marker),
        Clear(u64),
        Reply(u64, String),
        Relay(RelayRequest),
    }

    type Log = Arc<Mutex<Vec<Call>>>;

    #[derive(Default)]
    struct Failing {
        pending: bool,
        clear: bool,
    }

    struct FakePlatform {
        log: Log,
        failing: Failing,
    }

    #[async_trait]
    impl ChatPlatform for FakePlatform {
        async fn react(&self, msg: &IncomingMessage, marker: Marker) -> Result<()> {
            self.log.lock().unwrap().push(Call::React(msg.message_id, marker));
            if self.failing.pending && marker == Marker::Pending {
                anyhow::bail!("unknown emoji");
            }
            Ok(())
        }

        async fn clear_reactions(&self, msg: &IncomingMessage) -> Result<()> {
            self.log.lock().unwrap().push(Call::Clear(msg.message_id));
            if self.failing.clear {
                anyhow::bail!("missing permissions");
            }
            Ok(())
        }

        async fn reply(&self, msg: &IncomingMessage, text: &str) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(Call::Reply(msg.message_id, text.to_string()));
            Ok(())
        }
    }

    enum Answer {
        Respond(RelayResponse),
        Unreachable,
        Panic,
    }

    struct FakeRelay {
        log: Log,
        answer: Answer,
    }

    #[async_trait]
    impl Relay for FakeRelay {
        async fn send(&self, request: &RelayRequest) -> Result<RelayResponse> {
            self.log.lock().unwrap().push(Call::Relay(request.clone()));
            match &self.answer {
                Answer::Respond(resp) => Ok(resp.clone()),
                Answer::Unreachable => Err(anyhow::anyhow!("connection refused")),
                Answer::Panic => panic!("endpoint exploded"),
            }
        }
    }

    fn state_with(answer: Answer, fail_clear: bool) -> (Arc<AppState>, Log) {
        failing_state(
            answer,
            Failing {
                clear: fail_clear,
                ..Failing::default()
            },
        )
    }

    fn failing_state(answer: Answer, failing: Failing) -> (Arc<AppState>, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let platform = Arc::new(FakePlatform {
            log: log.clone(),
            failing,
        });
        let relay = Arc::new(FakeRelay {
            log: log.clone(),
            answer,
        });
        (Arc::new(AppState::new(platform, relay)), log)
    }

    fn respond(success: bool, reply: Option<&str>) -> Answer {
        Answer::Respond(RelayResponse {
            success,
            reply: reply.map(str::to_string),
        })
    }

    fn attachment(name: &str) -> Attachment {
        Attachment {
            url: format!("https://cdn.test/{name}"),
            filename: name.to_string(),
        }
    }

    fn guild_message(channel: &str, attachments: Vec<Attachment>) -> IncomingMessage {
        IncomingMessage {
            message_id: 1,
            channel_id: 2,
            guild_id: Some(3),
            channel_name: Some(channel.to_string()),
            user_id: 4,
            user_name: "alice".to_string(),
            author_is_bot: false,
            text: "coffee".to_string(),
            attachments,
        }
    }

    fn dm(attachments: Vec<Attachment>) -> IncomingMessage {
        IncomingMessage {
            guild_id: None,
            channel_name: None,
            ..guild_message("", attachments)
        }
    }

    fn calls(log: &Log) -> Vec<Call> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn test_filter_rejects_bots() {
        let mut msg = guild_message("receipts", vec![attachment("r.png")]);
        msg.author_is_bot = true;
        assert!(!should_relay(&msg));

        let mut msg = dm(vec![attachment("r.png")]);
        msg.author_is_bot = true;
        assert!(!should_relay(&msg));
    }

    #[test]
    fn test_filter_requires_attachment() {
        assert!(!should_relay(&guild_message("receipts", vec![])));
        assert!(!should_relay(&dm(vec![])));
    }

    #[test]
    fn test_filter_channel_rules() {
        assert!(should_relay(&guild_message("receipts", vec![attachment("r.png")])));
        assert!(should_relay(&dm(vec![attachment("r.png")])));
        assert!(!should_relay(&guild_message("general", vec![attachment("r.png")])));
        assert!(!should_relay(&guild_message("Receipts", vec![attachment("r.png")])));

        let mut unknown = guild_message("receipts", vec![attachment("r.png")]);
        unknown.channel_name = None;
        assert!(!should_relay(&unknown));
    }

    #[tokio::test]
    async fn test_success_with_reply() {
        let (state, log) = state_with(respond(true, Some("thanks")), false);
        handle_message(&state, dm(vec![attachment("r.png")])).await;

        let calls = calls(&log);
        assert_eq!(calls[0], Call::React(1, Marker::Pending));
        assert!(matches!(calls[1], Call::Relay(_)));
        assert_eq!(
            &calls[2..],
            &[
                Call::Clear(1),
                Call::React(1, Marker::Success),
                Call::Reply(1, "thanks".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_success_without_reply() {
        let (state, log) = state_with(respond(true, None), false);
        handle_message(&state, dm(vec![attachment("r.png")])).await;

        let calls = calls(&log);
        assert_eq!(calls.last(), Some(&Call::React(1, Marker::Success)));
        assert!(!calls.iter().any(|c| matches!(c, Call::Reply(..))));
    }

    #[tokio::test]
    async fn test_failure_with_endpoint_reply() {
        let (state, log) = state_with(respond(false, Some("bad format")), false);
        handle_message(&state, dm(vec![attachment("r.png")])).await;

        assert_eq!(
            &calls(&log)[2..],
            &[
                Call::Clear(1),
                Call::React(1, Marker::Failure),
                Call::Reply(1, "bad format".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_without_reply_uses_generic_text() {
        let (state, log) = state_with(respond(false, None), false);
        handle_message(&state, dm(vec![attachment("r.png")])).await;

        assert_eq!(
            calls(&log).last(),
            Some(&Call::Reply(1, FAILURE_REPLY.to_string()))
        );
    }

    #[tokio::test]
    async fn test_empty_endpoint_reply_uses_generic_text() {
        let (state, log) = state_with(respond(false, Some("")), false);
        handle_message(&state, dm(vec![attachment("r.png")])).await;

        assert_eq!(
            calls(&log).last(),
            Some(&Call::Reply(1, FAILURE_REPLY.to_string()))
        );
    }

    #[tokio::test]
    async fn test_transport_error_uses_error_text() {
        let (state, log) = state_with(Answer::Unreachable, false);
        handle_message(&state, dm(vec![attachment("r.png")])).await;

        assert_eq!(
            &calls(&log)[2..],
            &[
                Call::Clear(1),
                Call::React(1, Marker::Failure),
                Call::Reply(1, ERROR_REPLY.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_platform_failure_does_not_stop_later_steps() {
        let (state, log) = state_with(respond(true, Some("thanks")), true);
        handle_message(&state, dm(vec![attachment("r.png")])).await;

        assert_eq!(
            calls(&log).last(),
            Some(&Call::Reply(1, "thanks".to_string()))
        );
    }

    #[tokio::test]
    async fn test_pending_reaction_failure_still_relays() {
        let (state, log) = failing_state(
            respond(false, Some("bad format")),
            Failing {
                pending: true,
                ..Failing::default()
            },
        );
        handle_message(&state, dm(vec![attachment("r.png")])).await;

        let calls = calls(&log);
        assert!(matches!(calls[1], Call::Relay(_)));
        assert_eq!(
            &calls[2..],
            &[
                Call::Clear(1),
                Call::React(1, Marker::Failure),
                Call::Reply(1, "bad format".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_only_first_attachment_relayed() {
        let (state, log) = state_with(respond(true, None), false);
        handle_message(
            &state,
            guild_message("receipts", vec![attachment("a.png"), attachment("b.png")]),
        )
        .await;

        let relayed: Vec<RelayRequest> = calls(&log)
            .into_iter()
            .filter_map(|c| match c {
                Call::Relay(req) => Some(req),
                _ => None,
            })
            .collect();
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].attachment_name, "a.png");
        assert_eq!(relayed[0].guild_id.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_run_filters_injected_events() {
        let (state, log) = state_with(respond(true, None), false);
        let (tx, rx) = mpsc::channel(8);

        let mut bot = dm(vec![attachment("r.png")]);
        bot.author_is_bot = true;
        tx.send(bot).await.unwrap();
        tx.send(guild_message("general", vec![attachment("r.png")]))
            .await
            .unwrap();
        tx.send(guild_message("receipts", vec![])).await.unwrap();
        let mut accepted = guild_message("receipts", vec![attachment("r.png")]);
        accepted.message_id = 42;
        tx.send(accepted).await.unwrap();
        drop(tx);

        run(state, rx).await;

        let calls = calls(&log);
        assert_eq!(calls.len(), 4);
        assert!(calls.iter().all(|c| match c {
            Call::React(id, _) | Call::Clear(id) | Call::Reply(id, _) => *id == 42,
            Call::Relay(req) => req.message_id == "42",
        }));
    }

    #[tokio::test]
    async fn test_run_survives_panicking_relay() {
        let (state, log) = state_with(Answer::Panic, false);
        let (tx, rx) = mpsc::channel(8);

        tx.send(dm(vec![attachment("a.png")])).await.unwrap();
        tx.send(dm(vec![attachment("b.png")])).await.unwrap();
        drop(tx);

        run(state, rx).await;

        let relays = calls(&log)
            .iter()
            .filter(|c| matches!(c, Call::Relay(_)))
            .count();
        assert_eq!(relays, 2);
    }
}
