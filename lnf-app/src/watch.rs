//! Watch loop: the feed stream in, one negotiation step per inbound message out.

use crate::classifier::classify;
use crate::context::AppContext;
use crate::error::{NegotiationError, Result};
use crate::model::CommandStatus;
use crate::negotiation::{Negotiator, Step};
use crate::resolver::record_new_command;
use anyhow::Context;
use chrono::{DateTime, Utc};
use lnf_feed::FeedMessage;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub track: String,
    /// Unfinished commands untouched for this long are failed by the sweep.
    pub stale_after: chrono::Duration,
    pub sweep_interval: Duration,
    pub max_concurrent_handlers: usize,
    pub queue_capacity: usize,
}

/// What the watch loop did with one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// A reply to an outstanding message continued its negotiation.
    Resumed(Step),
    /// A new command was recorded and its first step taken.
    Started(Step),
    /// A reply to an outstanding message came from someone other than the
    /// counterpart; the negotiation is untouched.
    Rejected,
    Ignored,
}

pub struct WatchLoop {
    ctx: Arc<AppContext>,
    negotiator: Negotiator,
    settings: WatchSettings,
}

impl WatchLoop {
    pub fn new(ctx: Arc<AppContext>, settings: WatchSettings) -> Self {
        Self {
            negotiator: Negotiator::new(Arc::clone(&ctx)),
            ctx,
            settings,
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(message = %message.id, author = %message.author.screen_name))]
    pub async fn handle_message(&self, message: &FeedMessage) -> Result<Dispatch> {
        let ids = &self.ctx.identities;
        if message.author.id == ids.me.id {
            return Ok(Dispatch::Ignored);
        }

        if let Some(target) = &message.in_reply_to {
            if let Some(command) = self.ctx.tracker.find_by_reply_target(target).await? {
                if !command.is_expected_replier(&message.author.id) {
                    let rejected = NegotiationError::UnauthorizedReplier {
                        command: command.message_id.clone(),
                        replier: message.author.id.clone(),
                    };
                    tracing::warn!(error = %rejected, status = %command.status, "reply rejected");
                    return Ok(Dispatch::Rejected);
                }
                let step = self.negotiator.resume(&command, message).await?;
                return Ok(Dispatch::Resumed(step));
            }
        }

        let Some(classified) = classify(ids, message) else {
            return Ok(Dispatch::Ignored);
        };
        let recorded = record_new_command(
            &self.ctx.store,
            classified.kind,
            &message.id,
            &message.author,
            classified.peer.as_ref(),
            classified.bot.as_ref(),
        )
        .await?;
        let view = match recorded {
            Some(view) => view,
            None => match self.ctx.store.get_full(&message.id).await? {
                Some(view) if view.command.status == CommandStatus::New => {
                    tracing::info!("command recorded but never started; retrying first step");
                    view
                }
                _ => {
                    tracing::debug!("command already recorded; ignoring re-delivery");
                    return Ok(Dispatch::Ignored);
                }
            },
        };
        let step = self.negotiator.start(view, message).await?;
        Ok(Dispatch::Started(step))
    }

    /// Fail every unfinished command last touched before `now - stale_after`.
    pub async fn sweep_stale_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let failed = self
            .ctx
            .store
            .fail_stale(now - self.settings.stale_after)
            .await?;
        for command in &failed {
            self.ctx.tracker.forget(command);
            tracing::warn!(
                command = %command.message_id,
                kind = %command.kind,
                last_message_id = %command.last_message_id,
                "negotiation timed out"
            );
        }
        Ok(failed.len())
    }

    #[tracing::instrument(level = "info", skip_all, fields(feed = %self.ctx.feed.feed_id(), track = %self.settings.track))]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::channel(self.settings.queue_capacity.max(1));

        let feed = Arc::clone(&self.ctx.feed);
        let track = self.settings.track.clone();
        let stream_shutdown = shutdown.clone();
        let stream = tokio::spawn(async move {
            tokio::select! {
                _ = stream_shutdown.cancelled() => Ok(()),
                res = feed.start(&track, tx) => res,
            }
        });

        let sweeper = tokio::spawn(Arc::clone(&self).sweep_loop(shutdown.clone()));

        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_handlers.max(1)));
        let mut handlers = JoinSet::new();
        tracing::info!("watching feed");

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = rx.recv() => msg,
            };
            let Some(message) = message else {
                tracing::warn!("feed stream closed");
                break;
            };

            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .context("handler semaphore closed")?;
            let this = Arc::clone(&self);
            handlers.spawn(async move {
                let _permit = permit;
                this.dispatch(message).await;
            });

            while let Some(joined) = handlers.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(%e, "message handler panicked");
                }
            }
        }

        shutdown.cancel();
        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(%e, "message handler panicked");
            }
        }
        if let Err(e) = sweeper.await {
            tracing::warn!(%e, "stale sweep task join failed");
        }
        match stream.await {
            Ok(res) => res.context("feed stream failed")?,
            Err(e) => tracing::warn!(%e, "feed stream task join failed"),
        }
        tracing::info!("watch loop stopped");
        Ok(())
    }

    async fn dispatch(&self, message: FeedMessage) {
        match self.handle_message(&message).await {
            Ok(Dispatch::Ignored) => {}
            Ok(dispatch) => tracing::debug!(message = %message.id, ?dispatch, "message handled"),
            Err(e) => tracing::error!(message = %message.id, error = %e, "negotiation step failed"),
        }
    }

    async fn sweep_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_stale_at(Utc::now()).await {
                        tracing::warn!(error = %e, "stale sweep failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, MessageBuilder, harness, message, user};

    fn settings() -> WatchSettings {
        WatchSettings {
            track: "lnfeedbot".to_string(),
            stale_after: chrono::Duration::minutes(30),
            sweep_interval: Duration::from_secs(3600),
            max_concurrent_handlers: 4,
            queue_capacity: 16,
        }
    }

    fn watch(h: &Harness) -> Arc<WatchLoop> {
        Arc::new(WatchLoop::new(Arc::clone(&h.ctx), settings()))
    }

    #[tokio::test]
    async fn own_posts_and_chatter_are_ignored() {
        let h = harness().await;
        let w = watch(&h);
        let own = message("1", &h.ids.me, "CONNECT @peer1").mentioning(&[&user("20", "peer1")]);
        assert_eq!(w.handle_message(&own).await.expect("own"), Dispatch::Ignored);
        let chatter = message("2", &user("50", "someone"), "gm @lnfeedbot");
        assert_eq!(w.handle_message(&chatter).await.expect("chatter"), Dispatch::Ignored);
        assert!(h.feed.posts().is_empty());
    }

    #[tokio::test]
    async fn owner_command_starts_and_redelivery_is_ignored() {
        let h = harness().await;
        let w = watch(&h);
        let root = message("100", &h.ids.owner, "CONNECT @peer1").mentioning(&[&user("20", "peer1")]);
        let dispatch = w.handle_message(&root).await.expect("start");
        assert!(matches!(
            dispatch,
            Dispatch::Started(Step::Posted { status: CommandStatus::BotReq, .. })
        ));
        assert_eq!(w.handle_message(&root).await.expect("again"), Dispatch::Ignored);
        assert_eq!(h.feed.posts().len(), 1);
    }

    #[tokio::test]
    async fn redelivered_root_retries_a_first_post_that_failed() {
        let h = harness().await;
        let w = watch(&h);
        let root = message("100", &h.ids.owner, "CONNECT @peer1").mentioning(&[&user("20", "peer1")]);

        h.feed.fail_posts(true);
        let err = w.handle_message(&root).await.expect_err("post fails");
        assert!(matches!(err, NegotiationError::Transport(_)));
        assert_eq!(h.command("100").await.status, CommandStatus::New);

        h.feed.fail_posts(false);
        let dispatch = w.handle_message(&root).await.expect("retry");
        assert!(matches!(
            dispatch,
            Dispatch::Started(Step::Posted { status: CommandStatus::BotReq, .. })
        ));
        assert_eq!(h.feed.posts().len(), 1);
        assert_eq!(h.command("100").await.status, CommandStatus::BotReq);
        assert_eq!(w.handle_message(&root).await.expect("again"), Dispatch::Ignored);
    }

    #[tokio::test]
    async fn owner_command_without_counterpart_is_an_error() {
        let h = harness().await;
        let w = watch(&h);
        let root = message("100", &h.ids.owner, "CONNECT please");
        let err = w.handle_message(&root).await.expect_err("no peer");
        assert!(matches!(err, NegotiationError::MissingCounterpart { .. }));
        assert!(h.feed.posts().is_empty());
    }

    #[tokio::test]
    async fn replies_from_strangers_are_rejected_without_state_change() {
        let h = harness().await;
        let w = watch(&h);
        let peer = user("20", "peer1");
        let root = message("100", &h.ids.owner, "CONNECT @peer1").mentioning(&[&peer]);
        w.handle_message(&root).await.expect("start");
        let before = h.command("100").await;

        let stranger = user("66", "mallory");
        let hijack = message("110", &stranger, "@mallorybot")
            .mentioning(&[&user("67", "mallorybot")])
            .replying_to(&before.last_message_id);
        assert_eq!(w.handle_message(&hijack).await.expect("reject"), Dispatch::Rejected);
        assert_eq!(h.command("100").await, before);
        assert_eq!(h.feed.posts().len(), 1);
    }

    #[tokio::test]
    async fn counterpart_reply_resumes() {
        let h = harness().await;
        let w = watch(&h);
        let peer = user("20", "peer1");
        let root = message("100", &h.ids.owner, "CONNECT @peer1").mentioning(&[&peer]);
        w.handle_message(&root).await.expect("start");
        let waiting = h.command("100").await;

        let intro = message("110", &peer, "@peerbot1")
            .mentioning(&[&user("30", "peerbot1")])
            .replying_to(&waiting.last_message_id);
        let dispatch = w.handle_message(&intro).await.expect("resume");
        assert!(matches!(
            dispatch,
            Dispatch::Resumed(Step::Posted { status: CommandStatus::DataReq, .. })
        ));
    }

    #[tokio::test]
    async fn sweep_fails_stale_negotiations() {
        let h = harness().await;
        let w = watch(&h);
        let peer = user("20", "peer1");
        let root = message("100", &h.ids.owner, "CONNECT @peer1").mentioning(&[&peer]);
        w.handle_message(&root).await.expect("start");
        let waiting = h.command("100").await;

        assert_eq!(w.sweep_stale_at(Utc::now()).await.expect("sweep"), 0);
        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(w.sweep_stale_at(later).await.expect("sweep"), 1);
        assert_eq!(h.command("100").await.status, CommandStatus::Failed);
        assert_eq!(h.ctx.tracker.indexed(&waiting.last_message_id), None);

        let late = message("110", &peer, "@peerbot1")
            .mentioning(&[&user("30", "peerbot1")])
            .replying_to(&waiting.last_message_id);
        assert_eq!(w.handle_message(&late).await.expect("late"), Dispatch::Ignored);
    }

    #[tokio::test]
    async fn sweep_fails_commands_whose_first_post_never_went_out() {
        let h = harness().await;
        let w = watch(&h);
        let root = message("100", &h.ids.owner, "CONNECT @peer1").mentioning(&[&user("20", "peer1")]);
        h.feed.fail_posts(true);
        w.handle_message(&root).await.expect_err("post fails");

        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(w.sweep_stale_at(later).await.expect("sweep"), 1);
        assert_eq!(h.command("100").await.status, CommandStatus::Failed);

        h.feed.fail_posts(false);
        assert_eq!(w.handle_message(&root).await.expect("late"), Dispatch::Ignored);
        assert!(h.feed.posts().is_empty());
    }

    #[tokio::test]
    async fn run_streams_until_shutdown() {
        let h = harness().await;
        let root = message("100", &h.ids.owner, "CONNECT @peer1").mentioning(&[&user("20", "peer1")]);
        h.feed.queue_inbound(root);

        let shutdown = CancellationToken::new();
        let running = tokio::spawn(watch(&h).run(shutdown.clone()));
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.feed.posts().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("bot request posted");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("stops")
            .expect("join")
            .expect("clean exit");
        assert_eq!(h.command("100").await.status, CommandStatus::BotReq);
    }
}
