//! Negotiation state machine.
//!
//! ```text
//! new ──(no bot)──────────────► bot-req ──(bot named)──► bot-ack ──► data-req
//!  │                               └──(nobody named)──► bot-req (stalled)
//!  └──(bot known)──────────────────────────────────────────────────► data-req
//! data-req ──(reply)──► data-ack ──(rpc + DONE)──► complete
//! GETINFO / GETINVOICE: new ──(answer)──► complete
//! ```
//!
//! Every posting transition threads its single outbound message under the command's
//! `last_message_id` and commits the posted id as the new `last_message_id` only after
//! the transport acknowledged the post.

use crate::context::AppContext;
use crate::error::{NegotiationError, Result};
use crate::model::{Command, CommandKind, CommandStatus, CommandView, Peer, StepGuard};
use lnf_feed::{FeedMessage, MessageId, User};
use lnf_parse::{
    extract_node_info, extract_payment, extract_payment_request, extract_pubkey, extract_uri,
};
use std::sync::Arc;

const BOT_INTRODUCTION_REQUEST: &str = "Please introduce me to your bot.";
const DONE_SUFFIX: &str = "\nDONE.";

/// What a single negotiation step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Posted one message and committed `status` with it as `last_message_id`.
    Posted {
        status: CommandStatus,
        message_id: MessageId,
    },
    /// The reply could not move the command forward; it keeps waiting.
    Stalled { status: CommandStatus },
    /// Nothing to do: the command already moved on or is not waiting for a reply.
    Skipped { status: CommandStatus },
}

/// Outbound message for the next step, plus the status it commits.
struct Planned {
    body: String,
    next: CommandStatus,
}

pub struct Negotiator {
    ctx: Arc<AppContext>,
}

impl Negotiator {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    /// First step of a recorded command still in `new`. `trigger` is its root message.
    #[tracing::instrument(level = "info", skip_all, fields(command = %recorded.command.message_id, kind = %recorded.command.kind))]
    pub async fn start(&self, recorded: CommandView, trigger: &FeedMessage) -> Result<Step> {
        let _turn = self.ctx.tracker.lock(&recorded.command.message_id).await;
        let Some(view) = self.ctx.store.get_full(&recorded.command.message_id).await? else {
            return Ok(Step::Skipped {
                status: recorded.command.status,
            });
        };
        if view.command.status != CommandStatus::New {
            return Ok(Step::Skipped {
                status: view.command.status,
            });
        }

        let planned = match view.command.kind {
            CommandKind::GetInfo | CommandKind::GetInvoice => {
                self.answer_bot(&view.command, trigger).await?
            }
            CommandKind::Connect | CommandKind::Pay | CommandKind::FundChannel => {
                if view.command.bot_id.is_none() {
                    plan_bot_request(&view)?
                } else {
                    self.plan_data_request(&view, &trigger.text).await?
                }
            }
        };
        let guard = view.command.guard();
        self.post_and_commit(&view.command, &guard, planned).await
    }

    /// Continue a command with a reply from an authorized counterpart.
    #[tracing::instrument(level = "info", skip_all, fields(command = %command.message_id, reply = %reply.id))]
    pub async fn resume(&self, command: &Command, reply: &FeedMessage) -> Result<Step> {
        let _turn = self.ctx.tracker.lock(&command.message_id).await;
        let Some(view) = self.ctx.store.get_full(&command.message_id).await? else {
            return Ok(Step::Skipped {
                status: command.status,
            });
        };
        let current = &view.command;
        if reply.in_reply_to.as_ref() != Some(&current.last_message_id) {
            tracing::info!(status = %current.status, "reply target already answered; skipping");
            return Ok(Step::Skipped {
                status: current.status,
            });
        }

        let status = current.status;
        match status {
            CommandStatus::BotReq => self.resume_bot_introduction(view, reply).await,
            CommandStatus::DataReq => self.resume_data_reply(view, reply).await,
            CommandStatus::New
            | CommandStatus::BotAck
            | CommandStatus::DataAck
            | CommandStatus::Complete
            | CommandStatus::Failed => Ok(Step::Skipped { status }),
        }
    }

    async fn resume_bot_introduction(&self, view: CommandView, reply: &FeedMessage) -> Result<Step> {
        let command = &view.command;
        let excluded = [&self.ctx.identities.me.id, &reply.author.id];
        let Some(bot) = reply.mentions_except(&excluded).last().cloned() else {
            tracing::error!(
                command = %command.message_id,
                replier = %reply.author.screen_name,
                "bot introduction named no bot; still waiting"
            );
            return Ok(Step::Stalled {
                status: command.status,
            });
        };
        let peer_uid = command
            .peer_id
            .clone()
            .ok_or_else(|| NegotiationError::MissingCounterpart {
                command: command.message_id.clone(),
                missing: "peer",
            })?;

        self.ctx
            .store
            .link_bot(&peer_uid, &bot.id, &bot.screen_name)
            .await?;
        let Some(acked) = self
            .ctx
            .tracker
            .commit_bot(command, &command.guard(), &reply.id, &bot.id, CommandStatus::BotAck)
            .await?
        else {
            return Ok(Step::Skipped {
                status: command.status,
            });
        };
        tracing::info!(peer = %peer_uid, bot = %bot.screen_name, "linked counterpart bot");

        let view = self
            .ctx
            .store
            .get_full(&acked.message_id)
            .await?
            .ok_or_else(|| NegotiationError::MissingCounterpart {
                command: acked.message_id.clone(),
                missing: "record",
            })?;
        // PAY terms always come from the owner's root message, never from the
        // introduction reply.
        let source = match acked.kind {
            CommandKind::Pay => self.root_text(&acked.message_id).await?,
            _ => reply.text.clone(),
        };
        let planned = self.plan_data_request(&view, &source).await?;
        self.post_and_commit(&acked, &acked.guard(), planned).await
    }

    async fn resume_data_reply(&self, view: CommandView, reply: &FeedMessage) -> Result<Step> {
        let command = &view.command;
        // Extract before acknowledging, so a malformed reply leaves the command
        // waiting for a better one.
        let requested = RequestedValue::extract(command, &reply.text)?;

        let Some(acked) = self
            .ctx
            .tracker
            .commit(command, &command.guard(), &reply.id, CommandStatus::DataAck)
            .await?
        else {
            return Ok(Step::Skipped {
                status: command.status,
            });
        };

        let result = match requested {
            RequestedValue::Node(node) => {
                let result = self.ctx.rpc.connect(&node).await?;
                match &acked.peer_id {
                    Some(peer_uid) => {
                        self.ctx.store.set_node(peer_uid, &node).await?;
                    }
                    None => tracing::warn!(node = %node, "connected node has no peer to record it on"),
                }
                result
            }
            RequestedValue::PaymentRequest(bolt11) => {
                // TODO: compare decoded.amount_msat with the amount the owner asked for
                // before paying.
                let decoded = self.ctx.rpc.decode_pay(&bolt11).await?;
                tracing::info!(
                    amount_msat = ?decoded.amount_msat,
                    description = ?decoded.description,
                    payee = ?decoded.payee,
                    "paying counterpart invoice"
                );
                self.ctx.rpc.pay(&bolt11).await?
            }
            RequestedValue::Pubkey(pubkey) => self.ctx.rpc.fund_channel(&pubkey).await?,
        };

        let planned = Planned {
            body: format!("{result}{DONE_SUFFIX}"),
            next: CommandStatus::Complete,
        };
        self.post_and_commit(&acked, &acked.guard(), planned).await
    }

    /// Single-step answer to a bot's GETINFO / GETINVOICE.
    async fn answer_bot(&self, command: &Command, trigger: &FeedMessage) -> Result<Planned> {
        let body = match command.kind {
            CommandKind::GetInfo => self.ctx.rpc.get_uri().await?,
            CommandKind::GetInvoice => {
                let terms = extract_payment(&trigger.text)?;
                let label = invoice_label(&trigger.author, &command.message_id);
                self.ctx
                    .rpc
                    .get_invoice(terms.amount_sat, &label, &terms.description)
                    .await?
            }
            CommandKind::Connect | CommandKind::Pay | CommandKind::FundChannel => {
                return Err(NegotiationError::InvalidTransition {
                    kind: command.kind,
                    status: command.status,
                });
            }
        };
        Ok(Planned {
            body,
            next: CommandStatus::Complete,
        })
    }

    /// The request sent to the counterpart's bot for the value this command needs.
    /// FUNDCHANNEL against a peer whose node is already known completes immediately.
    async fn plan_data_request(&self, view: &CommandView, payment_source: &str) -> Result<Planned> {
        let command = &view.command;
        let bot = view
            .peer
            .as_ref()
            .and_then(Peer::bot_handle)
            .ok_or_else(|| NegotiationError::MissingCounterpart {
                command: command.message_id.clone(),
                missing: "bot screen name",
            })?;

        match command.kind {
            CommandKind::Connect => Ok(Planned {
                body: format!("{bot} {}", CommandKind::GetInfo.keyword()),
                next: CommandStatus::DataReq,
            }),
            CommandKind::Pay => {
                let terms = extract_payment(payment_source)?;
                Ok(Planned {
                    body: format!(
                        "{bot} {} {} {}",
                        CommandKind::GetInvoice.keyword(),
                        terms.amount_sat,
                        terms.description
                    ),
                    next: CommandStatus::DataReq,
                })
            }
            CommandKind::FundChannel => {
                match view.peer.as_ref().and_then(|p| p.node.as_ref()) {
                    Some(node) => Ok(Planned {
                        body: self.ctx.rpc.fund_channel(&node.pubkey).await?,
                        next: CommandStatus::Complete,
                    }),
                    None => Ok(Planned {
                        body: format!("{bot} {}", CommandKind::GetInfo.keyword()),
                        next: CommandStatus::DataReq,
                    }),
                }
            }
            CommandKind::GetInfo | CommandKind::GetInvoice => {
                Err(NegotiationError::InvalidTransition {
                    kind: command.kind,
                    status: command.status,
                })
            }
        }
    }

    async fn root_text(&self, root: &MessageId) -> Result<String> {
        self.ctx
            .feed
            .lookup_message(root)
            .await
            .map_err(NegotiationError::Transport)?
            .map(|m| m.text)
            .ok_or_else(|| NegotiationError::RootMessageMissing(root.clone()))
    }

    async fn post_and_commit(
        &self,
        command: &Command,
        guard: &StepGuard,
        planned: Planned,
    ) -> Result<Step> {
        let posted = self
            .ctx
            .feed
            .post(&planned.body, Some(&command.last_message_id))
            .await
            .map_err(NegotiationError::Transport)?;

        match self
            .ctx
            .tracker
            .commit(command, guard, &posted, planned.next)
            .await?
        {
            Some(updated) => {
                tracing::info!(
                    from = %guard.status,
                    to = %updated.status,
                    last_message_id = %updated.last_message_id,
                    "negotiation advanced"
                );
                Ok(Step::Posted {
                    status: updated.status,
                    message_id: posted,
                })
            }
            None => {
                tracing::warn!(
                    posted = %posted,
                    expected = %guard.status,
                    "command moved while posting; reply left uncorrelated"
                );
                Ok(Step::Skipped {
                    status: guard.status,
                })
            }
        }
    }
}

fn plan_bot_request(view: &CommandView) -> Result<Planned> {
    let peer = view
        .peer
        .as_ref()
        .ok_or_else(|| NegotiationError::MissingCounterpart {
            command: view.command.message_id.clone(),
            missing: "peer",
        })?;
    Ok(Planned {
        body: format!("{} {BOT_INTRODUCTION_REQUEST}", peer.handle()),
        next: CommandStatus::BotReq,
    })
}

/// Invoice labels must be unique per node; the request id makes them so.
fn invoice_label(requester: &User, request: &MessageId) -> String {
    format!("{}-{request}", requester.screen_name)
}

/// The value a data-req reply must carry for each human-issued kind.
enum RequestedValue {
    Node(lnf_rpc::NodeAddress),
    PaymentRequest(String),
    Pubkey(String),
}

impl RequestedValue {
    fn extract(command: &Command, text: &str) -> Result<Self> {
        match command.kind {
            CommandKind::Connect => {
                let uri = extract_node_info(&extract_uri(text)?)?;
                Ok(Self::Node(lnf_rpc::NodeAddress::new(uri.pubkey, uri.host, uri.port)))
            }
            CommandKind::Pay => Ok(Self::PaymentRequest(extract_payment_request(text)?)),
            CommandKind::FundChannel => Ok(Self::Pubkey(extract_pubkey(text)?)),
            CommandKind::GetInfo | CommandKind::GetInvoice => {
                Err(NegotiationError::InvalidTransition {
                    kind: command.kind,
                    status: command.status,
                })
            }
        }
    }
}
