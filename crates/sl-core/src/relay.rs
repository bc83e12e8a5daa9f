//! # Relay
//!
//! Entry point of the core. Routes gateway events through the block policy,
//! the thread registry and the threads themselves, and runs the closure
//! worker that executes fired closures.
//!
//! # Developer Note
//! [`Relay::start`] must finish before traffic is accepted: it probes the
//! store, rebuilds the registry and runs every overdue closure inline, so no
//! new thread can be opened for a recipient whose stale closure is still due.
//! Event handlers wait on the readiness signal.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::block::{BlockPolicy, Decision};
use crate::config::{keys, ConfigCache};
use crate::context::RelayContext;
use crate::duration::humanize;
use crate::error::{RelayError, Result};
use crate::models::{
    BlockEntry, ChannelId, ChannelInfo, ChannelKind, ChatMessage, CloseRequest, Closer,
    GatewayEvent, LinkOrigin, MessageId, OutgoingMessage, PendingClosure, ReactionEvent, ThreadLog, UserId,
    UserRef,
};
use crate::reactions::{self, ReactionAction};
use crate::registry::ThreadRegistry;
use crate::scheduler::{ClosureScheduler, FireJob};
use crate::thread::SendOutcome;
use crate::traits::{ChatTransport, ConfigSource, RelayStore};

pub const UNDELIVERABLE_NOTICE: &str =
    "Message could not be delivered. The recipient may have closed their DMs or left the server.";

/// What happened to a recipient's message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    Relayed {
        recipient_id: UserId,
        relay_channel: ChannelId,
        relay_message: MessageId,
    },
    /// Redelivery of a message that was already relayed.
    Duplicate,
    Blocked(Decision),
}

pub struct Relay {
    cx: RelayContext,
    policy: BlockPolicy,
    jobs: Mutex<Option<mpsc::UnboundedReceiver<FireJob>>>,
    ready: watch::Sender<bool>,
}

impl Relay {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        store: Arc<dyn RelayStore>,
        config_source: Arc<dyn ConfigSource>,
    ) -> Arc<Self> {
        let config = Arc::new(ConfigCache::new(config_source));
        let registry = ThreadRegistry::new(transport.clone(), store.clone(), config.clone());
        let (scheduler, jobs) = ClosureScheduler::new(store.clone());
        let policy = BlockPolicy::new(store.clone(), config.clone());
        let (ready, _) = watch::channel(false);

        Arc::new(Self {
            cx: RelayContext {
                transport,
                store,
                config,
                registry,
                scheduler,
            },
            policy,
            jobs: Mutex::new(Some(jobs)),
            ready,
        })
    }

    pub fn context(&self) -> &RelayContext {
        &self.cx
    }

    pub fn config(&self) -> &ConfigCache {
        &self.cx.config
    }

    pub fn policy(&self) -> &BlockPolicy {
        &self.policy
    }

    /// Runs startup recovery and spawns the closure worker.
    ///
    /// An unreachable store is fatal. Everything else degrades with a warning.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        // 1. Store probe.
        self.cx
            .store
            .ping()
            .await
            .map_err(|e| RelayError::StoreUnavailable(e.to_string()))?;

        let mut jobs = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| RelayError::Validation("relay already started".into()))?;

        // 2. Config and thread indices.
        let settings = self.cx.config.populate().await?;
        let threads = self.cx.registry.populate_cache().await?;

        // 3. Pending closures; overdue ones run before we report ready.
        let report = self
            .cx
            .scheduler
            .recover_on_startup(&self.cx.registry, Utc::now())
            .await?;
        while let Ok(job) = jobs.try_recv() {
            self.fire(job).await;
        }

        self.ready.send_replace(true);
        info!(
            settings,
            threads,
            rearmed = report.rearmed,
            overdue = report.overdue,
            "relay ready"
        );

        let relay = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                relay.fire(job).await;
            }
        }))
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(RelayError::NotReady)
        }
    }

    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Executes a fired closure. Failures are logged and the record dropped.
    async fn fire(&self, job: FireJob) {
        let Some(closure) = self.cx.scheduler.claim(&job) else {
            debug!(recipient = %job.recipient_id, "stale closure job skipped");
            return;
        };
        let recipient_id = closure.recipient_id;
        let result = match self.cx.registry.find_by_recipient(recipient_id) {
            Some(thread) => thread.close_now(&self.cx, &closure).await,
            None => Err(RelayError::NotFound("Thread".into(), recipient_id.to_string())),
        };
        if let Err(e) = result {
            warn!(recipient = %recipient_id, error = %e, "scheduled closure failed");
        }
        // A closure scheduled in the meantime keeps its record.
        if !self.cx.scheduler.is_armed(recipient_id) {
            if let Err(e) = self.cx.scheduler.forget(recipient_id).await {
                warn!(recipient = %recipient_id, error = %e, "could not remove closure record");
            }
        }
    }

    pub async fn handle_event(&self, event: GatewayEvent) -> Result<()> {
        self.wait_ready().await;
        match event {
            GatewayEvent::MessageReceived { message } => {
                if self.is_own(&message) {
                    return Ok(());
                }
                if message.private {
                    self.process_inbound(&message).await.map(|_| ())
                } else {
                    self.process_outbound(&message).await
                }
            }
            GatewayEvent::ReplyCommand { message } => self.reply(&message).await.map(|_| ()),
            GatewayEvent::MessageEdited { message } => self.mirror_edit(&message).await,
            GatewayEvent::MessageDeleted {
                channel_id,
                message_id,
            } => self.mirror_delete(channel_id, message_id).await,
            GatewayEvent::ReactionAdded(event) => self.handle_reaction(&event).await,
            GatewayEvent::ChannelDeleted {
                channel,
                deleted_by,
            } => self.handle_channel_deleted(&channel, deleted_by).await,
            GatewayEvent::MemberJoined { user_id } => {
                self.member_notice(user_id, "The recipient has joined the server.").await
            }
            GatewayEvent::MemberRemoved { user_id } => {
                self.member_notice(user_id, "The recipient has left the server.").await
            }
            GatewayEvent::Typing {
                channel_id,
                user_id,
                private,
            } => self.relay_typing(channel_id, user_id, private).await,
        }
    }

    fn is_own(&self, message: &ChatMessage) -> bool {
        message.author.bot || message.author.id == self.cx.transport.bot_id()
    }

    // Inbound

    /// Evaluates and relays a private message from a recipient.
    pub async fn process_inbound(&self, message: &ChatMessage) -> Result<InboundOutcome> {
        let decision = self.policy.evaluate(&message.author, Utc::now()).await?;
        if let Decision::Reject {
            remaining, notify, ..
        } = &decision
        {
            if let (true, Some(remaining)) = (*notify, remaining) {
                let notice = OutgoingMessage::titled(
                    "Message not sent!",
                    format!(
                        "You must wait for {} before you can contact staff.",
                        humanize(*remaining)
                    ),
                );
                if let Err(e) = self.cx.transport.send(message.channel_id, notice).await {
                    warn!(recipient = %message.author.id, error = %e, "could not send wait notice");
                }
            }
            self.react(message, keys::BLOCKED_EMOJI).await;
            debug!(recipient = %message.author.id, ?decision, "inbound message blocked");
            return Ok(InboundOutcome::Blocked(decision));
        }

        // A thread closed between lookup and send gets one retry on a fresh thread.
        let outcome = match self.relay_inbound(message).await {
            Err(RelayError::ThreadClosed(_)) => self.relay_inbound(message).await,
            other => other,
        }?;
        if matches!(outcome, InboundOutcome::Relayed { .. }) {
            self.react(message, keys::SENT_EMOJI).await;
        }
        Ok(outcome)
    }

    async fn relay_inbound(&self, message: &ChatMessage) -> Result<InboundOutcome> {
        let thread = self
            .cx
            .registry
            .find_or_create(&message.author, Some(message.channel_id))
            .await?;
        Ok(match thread.send(&self.cx, message).await? {
            SendOutcome::Relayed(relay_message) => InboundOutcome::Relayed {
                recipient_id: thread.recipient_id(),
                relay_channel: thread.relay_channel_id(),
                relay_message,
            },
            SendOutcome::Duplicate => InboundOutcome::Duplicate,
        })
    }

    async fn react(&self, message: &ChatMessage, key: &str) {
        match self.cx.config.emoji(key).await {
            Ok(Some(emoji)) => {
                if let Err(e) = self
                    .cx
                    .transport
                    .add_reaction(message.channel_id, message.id, &emoji)
                    .await
                {
                    debug!(message = %message.id, error = %e, "could not add status reaction");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(key, error = %e, "could not read reaction setting"),
        }
    }

    // Outbound

    /// Operator chatter in a relay channel: a reply when
    /// `reply_without_command` is set, otherwise an internal note.
    pub async fn process_outbound(&self, message: &ChatMessage) -> Result<()> {
        let Some(thread) = self.cx.registry.find_by_channel(message.channel_id) else {
            return Ok(());
        };
        if self.cx.config.flag(keys::REPLY_WITHOUT_COMMAND).await? {
            self.reply(message).await.map(|_| ())
        } else {
            thread.note(&self.cx, message).await
        }
    }

    /// Delivers an operator message to the thread owning its channel.
    pub async fn reply(&self, message: &ChatMessage) -> Result<MessageId> {
        let thread = self
            .cx
            .registry
            .find_by_channel(message.channel_id)
            .ok_or_else(|| RelayError::NotFound("Thread".into(), message.channel_id.to_string()))?;
        match thread.reply(&self.cx, message).await {
            Err(e @ RelayError::Undeliverable { .. }) => {
                warn!(recipient = %thread.recipient_id(), error = %e, "reply not delivered");
                let notice = OutgoingMessage::titled("Not delivered", UNDELIVERABLE_NOTICE);
                if let Err(e) = self.cx.transport.send(thread.relay_channel_id(), notice).await {
                    warn!(channel = %thread.relay_channel_id(), error = %e, "could not post delivery failure");
                }
                Err(e)
            }
            other => other,
        }
    }

    // Mirroring

    async fn mirror_edit(&self, message: &ChatMessage) -> Result<()> {
        let Some(link) = self.cx.store.find_link(message.id).await? else {
            return Ok(());
        };
        let edited = OutgoingMessage::titled(message.author.name.clone(), message.body());
        let result = if link.private_message == message.id {
            let edited = edited.with_footer(format!("Message ID: {}", message.id));
            self.cx
                .transport
                .edit_message(link.relay_channel, link.relay_message, edited)
                .await
        } else {
            self.cx
                .transport
                .edit_message(link.private_channel, link.private_message, edited.with_footer("Staff"))
                .await
        };
        match result {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        self.cx.store.edit_log_entry(message.id, &message.body()).await?;
        debug!(message = %message.id, "edit mirrored");
        Ok(())
    }

    async fn mirror_delete(&self, channel_id: ChannelId, message_id: MessageId) -> Result<()> {
        let Some(link) = self.cx.store.find_link(message_id).await? else {
            return Ok(());
        };
        // Only operator reply mirrors; a recipient's own message stays.
        if link.origin != LinkOrigin::Operator
            || link.relay_channel != channel_id
            || link.relay_message != message_id
        {
            return Ok(());
        }
        match self
            .cx
            .transport
            .delete_message(link.private_channel, link.private_message)
            .await
        {
            Ok(()) => {
                debug!(message = %message_id, "delete mirrored");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_reaction(&self, event: &ReactionEvent) -> Result<()> {
        match reactions::interpret(&self.cx, event).await? {
            ReactionAction::Close(thread) => {
                let name = event
                    .user_name
                    .clone()
                    .unwrap_or_else(|| event.user_id.to_string());
                info!(recipient = %event.user_id, "recipient closed thread by reaction");
                thread
                    .close(&self.cx, CloseRequest::new(Closer::user(event.user_id, name)))
                    .await
            }
            ReactionAction::Mirror {
                channel,
                message,
                emoji,
            } => match self.cx.transport.add_reaction(channel, message, &emoji).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e.into()),
            },
            ReactionAction::Ignore => Ok(()),
        }
    }

    async fn handle_channel_deleted(
        &self,
        channel: &ChannelInfo,
        deleted_by: Option<UserRef>,
    ) -> Result<()> {
        if deleted_by
            .as_ref()
            .is_some_and(|user| user.id == self.cx.transport.bot_id())
        {
            return Ok(());
        }

        if channel.kind == ChannelKind::Category
            && self.cx.config.channel(keys::MAIN_CATEGORY_ID).await? == Some(channel.id)
        {
            info!(channel = %channel.id, "relay category deleted, clearing setting");
            self.cx.config.remove(keys::MAIN_CATEGORY_ID).await?;
            return Ok(());
        }
        if self.cx.config.channel(keys::LOG_CHANNEL_ID).await? == Some(channel.id) {
            info!(channel = %channel.id, "log channel deleted, clearing setting");
            self.cx.config.remove(keys::LOG_CHANNEL_ID).await?;
            return Ok(());
        }

        if let Some(thread) = self.cx.registry.find_by_channel(channel.id) {
            let closer = deleted_by.map(Closer::from).unwrap_or(Closer::Automatic);
            info!(recipient = %thread.recipient_id(), channel = %channel.id, "relay channel deleted, closing thread");
            thread
                .close(&self.cx, CloseRequest::new(closer).silent(true).keep_channel())
                .await?;
        }
        Ok(())
    }

    async fn member_notice(&self, user_id: UserId, text: &str) -> Result<()> {
        let Some(thread) = self.cx.registry.find_by_recipient(user_id) else {
            return Ok(());
        };
        self.cx
            .transport
            .send(thread.relay_channel_id(), OutgoingMessage::text(text))
            .await?;
        Ok(())
    }

    async fn relay_typing(&self, channel_id: ChannelId, user_id: UserId, private: bool) -> Result<()> {
        if user_id == self.cx.transport.bot_id() {
            return Ok(());
        }
        let target = if private {
            if !self.cx.config.flag(keys::USER_TYPING).await? {
                return Ok(());
            }
            let Some(thread) = self.cx.registry.find_by_recipient(user_id) else {
                return Ok(());
            };
            if self.policy.is_blocked(user_id, Utc::now()).await? {
                return Ok(());
            }
            thread.relay_channel_id()
        } else {
            if !self.cx.config.flag(keys::MOD_TYPING).await? {
                return Ok(());
            }
            let Some(thread) = self.cx.registry.find_by_channel(channel_id) else {
                return Ok(());
            };
            if self.policy.is_blocked(thread.recipient_id(), Utc::now()).await? {
                return Ok(());
            }
            thread.private_channel(&*self.cx.transport).await?
        };
        if let Err(e) = self.cx.transport.trigger_typing(target).await {
            debug!(channel = %target, error = %e, "typing relay failed");
        }
        Ok(())
    }

    // Operator Operations

    pub async fn close_thread(&self, recipient_id: UserId, request: CloseRequest) -> Result<()> {
        self.ensure_ready()?;
        let thread = self
            .cx
            .registry
            .find_by_recipient(recipient_id)
            .ok_or_else(|| RelayError::NotFound("Thread".into(), recipient_id.to_string()))?;
        thread.close(&self.cx, request).await
    }

    pub async fn cancel_close(&self, recipient_id: UserId) -> Result<bool> {
        self.ensure_ready()?;
        match self.cx.registry.find_by_recipient(recipient_id) {
            Some(thread) => thread.cancel_closure(&self.cx).await,
            None => self.cx.scheduler.cancel(recipient_id).await,
        }
    }

    pub async fn block(
        &self,
        subject: UserId,
        reason: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<BlockEntry> {
        if reason.trim().is_empty() {
            return Err(RelayError::Validation("block reason cannot be empty".into()));
        }
        self.policy.block(subject, reason, expires_at).await
    }

    pub async fn unblock(&self, subject: UserId) -> Result<bool> {
        self.policy.unblock(subject).await
    }

    pub async fn whitelist(&self, subject: UserId) -> Result<()> {
        self.policy.whitelist(subject).await
    }

    pub async fn unwhitelist(&self, subject: UserId) -> Result<()> {
        self.policy.unwhitelist(subject).await
    }

    pub async fn blocked(&self) -> Result<Vec<BlockEntry>> {
        Ok(self.cx.store.list_blocks().await?)
    }

    pub fn pending_closures(&self) -> Vec<PendingClosure> {
        self.cx.scheduler.pending()
    }

    pub async fn search_logs(&self, query: &str, limit: usize) -> Result<Vec<ThreadLog>> {
        Ok(self.cx.store.search_logs(query.trim(), limit).await?)
    }
}
