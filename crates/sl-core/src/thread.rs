//! # Thread
//!
//! One conversation between a recipient and the operator pool, backed by a
//! single relay channel. Owns message relay in both directions and the
//! closure state machine: `Open -> Closing -> Closed`, with
//! `Closing -> Open` when a pending closure is cancelled.
//!
//! # Developer Note
//! The state lock is a plain mutex and is never held across an `.await`.
//! Collaborators are reached through the [`RelayContext`] passed to each
//! call; a thread keeps no handle to the registry that owns it.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::{keys, ConfigCache};
use crate::context::RelayContext;
use crate::duration::humanize;
use crate::error::{RelayError, Result, TransportError};
use crate::models::{
    ChannelId, ChannelKind, ChatMessage, CloseRequest, ClosedLog, LinkOrigin, LogEntry, LogKind,
    MessageId, MessageLink, OutgoingMessage, PendingClosure, ThreadState, UserId,
};
use crate::traits::ChatTransport;

pub const CLOSURE_CANCELLED_NOTICE: &str = "Scheduled close has been cancelled.";

/// Result of relaying an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Posted into the relay channel under this id.
    Relayed(MessageId),
    /// The message id was already relayed; nothing was posted.
    Duplicate,
}

struct ThreadInner {
    state: ThreadState,
    pending: Option<PendingClosure>,
    /// Inbound ids relayed (or in flight) during this process lifetime.
    seen: HashSet<MessageId>,
}

pub struct Thread {
    recipient_id: UserId,
    relay_channel_id: ChannelId,
    created_at: DateTime<Utc>,
    private_channel: OnceCell<ChannelId>,
    inner: Mutex<ThreadInner>,
}

impl Thread {
    pub fn new(recipient_id: UserId, relay_channel_id: ChannelId, created_at: DateTime<Utc>) -> Self {
        Self {
            recipient_id,
            relay_channel_id,
            created_at,
            private_channel: OnceCell::new(),
            inner: Mutex::new(ThreadInner {
                state: ThreadState::Open,
                pending: None,
                seen: HashSet::new(),
            }),
        }
    }

    pub fn recipient_id(&self) -> UserId {
        self.recipient_id
    }

    pub fn relay_channel_id(&self) -> ChannelId {
        self.relay_channel_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> ThreadState {
        self.inner().state
    }

    pub fn pending(&self) -> Option<PendingClosure> {
        self.inner().pending.clone()
    }

    fn inner(&self) -> MutexGuard<'_, ThreadInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_live(&self) -> Result<()> {
        match self.state() {
            ThreadState::Closed => Err(RelayError::ThreadClosed(self.recipient_id)),
            _ => Ok(()),
        }
    }

    /// The recipient's private channel, opened on first use.
    pub async fn private_channel(
        &self,
        transport: &dyn ChatTransport,
    ) -> std::result::Result<ChannelId, TransportError> {
        self.private_channel
            .get_or_try_init(|| transport.private_channel(self.recipient_id))
            .await
            .copied()
    }

    /// True when `message` is the creation response this thread sent to the
    /// recipient. Matched on the exact card timestamp, not just the channel.
    pub fn is_creation_notice(&self, message: &ChatMessage, bot_id: UserId) -> bool {
        message.author.id == bot_id && message.stamp == Some(self.created_at)
    }

    /// Relays a recipient message into the relay channel.
    pub async fn send(&self, cx: &RelayContext, message: &ChatMessage) -> Result<SendOutcome> {
        self.ensure_live()?;

        // 1. Dedupe on the transport's message id (memory first, then the link map).
        if !self.inner().seen.insert(message.id) {
            debug!(message = %message.id, "duplicate delivery ignored");
            return Ok(SendOutcome::Duplicate);
        }
        let relayed = match self.relay_inbound(cx, message).await {
            Ok(Some(id)) => id,
            Ok(None) => return Ok(SendOutcome::Duplicate),
            Err(e) => {
                // Not relayed: a redelivery must get through.
                self.inner().seen.remove(&message.id);
                return Err(e);
            }
        };

        // 4. Persist the pairing and the audit copy.
        cx.store
            .save_link(&MessageLink {
                recipient_id: self.recipient_id,
                relay_channel: self.relay_channel_id,
                relay_message: relayed,
                private_channel: message.channel_id,
                private_message: message.id,
                origin: LinkOrigin::Recipient,
            })
            .await?;
        cx.store
            .append_log(self.relay_channel_id, &LogEntry::from_message(message, LogKind::ThreadMessage))
            .await?;

        Ok(SendOutcome::Relayed(relayed))
    }

    /// Steps of [`Self::send`] up to the relay post. `None` means the
    /// message was relayed before a restart.
    async fn relay_inbound(&self, cx: &RelayContext, message: &ChatMessage) -> Result<Option<MessageId>> {
        if cx.store.find_link(message.id).await?.is_some() {
            debug!(message = %message.id, "message already relayed before restart");
            return Ok(None);
        }

        // 2. Activity may cancel a pending closure.
        if let Some(pending) = self.pending() {
            let policy = cx.config.cancel_policy().await?;
            if policy.cancels(pending.auto_close) && self.cancel_closure(cx).await? {
                if let Err(e) = cx
                    .transport
                    .send(self.relay_channel_id, OutgoingMessage::text(CLOSURE_CANCELLED_NOTICE))
                    .await
                {
                    warn!(channel = %self.relay_channel_id, error = %e, "could not post cancellation notice");
                }
            }
        }

        // 3. Relay.
        let outgoing = OutgoingMessage::titled(message.author.name.clone(), message.body())
            .with_footer(format!("Message ID: {}", message.id))
            .stamped(message.sent_at);
        Ok(Some(cx.transport.send(self.relay_channel_id, outgoing).await?))
    }

    /// Delivers an operator reply to the recipient.
    ///
    /// A delivery failure is returned as [`RelayError::Undeliverable`] so the
    /// caller can tell the operator; nothing is mirrored in that case.
    pub async fn reply(&self, cx: &RelayContext, message: &ChatMessage) -> Result<MessageId> {
        self.ensure_live()?;
        let undeliverable = |source: TransportError| RelayError::Undeliverable {
            recipient: self.recipient_id,
            source,
        };

        let private = self.private_channel(&*cx.transport).await.map_err(undeliverable)?;
        let outgoing = OutgoingMessage::titled(message.author.name.clone(), message.body())
            .with_footer("Staff")
            .stamped(message.sent_at);
        let delivered = cx
            .transport
            .send(private, outgoing.clone())
            .await
            .map_err(undeliverable)?;

        let mirror = cx
            .transport
            .send(
                self.relay_channel_id,
                outgoing.with_footer(format!("Message ID: {delivered}")),
            )
            .await;
        match mirror {
            Ok(mirror_id) => {
                cx.store
                    .save_link(&self.operator_link(mirror_id, private, delivered))
                    .await?;
            }
            Err(e) => {
                warn!(channel = %self.relay_channel_id, error = %e, "reply delivered but not mirrored");
            }
        }
        // The command message itself also maps onto the delivered copy.
        cx.store
            .save_link(&self.operator_link(message.id, private, delivered))
            .await?;
        cx.store
            .append_log(self.relay_channel_id, &LogEntry::from_message(message, LogKind::Reply))
            .await?;

        self.restart_auto_close(cx).await?;
        Ok(delivered)
    }

    fn operator_link(&self, relay_message: MessageId, private: ChannelId, delivered: MessageId) -> MessageLink {
        MessageLink {
            recipient_id: self.recipient_id,
            relay_channel: self.relay_channel_id,
            relay_message,
            private_channel: private,
            private_message: delivered,
            origin: LinkOrigin::Operator,
        }
    }

    /// Records operator chatter that is not delivered to the recipient.
    pub async fn note(&self, cx: &RelayContext, message: &ChatMessage) -> Result<()> {
        cx.store
            .append_log(self.relay_channel_id, &LogEntry::from_message(message, LogKind::Internal))
            .await?;
        Ok(())
    }

    /// Re-arms the inactivity closure after operator activity. An
    /// operator-scheduled closure is left in place.
    async fn restart_auto_close(&self, cx: &RelayContext) -> Result<()> {
        let Some(timeout) = cx.config.duration(keys::THREAD_AUTO_CLOSE).await? else {
            return Ok(());
        };
        if timeout <= Duration::zero() {
            return Ok(());
        }
        if self.pending().is_some_and(|p| !p.auto_close) {
            return Ok(());
        }

        let silent = cx.config.flag(keys::THREAD_AUTO_CLOSE_SILENTLY).await?;
        let response = cx
            .config
            .text(keys::THREAD_AUTO_CLOSE_RESPONSE)
            .await?
            .replace("{timeout}", &humanize(timeout));
        self.close(
            cx,
            CloseRequest::automatic(timeout).silent(silent).message(response),
        )
        .await
    }

    /// Closes now (`after` is zero) or schedules the closure. Scheduling while
    /// already closing replaces the pending closure.
    pub async fn close(&self, cx: &RelayContext, request: CloseRequest) -> Result<()> {
        if request.after < Duration::zero() {
            return Err(RelayError::Validation("close delay cannot be negative".into()));
        }
        self.ensure_live()?;

        let closure = request.into_closure(self.recipient_id, Utc::now());
        if closure.fire_at <= Utc::now() {
            return self.close_now(cx, &closure).await;
        }

        let (previous_state, previous_pending) = {
            let mut inner = self.inner();
            let previous = (inner.state, inner.pending.replace(closure.clone()));
            inner.state = ThreadState::Closing;
            previous
        };
        let fire_at = closure.fire_at;
        let auto_close = closure.auto_close;
        if let Err(e) = cx.scheduler.schedule(closure).await {
            let mut inner = self.inner();
            if inner.state == ThreadState::Closing {
                inner.state = previous_state;
                inner.pending = previous_pending;
            }
            return Err(e);
        }
        info!(
            recipient = %self.recipient_id,
            fire_at = %fire_at,
            auto_close,
            "thread closure scheduled"
        );
        Ok(())
    }

    /// Runs a closure immediately. A second call on a closed thread is a no-op.
    pub async fn close_now(&self, cx: &RelayContext, closure: &PendingClosure) -> Result<()> {
        {
            let mut inner = self.inner();
            if inner.state == ThreadState::Closed {
                return Ok(());
            }
            inner.state = ThreadState::Closed;
            inner.pending = None;
        }

        // 1. Evict so new messages open a fresh thread.
        cx.registry.remove(self);
        if let Err(e) = cx.scheduler.cancel(self.recipient_id).await {
            warn!(recipient = %self.recipient_id, error = %e, "could not drop closure record");
        }

        // 2. Audit record.
        let closed = ClosedLog {
            closer: closure.closer.clone(),
            message: closure.message.clone(),
            closed_at: Utc::now(),
        };
        let log = match cx.store.close_log(self.relay_channel_id, &closed).await {
            Ok(log) => log,
            Err(e) => {
                warn!(recipient = %self.recipient_id, error = %e, "could not close thread log");
                None
            }
        };

        // 3. Summary in the log channel.
        let log_channel = match cx
            .config
            .resolve_channel(keys::LOG_CHANNEL_ID, ChannelKind::Text, &*cx.transport)
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "could not resolve log channel, skipping close summary");
                None
            }
        };
        if let Some(log_channel) = log_channel {
            let name = log
                .as_ref()
                .map(|l| l.recipient_name.clone())
                .unwrap_or_else(|| self.recipient_id.to_string());
            let mut summary = OutgoingMessage::titled(
                "Thread closed",
                format!("Thread with {name} ({}) closed by {}.", self.recipient_id, closure.closer.label()),
            )
            .stamped(closed.closed_at);
            if let Some(log) = &log {
                summary = summary.with_footer(format!("Log key: {}", log.key));
            }
            if let Err(e) = cx.transport.send(log_channel.id, summary).await {
                warn!(channel = %log_channel.id, error = %e, "could not post close summary");
            }
        }

        // 4. Tell the recipient.
        if !closure.silent {
            let body = match &closure.message {
                Some(message) => message.clone(),
                None => match cx.config.text(keys::THREAD_CLOSE_RESPONSE).await {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "could not read close response, using the default");
                        ConfigCache::default_for(keys::THREAD_CLOSE_RESPONSE)
                            .unwrap_or_default()
                            .to_string()
                    }
                }
                .replace("{closer}", closure.closer.label()),
            };
            let notice = OutgoingMessage::titled("Thread Closed", body)
                .with_footer("Replying will create a new thread")
                .stamped(closed.closed_at);
            let sent = match self.private_channel(&*cx.transport).await {
                Ok(private) => cx.transport.send(private, notice).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!(recipient = %self.recipient_id, error = %e, "could not send closing notice");
            }
        }

        // 5. Drop the relay channel.
        if closure.delete_channel {
            match cx.transport.delete_channel(self.relay_channel_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(channel = %self.relay_channel_id, error = %e, "could not delete relay channel");
                }
            }
        }

        info!(recipient = %self.recipient_id, closer = closure.closer.label(), "thread closed");
        Ok(())
    }

    /// Cancels a pending closure. Returns whether one was pending.
    pub async fn cancel_closure(&self, cx: &RelayContext) -> Result<bool> {
        let had_pending = {
            let mut inner = self.inner();
            if inner.state == ThreadState::Closing {
                inner.state = ThreadState::Open;
            }
            inner.pending.take().is_some()
        };
        let disarmed = cx.scheduler.cancel(self.recipient_id).await?;
        if had_pending || disarmed {
            info!(recipient = %self.recipient_id, "scheduled closure cancelled");
        }
        Ok(had_pending || disarmed)
    }

    /// Marks a recovered closure as pending without scheduling it.
    pub fn restore_closing(&self, closure: PendingClosure) {
        let mut inner = self.inner();
        if inner.state != ThreadState::Closed {
            inner.state = ThreadState::Closing;
            inner.pending = Some(closure);
        }
    }
}
