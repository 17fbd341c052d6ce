//! Join handshake with name-collision retry
//!
//! Every attempt builds a fresh session and opens a fresh chat channel, so
//! each channel carries exactly one join message. A rejected attempt's
//! channel is cancelled before the next name is requested.

use futures::stream::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::chat::{ChatSession, SessionContext, SessionCore};
use super::state::ChatSessionState;
use crate::console::InputEvent;
use crate::error::{ChatError, ProtocolError};
use crate::protocol::{name_taken_reason, SessionIdentity};

/// Supplies user names for join attempts
#[async_trait::async_trait]
pub trait NameSource: Send {
    /// Name for the next attempt. `rejection` is the server's reason for
    /// refusing the previous one, `None` on the first call.
    ///
    /// `input` is the user input channel, lent for prompting; whatever is
    /// left in it goes to the accepted session.
    async fn next_name(
        &mut self,
        rejection: Option<&str>,
        input: &mut mpsc::Receiver<InputEvent>,
    ) -> Result<String, ChatError>;
}

/// Join `room_id`, retrying with new names while the server reports collisions
///
/// `input` is lent to `names` between attempts and handed to the accepted
/// session, lines typed meanwhile included. Rejected attempts never see it.
pub async fn join_room(
    ctx: &SessionContext,
    room_id: &str,
    names: &mut dyn NameSource,
    mut input: mpsc::Receiver<InputEvent>,
) -> Result<ChatSession, ChatError> {
    let max_attempts = ctx.config.max_join_attempts;
    let mut rejection: Option<String> = None;
    let mut attempts = 0;

    while attempts < max_attempts {
        attempts += 1;

        let name = names.next_name(rejection.as_deref(), &mut input).await?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::EmptyName);
        }

        let identity = SessionIdentity::new(name, room_id);
        let core = SessionCore::new(ctx, identity.clone());
        let (handoff, pending_input) = oneshot::channel();

        info!("Joining {} as {} (attempt {}/{})", room_id, name, attempts, max_attempts);

        let mut channel = ctx
            .transport
            .open_chat(core.outbound_messages(pending_input), identity.metadata())
            .await?;

        let first = match channel.inbound.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                channel.cancel();
                warn!("Join as {} failed: {}", name, e);
                return Err(e.into());
            }
            None => {
                channel.cancel();
                return Err(ChatError::ClosedDuringHandshake);
            }
        };

        if let Some(reason) = name_taken_reason(&first) {
            channel.cancel();
            drop(handoff);

            let err = ProtocolError::NameTaken(reason.to_string());
            info!("Name {} rejected: {}", name, reason);
            ctx.console.report_error("join", &err);
            rejection = Some(reason.to_string());
            continue;
        }

        core.set_state(ChatSessionState::Active);
        if handoff.send(input).is_err() {
            channel.cancel();
            return Err(ChatError::ClosedDuringHandshake);
        }

        info!("Joined {} as {}", room_id, name);
        return Ok(ChatSession::new(core, ctx.config.clone(), channel, first));
    }

    debug!("Giving up after {} join attempts", attempts);
    Err(ChatError::JoinAttemptsExhausted(max_attempts))
}
