use tracing::info;

use crate::commands::truncate;
use crate::state::Context;

/// Clear this channel's conversation
#[poise::command(slash_command, guild_only)]
pub async fn clear(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let channel_id = ctx.channel_id().get();
    ctx.data().sessions.with_session(channel_id, |s| s.clear()).await;
    info!(channel_id, "Session cleared");
    ctx.say("Session cleared.").await?;
    Ok(())
}

/// Remove the last question and its answer from the conversation
#[poise::command(slash_command, guild_only)]
pub async fn undo(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let channel_id = ctx.channel_id().get();
    let removed = ctx
        .data()
        .sessions
        .with_session(channel_id, |s| {
            if s.entries().is_empty() {
                None
            } else {
                Some(s.undo())
            }
        })
        .await;

    match removed {
        None => ctx.say("Nothing to undo.").await?,
        Some(Some(question)) => {
            ctx.say(format!("Removed: *{}*", truncate(&question, 200))).await?
        }
        Some(None) => ctx.say("Last message marked as deleted.").await?,
    };
    Ok(())
}
