use tracing::{info, warn};

use crate::commands::{format_followups, send_chunked};
use crate::state::Context;

/// Show the suggested follow-ups, or read the answer to one of them
#[poise::command(slash_command, guild_only)]
pub async fn followup(
    ctx: Context<'_>,
    #[description = "Follow-up number (omit to list them)"]
    #[min = 1]
    number: Option<u32>,
) -> Result<(), anyhow::Error> {
    let channel_id = ctx.channel_id().get();
    let followups = ctx
        .data()
        .sessions
        .read(channel_id, |s| s.map(|s| s.followups().to_vec()).unwrap_or_default())
        .await;

    let Some(number) = number else {
        match format_followups(&followups) {
            Some(list) => ctx.say(list).await?,
            None => ctx.say("No follow-ups suggested yet.").await?,
        };
        return Ok(());
    };

    let picked = number
        .checked_sub(1)
        .and_then(|i| followups.get(i as usize))
        .cloned();
    let Some(picked) = picked else {
        ctx.say(format!(
            "There is no follow-up #{}. Use `/cite followup` to list them.",
            number
        ))
        .await?;
        return Ok(());
    };

    ctx.defer().await?;
    info!(channel_id, page = %picked.page_reference, "Fetching follow-up answer");

    let answer = match ctx.data().backend.fetch_authored(&picked.page_reference).await {
        Ok(answer) => answer,
        Err(e) => {
            warn!(error = %e, page = %picked.page_reference, "Follow-up fetch failed");
            ctx.say(format!("Couldn't load that answer: {}", e)).await?;
            return Ok(());
        }
    };

    let title = if answer.title.is_empty() { picked.text.clone() } else { answer.title.clone() };
    let mut full = format!("**{}**\n\n{}\n\n<{}>\n", title, answer.content, answer.url);

    let merged = ctx
        .data()
        .sessions
        .with_session(channel_id, |s| {
            s.record_authored(&picked.text, answer);
            s.followups().to_vec()
        })
        .await;
    if let Some(list) = format_followups(&merged) {
        full.push('\n');
        full.push_str(&list);
    }

    send_chunked(&ctx, &full).await
}
