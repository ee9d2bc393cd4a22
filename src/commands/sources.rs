use crate::answer::render::format_source;
use crate::commands::send_chunked;
use crate::state::Context;

/// List every source cited in this channel's conversation
#[poise::command(slash_command, guild_only)]
pub async fn sources(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let channel_id = ctx.channel_id().get();
    let bibliography = ctx
        .data()
        .sessions
        .read(channel_id, |s| s.map(|s| s.bibliography()).unwrap_or_default())
        .await;

    if bibliography.is_empty() {
        ctx.say("No sources cited in this channel yet. Use `/cite ask` to start.")
            .await?;
        return Ok(());
    }

    let mut output = String::from("**Sources cited so far**\n\n");
    for entry in &bibliography {
        output.push_str(&format_source(&entry.indices, &entry.source));
        output.push('\n');
    }

    send_chunked(&ctx, &output).await
}
