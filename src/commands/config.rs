use tracing::info;

use crate::state::Context;

/// Configure answer settings (admin only)
#[poise::command(slash_command, guild_only)]
pub async fn config(
    ctx: Context<'_>,
    #[description = "mode | key_scheme | edit_interval_ms"] param: Option<String>,
    #[description = "New value"] value: Option<String>,
) -> Result<(), anyhow::Error> {
    let user_id = ctx.author().id.get();
    if !ctx.data().is_admin(user_id) {
        ctx.say("This command is admin-only.").await?;
        return Ok(());
    }

    match (param.as_deref(), value.as_deref()) {
        // Show current config
        (None, _) => {
            let config = ctx.data().chat_config.read().await;
            ctx.say(format!(
                "**Answer Configuration:**\n\
                 `mode`: {}\n\
                 `key_scheme`: {}\n\
                 `edit_interval_ms`: {}",
                config.mode,
                config.key_scheme.as_str(),
                config.edit_interval_ms
            ))
            .await?;
        }
        (Some(key), Some(val)) => {
            let result = ctx.data().chat_config.write().await.set(key, val);
            match result {
                Ok(()) => {
                    info!(user_id, key, value = val, "Config updated");
                    ctx.say(format!("`{}` set to {}", key, val)).await?;
                }
                Err(e) => {
                    ctx.say(format!("{}", e)).await?;
                }
            }
        }
        (Some(_), None) => {
            ctx.say("Provide both `param` and `value`. Example: `/cite config mode concise`")
                .await?;
        }
    }

    Ok(())
}
