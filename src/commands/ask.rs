use std::time::Duration;

use poise::CreateReply;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::answer::render::{loading_message, render_answer, render_progress};
use crate::answer::{Accumulator, Outcome, Phase};
use crate::backend::ChatRequest;
use crate::commands::{chunks, format_followups, truncate, MESSAGE_LIMIT};
use crate::state::Context;

/// Ask a question
#[poise::command(slash_command, guild_only)]
pub async fn ask(
    ctx: Context<'_>,
    #[description = "Your question"] question: String,
) -> Result<(), anyhow::Error> {
    let channel_id = ctx.channel_id().get();
    let config = ctx.data().chat_config.read().await.clone();

    // Starting a new answer stops whatever this channel was still streaming.
    let (generation, cancel, base, history, session_id) = ctx
        .data()
        .sessions
        .with_session(channel_id, |s| {
            let (generation, cancel) = s.begin();
            (generation, cancel, s.base_index(), s.make_history(&question), s.id.clone())
        })
        .await;

    info!(
        user = ctx.author().name,
        channel_id, generation, base, mode = %config.mode, question, "Question received"
    );

    let reply = ctx.say(loading_message(&Phase::Started)).await?;

    let request = ChatRequest {
        query: &question,
        mode: &config.mode,
        history: &history,
        session_id: &session_id,
    };

    let (tx, mut rx) = watch::channel(String::new());
    let answer = ctx.data().backend.ask(
        &request,
        Accumulator::new(base, config.key_scheme),
        &cancel,
        move |state| {
            tx.send_replace(render_progress(state));
        },
    );

    // Edits are throttled; only the latest state is ever shown.
    let interval = Duration::from_millis(config.edit_interval_ms);
    let editor = async {
        while rx.changed().await.is_ok() {
            let text = truncate(&rx.borrow_and_update(), MESSAGE_LIMIT);
            if let Err(e) = reply.edit(ctx, CreateReply::default().content(text)).await {
                warn!(error = %e, "Failed to edit answer message");
            }
            tokio::time::sleep(interval).await;
        }
    };

    let (outcome, ()) = tokio::join!(answer, editor);
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            ctx.data().sessions.with_session(channel_id, |s| s.end(generation)).await;
            return Err(e);
        }
    };

    match outcome {
        Outcome::Answered(answer) => {
            let mut full = render_answer(&answer.normalized, &answer.citations);
            if let Some(followups) = format_followups(&answer.followups) {
                full.push('\n');
                full.push_str(&followups);
            }
            info!(
                channel_id,
                citations = answer.citations.len(),
                followups = answer.followups.len(),
                "Answer delivered"
            );
            ctx.data()
                .sessions
                .with_session(channel_id, |s| {
                    s.end(generation);
                    s.record_answer(&question, answer);
                })
                .await;

            let mut parts = chunks(&full, MESSAGE_LIMIT).into_iter();
            let first = parts.next().unwrap_or_default().to_string();
            reply.edit(ctx, CreateReply::default().content(first)).await?;
            for part in parts {
                ctx.say(part).await?;
            }
        }
        Outcome::Failed(message) => {
            warn!(channel_id, error = %message, "Answer failed");
            ctx.data()
                .sessions
                .with_session(channel_id, |s| {
                    s.end(generation);
                    s.record_error(&question, &message);
                })
                .await;
            reply
                .edit(ctx, CreateReply::default().content(truncate(&format!("**Error:** {}", message), MESSAGE_LIMIT)))
                .await?;
        }
        Outcome::Aborted => {
            info!(channel_id, generation, "Answer stopped");
            ctx.data().sessions.with_session(channel_id, |s| s.end(generation)).await;
            reply
                .edit(ctx, CreateReply::default().content("*Stopped.*"))
                .await?;
        }
    }

    Ok(())
}

/// Stop the answer currently streaming in this channel
#[poise::command(slash_command, guild_only)]
pub async fn stop(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let channel_id = ctx.channel_id().get();
    let stopped = ctx.data().sessions.with_session(channel_id, |s| s.cancel()).await;
    if stopped {
        ctx.say("Stopping the current answer.").await?;
    } else {
        ctx.say("Nothing is being answered right now.").await?;
    }
    Ok(())
}
