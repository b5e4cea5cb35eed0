use crate::discord::{Context, Error};

/// Show the last unexpected assistant error.
#[poise::command(prefix_command, slash_command, owners_only, hide_in_help)]
pub async fn lasterror(ctx: Context<'_>) -> Result<(), Error> {
    let last = ctx.data().last_error.lock().await.clone();
    let text = match last {
        Some(err) => format!("```\n{}\n```", err.chars().take(1900).collect::<String>()),
        None => "No errors recorded since startup.".to_string(),
    };
    ctx.send(poise::CreateReply::default().content(text).ephemeral(true))
        .await?;
    Ok(())
}
