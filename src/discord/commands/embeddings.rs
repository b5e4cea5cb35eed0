// Admin commands for the guild's embeddings (the assistant's memories).

use crate::core::assistant::embedding_transfer::{
    export_csv, export_json, parse_csv, parse_json, TransferFormat,
};
use crate::core::assistant::formatting::{pagify, EMBED_PAGE};
use crate::core::assistant::Embedding;
use crate::discord::assistant::report_error;
use crate::discord::{Context, Error};
use poise::serenity_prelude as serenity;

fn is_owner(ctx: Context<'_>) -> bool {
    ctx.framework().options().owners.contains(&ctx.author().id)
}

/// Manage the assistant's embeddings
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    subcommands("add", "delete", "list", "test", "reset", "resync", "import", "export")
)]
pub async fn embeddings(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Add an embedding
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn add(
    ctx: Context<'_>,
    #[description = "Unique name"] name: String,
    #[description = "Text to embed"] text: String,
    #[description = "Replace an existing entry with the same name"] overwrite: Option<bool>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be in a guild")?.get();
    ctx.defer().await?;

    let result = ctx
        .data()
        .assistant
        .add_embedding(guild_id, name.trim(), &text, overwrite.unwrap_or(false))
        .await;
    match result {
        Ok(entry) => {
            ctx.say(format!(
                "✅ Saved `{}` ({} dimensions)",
                entry.name,
                entry.vector.len()
            ))
            .await?;
        }
        Err(e) => {
            ctx.say(report_error(ctx.data(), &e, is_owner(ctx)).await).await?;
        }
    }
    Ok(())
}

/// Delete an embedding by exact name
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn delete(
    ctx: Context<'_>,
    #[description = "Exact name"] name: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be in a guild")?.get();
    match ctx.data().assistant.delete_embedding(guild_id, &name).await {
        Ok(()) => ctx.say(format!("🗑️ Deleted `{}`", name)).await?,
        Err(e) => ctx.say(report_error(ctx.data(), &e, is_owner(ctx)).await).await?,
    };
    Ok(())
}

fn list_line(entry: &Embedding) -> String {
    let preview: String = entry.text.chars().take(80).collect();
    format!(
        "**{}**{} `{}d` <t:{}:d>\n{}\n",
        entry.name,
        if entry.ai_created { " 🧠" } else { "" },
        entry.vector.len(),
        entry.modified_at,
        preview.replace('\n', " ")
    )
}

/// List this server's embeddings
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn list(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be in a guild")?.get();
    let entries = ctx.data().assistant.list_embeddings(guild_id).await?;
    if entries.is_empty() {
        ctx.say("There are no embeddings yet!").await?;
        return Ok(());
    }

    let text: String = entries.iter().map(list_line).collect();
    let pages = pagify(&text, EMBED_PAGE, &["\n**"]);
    let total = pages.len();
    for (i, page) in pages.into_iter().enumerate() {
        let embed = serenity::CreateEmbed::new()
            .title(format!("Embeddings ({})", entries.len()))
            .description(page)
            .color(0x5865F2)
            .footer(serenity::CreateEmbedFooter::new(format!("Page {}/{}", i + 1, total)));
        ctx.send(poise::CreateReply::default().embed(embed)).await?;
    }
    Ok(())
}

/// See which embeddings a query would pull in
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn test(
    ctx: Context<'_>,
    #[description = "Text to compare against"] query: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be in a guild")?.get();
    ctx.defer().await?;

    let related = match ctx.data().assistant.search_embeddings(guild_id, &query).await {
        Ok(related) => related,
        Err(e) => {
            ctx.say(report_error(ctx.data(), &e, is_owner(ctx)).await).await?;
            return Ok(());
        }
    };
    if related.is_empty() {
        ctx.say("No embeddings are related enough to that query.").await?;
        return Ok(());
    }

    let mut embed = serenity::CreateEmbed::new()
        .title("Related embeddings")
        .color(0x5865F2);
    for hit in related {
        let preview: String = hit.text.chars().take(200).collect();
        embed = embed.field(format!("{} ({:.4})", hit.name, hit.score), preview, false);
    }
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Delete every embedding in this server
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn reset(
    ctx: Context<'_>,
    #[description = "Type yes to confirm"] confirm: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be in a guild")?.get();
    if !confirm.eq_ignore_ascii_case("yes") {
        ctx.say("Not confirmed, nothing was deleted.").await?;
        return Ok(());
    }
    let removed = ctx.data().assistant.reset_embeddings(guild_id).await?;
    ctx.say(format!("🗑️ Deleted {} embeddings", removed)).await?;
    Ok(())
}

/// Re-embed entries made with a different embedding model
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn resync(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be in a guild")?.get();
    ctx.defer().await?;
    match ctx.data().assistant.resync_embeddings(guild_id).await {
        Ok(0) => ctx.say("All embeddings are already in sync.").await?,
        Ok(n) => ctx.say(format!("🔄 Re-embedded {} entries", n)).await?,
        Err(e) => ctx.say(report_error(ctx.data(), &e, is_owner(ctx)).await).await?,
    };
    Ok(())
}

/// Largest import file we'll download.
const MAX_IMPORT_BYTES: u32 = 25 * 1024 * 1024;

#[derive(Debug, Clone, Copy, poise::ChoiceParameter)]
pub enum ExportChoice {
    #[name = "JSON (with vectors)"]
    Json,
    #[name = "CSV (name and text)"]
    Csv,
}

impl From<ExportChoice> for TransferFormat {
    fn from(choice: ExportChoice) -> Self {
        match choice {
            ExportChoice::Json => TransferFormat::Json,
            ExportChoice::Csv => TransferFormat::Csv,
        }
    }
}

/// Import embeddings from a .json export or a .csv with name and text columns
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn import(
    ctx: Context<'_>,
    #[description = "A .json or .csv file"] file: serenity::Attachment,
    #[description = "Replace entries with the same name"] overwrite: Option<bool>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be in a guild")?.get();
    let overwrite = overwrite.unwrap_or(false);
    let format = match TransferFormat::from_filename(&file.filename) {
        Ok(format) => format,
        Err(e) => {
            ctx.say(format!("❌ {}", e)).await?;
            return Ok(());
        }
    };
    if file.size > MAX_IMPORT_BYTES {
        ctx.say("❌ That file is too large to import!").await?;
        return Ok(());
    }
    ctx.defer().await?;

    let bytes = file.download().await?;
    let assistant = &ctx.data().assistant;
    let result = match format {
        TransferFormat::Json => match parse_json(&bytes) {
            Ok(entries) => assistant.import_embeddings(guild_id, entries, overwrite).await,
            Err(e) => {
                ctx.say(format!("❌ Error reading **{}**: {}", file.filename, e)).await?;
                return Ok(());
            }
        },
        TransferFormat::Csv => match parse_csv(&bytes) {
            Ok(rows) => assistant.import_texts(guild_id, rows, overwrite).await,
            Err(e) => {
                ctx.say(format!("❌ Error reading **{}**: {}", file.filename, e)).await?;
                return Ok(());
            }
        },
    };

    match result {
        Ok(imported) => {
            ctx.say(format!("✅ Imported {} embeddings from `{}`", imported, file.filename))
                .await?;
        }
        Err(e) => {
            ctx.say(report_error(ctx.data(), &e, is_owner(ctx)).await).await?;
        }
    }
    Ok(())
}

/// Export this server's embeddings as a file
#[poise::command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn export(
    ctx: Context<'_>,
    #[description = "File format"] format: ExportChoice,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be in a guild")?.get();
    let entries = ctx.data().assistant.list_embeddings(guild_id).await?;
    if entries.is_empty() {
        ctx.say("There are no embeddings to export!").await?;
        return Ok(());
    }
    ctx.defer().await?;

    let format = TransferFormat::from(format);
    let bytes = match format {
        TransferFormat::Json => export_json(&entries)?,
        TransferFormat::Csv => export_csv(&entries)?,
    };
    let file = serenity::CreateAttachment::bytes(bytes, format.export_filename());
    let reply = poise::CreateReply::default()
        .content("Here is your embeddings export!")
        .attachment(file);
    if let Err(e) = ctx.send(reply).await {
        tracing::warn!(guild_id, "Embeddings export failed to send: {}", e);
        ctx.say("The export is too large to upload!").await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_lines_flag_ai_entries() {
        let mut entry = Embedding::new("rules", "Be nice\nNo spam", vec![0.0; 4]);
        assert!(!list_line(&entry).contains('🧠'));
        entry.ai_created = true;
        let line = list_line(&entry);
        assert!(line.starts_with("**rules** 🧠 `4d`"));
        assert!(line.contains("Be nice No spam"));
    }

    #[test]
    fn export_choices_map_to_formats() {
        assert_eq!(TransferFormat::from(ExportChoice::Json), TransferFormat::Json);
        assert_eq!(
            TransferFormat::from(ExportChoice::Csv).export_filename(),
            "embeddings_export.csv"
        );
    }
}
