//! Decode a captured wire message.

use anyhow::{Context, Result};
use cardsync_types::SyncMessage;
use std::path::Path;

/// Run the decode command.
pub async fn run(file: &Path) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let message = SyncMessage::from_bytes(&bytes).context("Not a valid sync message")?;
    print!("{}", describe(&message));
    Ok(())
}

fn describe(message: &SyncMessage) -> String {
    let mut out = format!(
        "type:      {}\nsent:      {}\n",
        message.message_type, message.timestamp
    );
    if let Some(card) = &message.card_data {
        out.push_str(&format!(
            "card:      {}\nkind:      {}\ncontent:   {}\ncompleted: {}\n",
            card.id,
            card.card_type.name(),
            card.content,
            card.is_completed,
        ));
        let image = card.image_len();
        if image > 0 {
            out.push_str(&format!("image:     {image} bytes\n"));
        }
    }
    out
}
