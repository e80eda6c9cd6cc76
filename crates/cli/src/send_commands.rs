use std::path::PathBuf;

use {
    anyhow::{Context, Result},
    chatrelay_common::types::{FileRef, MediaKind, OutboundMessage},
    chatrelay_dispatch::DispatchQueue,
    clap::{Args, Subcommand, ValueEnum},
};

/// Target chat shared by every send command.
#[derive(Args)]
pub struct Target {
    /// Sending account (gateway session).
    #[arg(long, short)]
    account: String,
    /// Recipient chat id.
    #[arg(long, short)]
    to: String,
}

#[derive(Subcommand)]
pub enum SendAction {
    /// Enqueue a text message.
    Text {
        #[command(flatten)]
        target: Target,
        text: String,
        /// Message id to quote.
        #[arg(long)]
        reply_to: Option<String>,
    },
    /// Enqueue an image or file.
    Media {
        #[command(flatten)]
        target: Target,
        #[arg(long, value_enum, default_value_t = MediaArg::File)]
        kind: MediaArg,
        /// Publicly reachable URL the gateway downloads.
        #[arg(long)]
        url: String,
        #[arg(long)]
        filename: String,
        #[arg(long)]
        mimetype: String,
        #[arg(long)]
        caption: Option<String>,
        #[arg(long)]
        reply_to: Option<String>,
    },
    /// Enqueue an ordered batch read from a JSON array of messages.
    Batch {
        #[command(flatten)]
        target: Target,
        /// JSON file, e.g. `[{"type":"text","text":"hi"},{"type":"image","file":{..}}]`.
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum MediaArg {
    Image,
    File,
}

impl From<MediaArg> for MediaKind {
    fn from(arg: MediaArg) -> Self {
        match arg {
            MediaArg::Image => Self::Image,
            MediaArg::File => Self::File,
        }
    }
}

pub async fn handle_send(action: SendAction, queue: &DispatchQueue) -> Result<()> {
    let id = match action {
        SendAction::Text {
            target,
            text,
            reply_to,
        } => {
            queue
                .enqueue_text(&target.account, &target.to, text, reply_to)
                .await?
        },
        SendAction::Media {
            target,
            kind,
            url,
            filename,
            mimetype,
            caption,
            reply_to,
        } => {
            let file = FileRef {
                url,
                filename,
                mimetype,
            };
            queue
                .enqueue_media(&target.account, &target.to, kind.into(), file, caption, reply_to)
                .await?
        },
        SendAction::Batch { target, file } => {
            let messages = read_batch(&file)?;
            queue
                .enqueue_batch(&target.account, &target.to, messages)
                .await?
        },
    };
    println!("{id}");
    Ok(())
}

fn read_batch(path: &std::path::Path) -> Result<Vec<OutboundMessage>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid batch file {}", path.display()))
}
