use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use futures::StreamExt;
use serde::Deserialize;
use switchyard::message::Message;
use switchyard::{Gateway, TurnRequest};

use crate::signal::cancel_on_shutdown;

#[derive(Deserialize)]
#[serde(untagged)]
enum ConversationFile {
    Request(TurnRequest),
    Messages(Vec<Message>),
}

/// Read a turn from `path`: a full request object, or just its messages.
pub fn load_request(path: &Path) -> Result<TurnRequest> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: ConversationFile = serde_json::from_str(&content)
        .with_context(|| format!("{} is neither a turn request nor a message list", path.display()))?;

    Ok(match parsed {
        ConversationFile::Request(mut request) => {
            if request.conversation_id.is_empty() {
                request.conversation_id = TurnRequest::new(Vec::new()).conversation_id;
            }
            request
        }
        ConversationFile::Messages(messages) => TurnRequest::new(messages),
    })
}

pub async fn handle_run(gateway: &Gateway, request: TurnRequest) -> Result<()> {
    let cancel = cancel_on_shutdown();
    let mut events = gateway.reply(request, cancel);
    while let Some(event) = events.next().await {
        println!("{}", serde_json::to_string(&event?)?);
    }
    Ok(())
}
