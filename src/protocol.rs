//! Text events from the voice server, wrapped as `{"event": {<kind>: ...}}`.

use serde::Deserialize;

#[derive(Deserialize, Debug)]
struct Envelope {
    event: ServerEvent,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ServerEvent {
    /// Server-assigned chat id for this connection
    ChatInit {
        #[serde(rename = "chatId")]
        chat_id: String,
    },
    /// Live transcript of the user's speech; drives barge-in
    UserTranscript(String),
    /// Assistant text so far (cumulative)
    TextOutput {
        content: String,
        #[serde(default, rename = "isFinal")]
        is_final: bool,
    },
    /// End of an assistant turn
    AssistantFinal(bool),
    /// Opaque status line for display
    StatusUpdate(String),
    ToolEvent {
        name: String,
        #[serde(default)]
        status: Option<String>,
    },
}

pub fn parse_event(text: &str) -> serde_json::Result<ServerEvent> {
    serde_json::from_str::<Envelope>(text).map(|env| env.event)
}
