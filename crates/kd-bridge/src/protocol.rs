use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events a terminal client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum TerminalClientEvent {
    StartTerminal {
        environment_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    TerminalInput {
        data: String,
    },
    TerminalResize {
        cols: u16,
        rows: u16,
    },
}

/// Events pushed to a terminal client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum TerminalServerEvent {
    TerminalReady {
        environment_id: Uuid,
    },
    TerminalOutput {
        data: String,
    },
    TerminalExit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u32>,
    },
    TerminalError {
        message: String,
    },
}

impl TerminalServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        TerminalServerEvent::TerminalError {
            message: message.into(),
        }
    }
}
