use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TerminalCommand {
    pub id: String,
    pub command: String,
    pub output: String,
    pub error: String,
    pub status: i32,
    pub time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub use_sudo: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Host,
    Container,
}

impl Target {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Container => "container",
        }
    }
}

impl TerminalCommand {
    pub fn target(&self) -> Option<Target> {
        match self.target.as_deref().map(str::trim) {
            None | Some("") | Some("host") => Some(Target::Host),
            Some("container") => Some(Target::Container),
            Some(_) => None,
        }
    }

    pub fn container_name(&self) -> Option<&str> {
        self.container_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Execute {
        #[serde(default)]
        command: Option<TerminalCommand>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    History { history: Vec<TerminalCommand> },
    Partial { command: TerminalCommand },
    Result { command: TerminalCommand },
    Error { command: TerminalCommand },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::History { .. } => "history",
            Self::Partial { .. } => "partial",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_execute_with_optional_fields() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "execute",
            "command": {"id": "c1", "command": "ls", "target": "container", "containerName": "web", "useSudo": true}
        }))
        .unwrap();
        let ClientMessage::Execute { command: Some(cmd) } = msg else {
            panic!("ожидалась команда execute");
        };
        assert_eq!(cmd.id, "c1");
        assert_eq!(cmd.target(), Some(Target::Container));
        assert_eq!(cmd.container_name(), Some("web"));
        assert!(cmd.use_sudo);
        assert_eq!(cmd.output, "");
    }

    #[test]
    fn unknown_type_and_missing_command_are_tolerated() {
        let msg: ClientMessage = serde_json::from_value(json!({"type": "resize", "cols": 80})).unwrap();
        assert!(matches!(msg, ClientMessage::Unknown));

        let msg: ClientMessage = serde_json::from_value(json!({"type": "execute"})).unwrap();
        assert!(matches!(msg, ClientMessage::Execute { command: None }));
    }

    #[test]
    fn target_selector_defaults_to_host() {
        let mut cmd = TerminalCommand::default();
        assert_eq!(cmd.target(), Some(Target::Host));
        cmd.target = Some(String::new());
        assert_eq!(cmd.target(), Some(Target::Host));
        cmd.target = Some("vm".to_string());
        assert_eq!(cmd.target(), None);
    }

    #[test]
    fn server_messages_are_tagged() {
        let cmd = TerminalCommand {
            id: "1".to_string(),
            command: "echo hi".to_string(),
            output: "hi\n".to_string(),
            ..TerminalCommand::default()
        };
        let value = serde_json::to_value(ServerMessage::Partial { command: cmd }).unwrap();
        assert_eq!(value["type"], "partial");
        assert_eq!(value["command"]["output"], "hi\n");
        assert!(value["command"].get("containerName").is_none());
        assert!(value["command"].get("useSudo").is_none());

        let value = serde_json::to_value(ServerMessage::History { history: vec![] }).unwrap();
        assert_eq!(value, json!({"type": "history", "history": []}));
    }
}
