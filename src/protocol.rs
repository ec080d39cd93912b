use crate::error::{ApiError, ErrorCode, RelayResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    InitSession { session_id: String },
    RequestWelcome,
    RequestFiles { prefix: String },
    Command { command: String, use_pty: bool },
    PtyInput { data: String },
    PtyResize { cols: u16, rows: u16 },
    Ping,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitSessionPayload {
    session_id: String,
}

#[derive(Deserialize, Default)]
struct RequestFilesPayload {
    #[serde(default)]
    prefix: Option<String>,
}

#[derive(Deserialize)]
struct CommandPayload {
    command: String,
    #[serde(rename = "usePTY", default = "default_use_pty")]
    use_pty: bool,
}

fn default_use_pty() -> bool {
    true
}

#[derive(Deserialize)]
struct PtyInputPayload {
    data: String,
}

#[derive(Deserialize)]
struct PtyResizePayload {
    cols: u16,
    rows: u16,
}

impl ClientMessage {
    pub fn parse(text: &str) -> RelayResult<Self> {
        let envelope: Envelope = serde_json::from_str(text).map_err(malformed)?;
        let payload = envelope.payload;
        let message = match envelope.kind.as_str() {
            "init-session" => {
                let p: InitSessionPayload = payload_as(payload)?;
                ClientMessage::InitSession {
                    session_id: p.session_id,
                }
            }
            "request-welcome" => ClientMessage::RequestWelcome,
            "request-files" => {
                let p: RequestFilesPayload = if payload.is_null() {
                    RequestFilesPayload::default()
                } else {
                    payload_as(payload)?
                };
                ClientMessage::RequestFiles {
                    prefix: p.prefix.unwrap_or_default(),
                }
            }
            "command" => {
                let p: CommandPayload = payload_as(payload)?;
                ClientMessage::Command {
                    command: p.command,
                    use_pty: p.use_pty,
                }
            }
            "pty-input" => {
                let p: PtyInputPayload = payload_as(payload)?;
                ClientMessage::PtyInput { data: p.data }
            }
            "pty-resize" => {
                let p: PtyResizePayload = payload_as(payload)?;
                ClientMessage::PtyResize {
                    cols: p.cols,
                    rows: p.rows,
                }
            }
            "ping" => ClientMessage::Ping,
            other => {
                return Err(ApiError::new(ErrorCode::MalformedMessage, "Invalid message")
                    .with_details(format!("unknown message type: {other}"))
                    .into());
            }
        };
        Ok(message)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::InitSession { .. } => "init-session",
            ClientMessage::RequestWelcome => "request-welcome",
            ClientMessage::RequestFiles { .. } => "request-files",
            ClientMessage::Command { .. } => "command",
            ClientMessage::PtyInput { .. } => "pty-input",
            ClientMessage::PtyResize { .. } => "pty-resize",
            ClientMessage::Ping => "ping",
        }
    }
}

fn payload_as<T: DeserializeOwned>(payload: Value) -> RelayResult<T> {
    serde_json::from_value(payload).map_err(malformed)
}

fn malformed(err: serde_json::Error) -> crate::error::RelayError {
    ApiError::new(ErrorCode::MalformedMessage, "Invalid message")
        .with_details(err.to_string())
        .into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    Status {
        status: String,
        message: String,
    },
    SessionReady {
        session_id: String,
    },
    NewSession {},
    RestoreBuffer {
        data: String,
    },
    Welcome {
        message: String,
    },
    Output {
        data: String,
        error: String,
        exit_code: Option<i32>,
        cwd: String,
    },
    PtyOutput {
        data: String,
    },
    PtyStarted {
        session_id: String,
    },
    PtyExit {
        exit_code: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
    FileCompletion {
        prefix: String,
        files: Vec<String>,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
    Pong {},
}

impl ServerMessage {
    pub fn error(err: &crate::error::RelayError) -> Self {
        ServerMessage::Error {
            message: err.display_message(),
            code: err.code(),
        }
    }

    pub fn to_json(&self) -> RelayResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_every_client_message() {
        let cases = [
            (
                json!({"type": "init-session", "payload": {"sessionId": "s1"}}),
                ClientMessage::InitSession {
                    session_id: "s1".to_string(),
                },
            ),
            (
                json!({"type": "request-welcome", "payload": {}}),
                ClientMessage::RequestWelcome,
            ),
            (
                json!({"type": "request-files", "payload": {"prefix": "sr"}}),
                ClientMessage::RequestFiles {
                    prefix: "sr".to_string(),
                },
            ),
            (
                json!({"type": "command", "payload": {"command": "ls", "usePTY": false}}),
                ClientMessage::Command {
                    command: "ls".to_string(),
                    use_pty: false,
                },
            ),
            (
                json!({"type": "pty-input", "payload": {"data": "q"}}),
                ClientMessage::PtyInput {
                    data: "q".to_string(),
                },
            ),
            (
                json!({"type": "pty-resize", "payload": {"cols": 120, "rows": 40}}),
                ClientMessage::PtyResize {
                    cols: 120,
                    rows: 40,
                },
            ),
            (json!({"type": "ping"}), ClientMessage::Ping),
        ];
        for (raw, expected) in cases {
            let parsed = ClientMessage::parse(&raw.to_string()).expect("parse");
            assert_eq!(parsed, expected, "parsing {raw}");
        }
    }

    #[test]
    fn optional_fields_take_defaults() {
        let parsed =
            ClientMessage::parse(r#"{"type":"command","payload":{"command":"vim"}}"#).expect("parse");
        assert_eq!(
            parsed,
            ClientMessage::Command {
                command: "vim".to_string(),
                use_pty: true
            }
        );
        let parsed =
            ClientMessage::parse(r#"{"type":"request-files","payload":{"prefix":null}}"#)
                .expect("parse");
        assert_eq!(
            parsed,
            ClientMessage::RequestFiles {
                prefix: String::new()
            }
        );
        let parsed = ClientMessage::parse(r#"{"type":"request-files"}"#).expect("parse");
        assert_eq!(parsed.kind(), "request-files");
    }

    #[test]
    fn rejects_malformed_messages() {
        for raw in [
            "not json",
            r#"{"payload":{}}"#,
            r#"{"type":"shutdown","payload":{}}"#,
            r#"{"type":"init-session","payload":{}}"#,
            r#"{"type":"pty-resize","payload":{"cols":-1,"rows":10}}"#,
            r#"{"type":"command","payload":{"command":42}}"#,
        ] {
            let err = ClientMessage::parse(raw).expect_err(raw);
            assert_eq!(err.code(), ErrorCode::MalformedMessage, "{raw}");
        }
    }

    #[test]
    fn server_messages_use_tagged_camel_case_envelopes() {
        let output = ServerMessage::Output {
            data: "hi\n".to_string(),
            error: String::new(),
            exit_code: Some(0),
            cwd: "/tmp".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&output).expect("json"),
            json!({"type": "output", "payload": {"data": "hi\n", "error": "", "exitCode": 0, "cwd": "/tmp"}})
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::SessionReady {
                session_id: "s1".to_string()
            })
            .expect("json"),
            json!({"type": "session-ready", "payload": {"sessionId": "s1"}})
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::Pong {}).expect("json"),
            json!({"type": "pong", "payload": {}})
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::PtyExit {
                exit_code: 0,
                signal: None
            })
            .expect("json"),
            json!({"type": "pty-exit", "payload": {"exitCode": 0}})
        );
    }

    #[test]
    fn error_message_carries_code() {
        let err: crate::error::RelayError =
            ApiError::new(ErrorCode::Timeout, "Command timed out").into();
        assert_eq!(
            serde_json::to_value(ServerMessage::error(&err)).expect("json"),
            json!({"type": "error", "payload": {"message": "Command timed out", "code": "TIMEOUT"}})
        );
    }
}
