//! Parsing chat text and button callbacks into bot commands.

/// A request from the chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    List,
    Confirm {
        batch_id: String,
        project: Option<String>,
    },
    Download {
        batch_id: String,
    },
    /// Known command with missing arguments; carries the usage line.
    Usage(&'static str),
}

pub const CONFIRM_USAGE: &str = "Usage: /confirm <batchId> [project]";
pub const DOWNLOAD_USAGE: &str = "Usage: /download <batchId>";

/// Parse a `/command args…` message. Returns None for anything that isn't
/// one of ours, including commands addressed to another bot when our own
/// username is known.
pub fn parse_text(text: &str, bot_username: Option<&str>) -> Option<Command> {
    let rest = text.trim().strip_prefix('/')?;
    let mut parts = rest.split_whitespace();
    let head = parts.next()?;
    // Group chats address commands as /cmd@botname.
    let (name, addressee) = match head.split_once('@') {
        Some((name, to)) => (name, Some(to)),
        None => (head, None),
    };
    if let (Some(to), Some(me)) = (addressee, bot_username)
        && !to.eq_ignore_ascii_case(me)
    {
        return None;
    }
    let name = name.to_lowercase();
    let args: Vec<&str> = parts.collect();

    let cmd = match name.as_str() {
        "start" | "help" => Command::Help,
        "list" => Command::List,
        "confirm" => match args.as_slice() {
            [] => Command::Usage(CONFIRM_USAGE),
            [id] => Command::Confirm {
                batch_id: id.to_string(),
                project: None,
            },
            [id, project, ..] => Command::Confirm {
                batch_id: id.to_string(),
                project: Some(project.to_string()),
            },
        },
        "download" => match args.first() {
            Some(id) => Command::Download {
                batch_id: id.to_string(),
            },
            None => Command::Usage(DOWNLOAD_USAGE),
        },
        _ => return None,
    };
    Some(cmd)
}

/// Parse inline-button data (`confirm:<id>` / `download:<id>`).
pub fn parse_callback(data: &str) -> Option<Command> {
    let (action, id) = data.split_once(':')?;
    let id = id.trim();
    if id.is_empty() {
        return None;
    }
    match action {
        "confirm" => Some(Command::Confirm {
            batch_id: id.to_string(),
            project: None,
        }),
        "download" => Some(Command::Download {
            batch_id: id.to_string(),
        }),
        _ => None,
    }
}

pub fn confirm_callback(batch_id: &str) -> String {
    format!("confirm:{batch_id}")
}

pub fn download_callback(batch_id: &str) -> String {
    format!("download:{batch_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_text("/start", None), Some(Command::Help));
        assert_eq!(parse_text("/help", None), Some(Command::Help));
        assert_eq!(parse_text("  /LIST  ", None), Some(Command::List));
        assert_eq!(
            parse_text("/confirm b1", None),
            Some(Command::Confirm {
                batch_id: "b1".into(),
                project: None
            })
        );
        assert_eq!(
            parse_text("/confirm@ApkForge_Bot b1 DEMO", Some("apkforge_bot")),
            Some(Command::Confirm {
                batch_id: "b1".into(),
                project: Some("DEMO".into())
            })
        );
        assert_eq!(
            parse_text("/download b9", None),
            Some(Command::Download {
                batch_id: "b9".into()
            })
        );
    }

    #[test]
    fn missing_arguments_give_usage() {
        assert_eq!(parse_text("/confirm", None), Some(Command::Usage(CONFIRM_USAGE)));
        assert_eq!(parse_text("/download ", None), Some(Command::Usage(DOWNLOAD_USAGE)));
    }

    #[test]
    fn ignores_other_text() {
        assert_eq!(parse_text("hello", None), None);
        assert_eq!(parse_text("/deploy now", None), None);
        assert_eq!(parse_text("/", None), None);
    }

    #[test]
    fn commands_for_other_bots_are_ignored() {
        assert_eq!(parse_text("/confirm@other_bot b1", Some("apkforge_bot")), None);
        assert_eq!(parse_text("/list@other_bot", Some("apkforge_bot")), None);
        assert_eq!(parse_text("/list@apkforge_bot", Some("apkforge_bot")), Some(Command::List));
        assert_eq!(parse_text("/list", Some("apkforge_bot")), Some(Command::List));
    }

    #[test]
    fn callbacks_roundtrip() {
        assert_eq!(
            parse_callback(&confirm_callback("b1")),
            Some(Command::Confirm {
                batch_id: "b1".into(),
                project: None
            })
        );
        assert_eq!(
            parse_callback(&download_callback("b2")),
            Some(Command::Download {
                batch_id: "b2".into()
            })
        );
        assert_eq!(parse_callback("confirm:"), None);
        assert_eq!(parse_callback("delete:b1"), None);
        assert_eq!(parse_callback("garbage"), None);
    }
}
