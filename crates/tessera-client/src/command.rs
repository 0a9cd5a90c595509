//! Interactive command parsing.

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Connect(String),
    Msg { to: String, text: String },
    Cert(String),
    Help,
    Quit,
}

pub const HELP: &str = "\
/list               show who is online
/connect <id>       start an encrypted session with <id>
/msg <id> <text>    send <text> to <id>
/cert <id>          fetch and verify <id>'s certificate
/quit               exit";

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (verb, rest) = line
            .split_once(char::is_whitespace)
            .map(|(verb, rest)| (verb, rest.trim()))
            .unwrap_or((line, ""));

        let single = |usage: &str| -> Result<String, String> {
            match rest.split_whitespace().collect::<Vec<_>>().as_slice() {
                [id] => Ok(id.to_string()),
                _ => Err(format!("usage: {usage}")),
            }
        };

        match verb {
            "/list" => Ok(Self::List),
            "/connect" => single("/connect <id>").map(Self::Connect),
            "/cert" => single("/cert <id>").map(Self::Cert),
            "/msg" => match rest.split_once(char::is_whitespace) {
                Some((to, text)) if !text.trim().is_empty() => Ok(Self::Msg {
                    to: to.to_string(),
                    text: text.trim().to_string(),
                }),
                _ => Err("usage: /msg <id> <text>".into()),
            },
            "/help" => Ok(Self::Help),
            "/quit" | "/exit" => Ok(Self::Quit),
            "" => Err("empty command".into()),
            other => Err(format!("unknown command {other}; try /help")),
        }
    }
}
