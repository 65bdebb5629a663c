//! The tagged command grammar spoken by clients: a request is a positional
//! sequence of `<name>` and `<name>payload</name>` tokens. This is a
//! dedicated little parser, not a markup library; the grammar is exactly
//! what the dispatcher needs and nothing more.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("closing tag </{0}> without a matching opening tag")]
    UnmatchedClose(String),

    #[error("unterminated tag near {0:?}")]
    UnterminatedTag(String),

    #[error("empty tag")]
    EmptyTag,
}

/// Commands the dispatcher recognises. Tags with any other name are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandName {
    Init,
    TrigPulse,
    Store,
    GetSettings,
    QueryDataLength,
}

impl CommandName {
    fn from_tag(name: &str) -> Option<Self> {
        match name {
            "init" => Some(Self::Init),
            "trig_pulse" => Some(Self::TrigPulse),
            "store" => Some(Self::Store),
            "get_settings" => Some(Self::GetSettings),
            "query_data_length" => Some(Self::QueryDataLength),
            _ => None,
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::TrigPulse => "trig_pulse",
            Self::Store => "store",
            Self::GetSettings => "get_settings",
            Self::QueryDataLength => "query_data_length",
        };
        f.write_str(name)
    }
}

/// One recognised command with its optional payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: CommandName,
    pub payload: Option<String>,
}

/// One positional element of a parsed request: either a command to run or a
/// malformed tag to report. Errors do not abort the rest of the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestItem {
    Command(Command),
    Malformed(ProtocolError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token<'a> {
    Open(&'a str),
    Close(&'a str),
    Content(&'a str),
    Unterminated(&'a str),
}

fn tokenize(input: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut rest = input;
    while !rest.is_empty() {
        match rest.find('<') {
            None => {
                push_content(&mut tokens, rest);
                break;
            }
            Some(start) => {
                push_content(&mut tokens, &rest[..start]);
                let after = &rest[start + 1..];
                match after.find('>') {
                    None => {
                        tokens.push(Token::Unterminated(&rest[start..]));
                        break;
                    }
                    Some(end) => {
                        let name = &after[..end];
                        if let Some(name) = name.strip_prefix('/') {
                            tokens.push(Token::Close(name));
                        } else {
                            tokens.push(Token::Open(name));
                        }
                        rest = &after[end + 1..];
                    }
                }
            }
        }
    }
    tokens
}

fn push_content<'a>(tokens: &mut Vec<Token<'a>>, text: &'a str) {
    // Whitespace between tags is separator, not payload.
    if !text.trim().is_empty() {
        tokens.push(Token::Content(text));
    }
}

/// Parse one request into its positional items. A tag receives a payload iff
/// the opening tag is immediately followed by exactly one content token and a
/// matching closing tag; any other shape invokes it bare. Unknown tag names
/// are dropped silently; unmatched or unterminated tags become
/// [`RequestItem::Malformed`] entries without stopping the parse.
pub fn parse_request(input: &str) -> Vec<RequestItem> {
    let tokens = tokenize(input);
    let mut items = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        match &tokens[i] {
            Token::Open(name) => {
                let mut payload = None;
                let mut consumed = 1;
                match (tokens.get(i + 1), tokens.get(i + 2)) {
                    (Some(Token::Content(text)), Some(Token::Close(close))) if close == name => {
                        payload = Some((*text).to_string());
                        consumed = 3;
                    }
                    (Some(Token::Close(close)), _) if close == name => {
                        consumed = 2;
                    }
                    _ => {}
                }
                if name.is_empty() {
                    items.push(RequestItem::Malformed(ProtocolError::EmptyTag));
                } else if let Some(command) = CommandName::from_tag(name) {
                    items.push(RequestItem::Command(Command {
                        name: command,
                        payload,
                    }));
                } else {
                    log::debug!("ignoring unknown tag <{}>", name);
                }
                i += consumed;
            }
            Token::Close(name) => {
                items.push(RequestItem::Malformed(ProtocolError::UnmatchedClose(
                    (*name).to_string(),
                )));
                i += 1;
            }
            Token::Content(_) => {
                // Stray content outside a tag pair carries no meaning.
                i += 1;
            }
            Token::Unterminated(text) => {
                let snippet: String = text.chars().take(16).collect();
                items.push(RequestItem::Malformed(ProtocolError::UnterminatedTag(
                    snippet,
                )));
                i += 1;
            }
        }
    }
    items
}
