/// What a line of user input asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Nothing to do (blank line)
    Empty,
    /// Plain chat text, trimmed
    Text(String),
    Command(Command),
}

/// In-chat slash commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Quit,
    MicOn,
    MicOff,
    ListenOn,
    ListenOff,
    Help,
    /// `/upload <user> <path>`; the path keeps its case and inner spaces
    Upload { recipient: String, path: String },
    /// `/accept [id] [destination]`
    Accept {
        offer: Option<String>,
        destination: Option<String>,
    },
    /// `/reject [id]` or `/cancel [id]`
    Reject { offer: Option<String> },
    /// A known command with the wrong arguments; carries the usage line
    Usage(&'static str),
    /// A `/...` line we do not recognize
    Unknown(String),
}

pub const UPLOAD_USAGE: &str = "/upload <user> <path>";
pub const REJECT_USAGE: &str = "/reject [id]";

/// Classify one line. Commands are matched case-insensitively after trimming;
/// inner whitespace between words is collapsed. Arguments of the file
/// commands are kept as typed.
pub fn parse_input(line: &str) -> Input {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Input::Empty;
    }
    if !trimmed.starts_with('/') {
        return Input::Text(trimmed.to_string());
    }

    let (head, args) = match trimmed.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (trimmed, ""),
    };
    let head = head.to_lowercase();
    if matches!(head.as_str(), "/upload" | "/accept" | "/reject" | "/cancel") {
        return Input::Command(file_command(&head, args));
    }

    let normalized = trimmed
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let command = match normalized.as_str() {
        "/quit" | "/exit" | "/disconnect" => Command::Quit,
        "/mic on" => Command::MicOn,
        "/mic off" => Command::MicOff,
        "/listen on" => Command::ListenOn,
        "/listen off" => Command::ListenOff,
        "/help" => Command::Help,
        _ => Command::Unknown(trimmed.to_string()),
    };
    Input::Command(command)
}

fn file_command(head: &str, args: &str) -> Command {
    let (first, rest) = match args.split_once(char::is_whitespace) {
        Some((first, rest)) => (first, rest.trim()),
        None => (args, ""),
    };
    let first = (!first.is_empty()).then(|| first.to_string());
    let rest = (!rest.is_empty()).then(|| rest.to_string());

    match head {
        "/upload" => match (first, rest) {
            (Some(recipient), Some(path)) => Command::Upload { recipient, path },
            _ => Command::Usage(UPLOAD_USAGE),
        },
        "/accept" => Command::Accept {
            offer: first,
            destination: rest,
        },
        _ => match rest {
            None => Command::Reject { offer: first },
            Some(_) => Command::Usage(REJECT_USAGE),
        },
    }
}
