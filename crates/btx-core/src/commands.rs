//! Chat command routing for the bot surface.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// What kind of answer the language model is asked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    Predict,
    Analyze,
    General,
}

impl QueryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryKind::Predict => "predict",
            QueryKind::Analyze => "analyze",
            QueryKind::General => "general",
        }
    }

    /// Notice sent while the model call is in flight.
    pub fn progress_notice(self) -> &'static str {
        match self {
            QueryKind::Predict => "🔄 Analyzing match data...",
            QueryKind::Analyze => "📊 Gathering statistical data...",
            QueryKind::General => "🤔 Thinking...",
        }
    }

    pub fn usage(self) -> &'static str {
        match self {
            QueryKind::Predict => "Usage: /predict [match]",
            QueryKind::Analyze => "Usage: /analyze [team/player]",
            QueryKind::General => "Send me a question about a match, team or player.",
        }
    }

    /// Wrap a model answer for delivery (Markdown).
    pub fn format_reply(self, body: &str) -> String {
        match self {
            QueryKind::Predict => format!("🎯 *Match Prediction*\n\n{body}"),
            QueryKind::Analyze => format!("📈 *Statistical Analysis*\n\n{body}"),
            QueryKind::General => body.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Query { kind: QueryKind, text: String },
    /// `/predict` or `/analyze` without an argument.
    MissingArgument { kind: QueryKind },
    Unknown { name: String },
    Empty,
}

impl Command {
    /// First token of the message, used as the `command` activity field.
    pub fn label(&self) -> String {
        match self {
            Command::Start => "/start".to_string(),
            Command::Help => "/help".to_string(),
            Command::Query {
                kind: QueryKind::General,
                ..
            } => "text".to_string(),
            Command::Query { kind, .. } | Command::MissingArgument { kind } => {
                format!("/{}", kind.as_str())
            }
            Command::Unknown { name } => format!("/{name}"),
            Command::Empty => String::new(),
        }
    }
}

pub const WELCOME_TEXT: &str = "Welcome to BETRIX AI! 🚀\n\n\
I'm your AI-powered betting assistant. Use these commands:\n\n\
- /predict [match] - Get AI prediction\n\
- /analyze [team/player] - Statistical analysis\n\n\
Send /help to see all commands.";

pub const HELP_TEXT: &str = "🤖 *BETRIX AI Commands*\n\n\
/start - Start the bot\n\
/predict [match] - Get AI prediction\n\
/analyze [team/player] - Statistical analysis\n\
/help - Show this help message";

pub const RATE_LIMITED_TEXT: &str =
    "⚠️ Rate limit exceeded. Please wait a moment before sending more messages.";

pub const ERROR_TEXT: &str =
    "⚠️ Sorry, I encountered an error processing your request. Please try again.";

pub const AI_UNAVAILABLE_TEXT: &str =
    "⚠️ AI service temporarily unavailable. Please try again later.";

fn command_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // `/name`, optional `@botname`, optional argument (may span lines).
        Regex::new(r"(?s)^/([A-Za-z0-9_]+)(?:@[A-Za-z0-9_]+)?(?:\s+(.*))?$")
            .expect("command pattern is valid")
    })
}

pub fn parse_command(text: &str) -> Command {
    let text = text.trim();
    if text.is_empty() {
        return Command::Empty;
    }
    if !text.starts_with('/') {
        return Command::Query {
            kind: QueryKind::General,
            text: text.to_string(),
        };
    }

    let Some(caps) = command_re().captures(text) else {
        return Command::Unknown {
            name: text.trim_start_matches('/').to_string(),
        };
    };
    let name = caps
        .get(1)
        .map(|m| m.as_str().to_lowercase())
        .unwrap_or_default();
    let arg = caps
        .get(2)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty());

    let kind = match name.as_str() {
        "start" => return Command::Start,
        "help" => return Command::Help,
        "predict" => QueryKind::Predict,
        "analyze" => QueryKind::Analyze,
        _ => return Command::Unknown { name },
    };

    match arg {
        Some(text) => Command::Query { kind, text },
        None => Command::MissingArgument { kind },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_static_commands() {
        assert_eq!(parse_command("/start"), Command::Start);
        assert_eq!(parse_command(" /help "), Command::Help);
        assert_eq!(parse_command("/start@BetrixBot"), Command::Start);
    }

    #[test]
    fn parses_queries_with_arguments() {
        assert_eq!(
            parse_command("/predict Arsenal vs Chelsea"),
            Command::Query {
                kind: QueryKind::Predict,
                text: "Arsenal vs Chelsea".to_string()
            }
        );
        assert_eq!(
            parse_command("/analyze@BetrixBot Messi\nlast 5 games"),
            Command::Query {
                kind: QueryKind::Analyze,
                text: "Messi\nlast 5 games".to_string()
            }
        );
        assert_eq!(
            parse_command("/predict"),
            Command::MissingArgument {
                kind: QueryKind::Predict
            }
        );
    }

    #[test]
    fn plain_text_and_unknowns() {
        assert_eq!(
            parse_command("who wins tonight?"),
            Command::Query {
                kind: QueryKind::General,
                text: "who wins tonight?".to_string()
            }
        );
        assert_eq!(
            parse_command("/status"),
            Command::Unknown {
                name: "status".to_string()
            }
        );
        assert_eq!(parse_command("   "), Command::Empty);
        assert_eq!(parse_command("/predict x").label(), "/predict");
    }
}
