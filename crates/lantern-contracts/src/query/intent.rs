use std::collections::BTreeMap;

use serde_json::Value;

use super::commands::{CommandSpec, NO_ARG_COMMANDS, RAW_ARG_COMMANDS, SINGLE_PATH_COMMANDS};

/// A REPL command with its parsed arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandInvocation {
    pub action: String,
    pub raw: String,
    pub args: BTreeMap<String, Value>,
}

impl CommandInvocation {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            args: BTreeMap::new(),
        }
    }
}

/// What a line of user input asks for. The leading `@` sentinel selects
/// image generation; a leading `/` selects a command; any other non-empty
/// text is a search question.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryIntent {
    Noop,
    Search { question: String },
    GenerateImage { prompt: String },
    Command(CommandInvocation),
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn parse_path_arg(arg: &str) -> String {
    if arg.trim().is_empty() {
        return String::new();
    }
    let parts = match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect::<Vec<String>>(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .collect::<Vec<String>>(),
    };
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        _ => parts.join(" "),
    }
}

pub fn parse_intent(text: &str) -> QueryIntent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return QueryIntent::Noop;
    }

    if let Some(image_tail) = raw_trimmed.strip_prefix('@') {
        return QueryIntent::GenerateImage {
            prompt: image_tail.trim().to_string(),
        };
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let remainder = &slash_tail[command_len..];
            let arg = if remainder.is_empty() {
                ""
            } else {
                remainder.trim()
            };

            if let Some(action) = find_action(&command, RAW_ARG_COMMANDS) {
                let mut invocation = CommandInvocation::new(action, text);
                invocation
                    .args
                    .insert("model".to_string(), Value::String(arg.to_string()));
                return QueryIntent::Command(invocation);
            }

            if let Some(action) = find_action(&command, SINGLE_PATH_COMMANDS) {
                let mut invocation = CommandInvocation::new(action, text);
                invocation
                    .args
                    .insert("path".to_string(), Value::String(parse_path_arg(arg)));
                return QueryIntent::Command(invocation);
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return QueryIntent::Command(CommandInvocation::new(action, text));
            }

            let mut invocation = CommandInvocation::new("unknown", text);
            invocation
                .args
                .insert("command".to_string(), Value::String(command));
            invocation
                .args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return QueryIntent::Command(invocation);
        }
    }

    QueryIntent::Search {
        question: raw_trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{parse_intent, QueryIntent};

    #[test]
    fn empty_input_is_noop() {
        assert_eq!(parse_intent(""), QueryIntent::Noop);
        assert_eq!(parse_intent("   \t  "), QueryIntent::Noop);
    }

    #[test]
    fn plain_text_is_a_search_question() {
        let intent = parse_intent("  what is the capital of portugal?  ");
        assert_eq!(
            intent,
            QueryIntent::Search {
                question: "what is the capital of portugal?".to_string()
            }
        );
    }

    #[test]
    fn at_sentinel_selects_image_generation() {
        let intent = parse_intent("@ a lighthouse at dusk ");
        assert_eq!(
            intent,
            QueryIntent::GenerateImage {
                prompt: "a lighthouse at dusk".to_string()
            }
        );
    }

    #[test]
    fn bare_sentinel_keeps_an_empty_prompt() {
        // The engine rejects it; parsing stays total.
        assert_eq!(
            parse_intent("@  "),
            QueryIntent::GenerateImage {
                prompt: String::new()
            }
        );
    }

    #[test]
    fn parse_analyze_quoted_path() {
        let QueryIntent::Command(invocation) = parse_intent("/analyze \"/tmp/a b.png\"") else {
            panic!("expected a command");
        };
        assert_eq!(invocation.action, "analyze");
        assert_eq!(invocation.args["path"], json!("/tmp/a b.png"));
    }

    #[test]
    fn parse_model_commands() {
        let QueryIntent::Command(text_model) = parse_intent("/text_model my-model") else {
            panic!("expected a command");
        };
        assert_eq!(text_model.action, "set_text_model");
        assert_eq!(text_model.args["model"], json!("my-model"));

        let QueryIntent::Command(image_model) = parse_intent("/image_model other-model") else {
            panic!("expected a command");
        };
        assert_eq!(image_model.action, "set_image_model");
        assert_eq!(image_model.args["model"], json!("other-model"));
    }

    #[test]
    fn parse_no_arg_commands() {
        for (line, action) in [
            ("/help", "help"),
            ("/reset", "reset"),
            ("/voice", "voice_start"),
            ("/voice_stop", "voice_stop"),
            ("/send", "send"),
            ("/quit", "quit"),
        ] {
            let QueryIntent::Command(invocation) = parse_intent(line) else {
                panic!("expected a command for {line}");
            };
            assert_eq!(invocation.action, action, "for {line}");
        }
    }

    #[test]
    fn parse_unknown_command() {
        let QueryIntent::Command(invocation) = parse_intent("/magic foo bar") else {
            panic!("expected a command");
        };
        assert_eq!(invocation.action, "unknown");
        assert_eq!(invocation.args["command"], json!("magic"));
        assert_eq!(invocation.args["arg"], json!("foo bar"));
    }

    #[test]
    fn slash_without_command_name_is_a_search() {
        assert_eq!(
            parse_intent("/ what?"),
            QueryIntent::Search {
                question: "/ what?".to_string()
            }
        );
    }
}
