//! Coordinator script parser.
//!
//! Grammar, informally:
//!
//! ```text
//! script  := command (operator command)*
//! command := name option-block? prompt?
//! name    := [A-Za-z0-9_-]+
//! option-block := '[' k ':' v (',' (k ':' v | v))* ']'
//! prompt  := '...' | "..."
//! operator := '&&' | '&'
//! ```
//!
//! `&` binds tighter than `&&`: the script splits into groups at every
//! `&&` boundary, and commands joined by `&` inside a group run in
//! parallel. Quote styles are mutually escape-safe: a single-quoted prompt
//! may contain double quotes and vice versa.
//!
//! Recognised option keys: `input` (repeatable, comma-separated paths),
//! `tail` (line count), `engine`, `model`, `timeout` (milliseconds).
//! Anything else is an [`InvalidCommandSyntax`] error.
//!
//! [`InvalidCommandSyntax`]: crate::error::WorkflowError::InvalidCommandSyntax

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};

/// Execution mode of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupMode {
    /// Commands run concurrently; the group completes when all finish.
    Parallel,
    /// Commands run in declaration order.
    Sequential,
}

/// One parsed command: an agent name, its prompt, and per-command options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Agent name.
    pub name: String,
    /// Prompt text, when given.
    pub prompt: Option<String>,
    /// Context files appended to the prompt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<String>,
    /// Only the last `tail` lines of each input file are used.
    pub tail: Option<u64>,
    /// Engine override for this command.
    pub engine: Option<String>,
    /// Model override for this command.
    pub model: Option<String>,
    /// Per-command timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl Command {
    fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    fn has_options(&self) -> bool {
        !self.input.is_empty()
            || self.tail.is_some()
            || self.engine.is_some()
            || self.model.is_some()
            || self.timeout_ms.is_some()
    }
}

/// A run of commands sharing one execution mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// How the commands run.
    pub mode: GroupMode,
    /// The commands, in declaration order.
    pub commands: Vec<Command>,
}

/// An ordered list of groups; groups always run strictly in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorPlan {
    /// The groups, split at every `&&` boundary of the script.
    pub groups: Vec<Group>,
}

impl CoordinatorPlan {
    /// Total command count across groups.
    #[must_use]
    pub fn command_count(&self) -> usize {
        self.groups.iter().map(|g| g.commands.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// Canonical form
// ---------------------------------------------------------------------------

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if self.has_options() {
            let mut opts: Vec<String> = Vec::new();
            if !self.input.is_empty() {
                opts.push(format!("input:{}", self.input.join(",")));
            }
            if let Some(tail) = self.tail {
                opts.push(format!("tail:{tail}"));
            }
            if let Some(engine) = &self.engine {
                opts.push(format!("engine:{engine}"));
            }
            if let Some(model) = &self.model {
                opts.push(format!("model:{model}"));
            }
            if let Some(timeout) = self.timeout_ms {
                opts.push(format!("timeout:{timeout}"));
            }
            write!(f, "[{}]", opts.join(","))?;
        }
        if let Some(prompt) = &self.prompt {
            if prompt.contains('\'') {
                write!(f, " \"{prompt}\"")?;
            } else {
                write!(f, " '{prompt}'")?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.commands.iter().map(ToString::to_string).collect();
        write!(f, "{}", rendered.join(" & "))
    }
}

impl fmt::Display for CoordinatorPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.groups.iter().map(ToString::to_string).collect();
        write!(f, "{}", rendered.join(" && "))
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    OptionBlock(String),
    Quoted(String),
    And,      // &&
    Parallel, // &
}

fn syntax_error(message: impl Into<String>) -> crate::error::Error {
    WorkflowError::InvalidCommandSyntax(message.into()).into()
}

fn tokenize(script: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = script.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    tokens.push(Token::Parallel);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut end = None;
                for (offset, ch) in chars[start..].iter().enumerate() {
                    if *ch == quote {
                        end = Some(start + offset);
                        break;
                    }
                }
                let end = end.ok_or_else(|| syntax_error("unterminated quoted prompt"))?;
                tokens.push(Token::Quoted(chars[start..end].iter().collect()));
                i = end + 1;
            }
            '[' => {
                let start = i + 1;
                let mut end = None;
                for (offset, ch) in chars[start..].iter().enumerate() {
                    if *ch == ']' {
                        end = Some(start + offset);
                        break;
                    }
                }
                let end = end.ok_or_else(|| syntax_error("unterminated option block"))?;
                tokens.push(Token::OptionBlock(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if is_ident_char(c) => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(syntax_error(format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parses a coordinator script into its plan.
pub fn parse_script(script: &str) -> Result<CoordinatorPlan> {
    let tokens = tokenize(script)?;
    if tokens.is_empty() {
        return Err(syntax_error("empty coordinator script"));
    }

    let mut groups: Vec<Group> = Vec::new();
    let mut current: Vec<Command> = Vec::new();
    let mut i = 0;

    loop {
        // One command: ident, then optional option block, then optional prompt.
        let name = match tokens.get(i) {
            Some(Token::Ident(name)) => name.clone(),
            Some(Token::And | Token::Parallel) => {
                return Err(syntax_error("operator without a command before it"));
            }
            Some(_) => return Err(syntax_error("expected an agent name")),
            None => return Err(syntax_error("trailing operator without a command")),
        };
        i += 1;

        let mut command = Command::named(name);
        if let Some(Token::OptionBlock(block)) = tokens.get(i) {
            apply_options(&mut command, block)?;
            i += 1;
        }
        if let Some(Token::Quoted(prompt)) = tokens.get(i) {
            command.prompt = Some(prompt.clone());
            i += 1;
        }
        current.push(command);

        match tokens.get(i) {
            Some(Token::And) => {
                groups.push(close_group(std::mem::take(&mut current)));
                i += 1;
            }
            Some(Token::Parallel) => {
                i += 1;
            }
            Some(_) => return Err(syntax_error("expected '&&' or '&' between commands")),
            None => break,
        }
    }

    groups.push(close_group(current));
    Ok(CoordinatorPlan { groups })
}

fn close_group(commands: Vec<Command>) -> Group {
    let mode = if commands.len() > 1 {
        GroupMode::Parallel
    } else {
        GroupMode::Sequential
    };
    Group { mode, commands }
}

/// Applies one bracketed option block to `command`.
///
/// The block is comma-separated; a segment containing `:` starts a new
/// key, a bare segment extends the previous `input` list
/// (`input:a.md,b.md` ≡ `input:a.md,input:b.md`).
fn apply_options(command: &mut Command, block: &str) -> Result<()> {
    let mut last_key: Option<String> = None;

    for segment in block.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }

        let (key, value) = match segment.split_once(':') {
            Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
            None => match last_key.as_deref() {
                Some("input") => ("input".to_string(), segment.to_string()),
                _ => {
                    return Err(syntax_error(format!(
                        "option segment '{segment}' has no key"
                    )));
                }
            },
        };

        match key.as_str() {
            "input" => command.input.push(value),
            "tail" => {
                command.tail = Some(value.parse().map_err(|_| {
                    syntax_error(format!("tail must be an integer, got '{value}'"))
                })?);
            }
            "engine" => command.engine = Some(value),
            "model" => command.model = Some(value),
            "timeout" => {
                command.timeout_ms = Some(value.parse().map_err(|_| {
                    syntax_error(format!("timeout must be milliseconds, got '{value}'"))
                })?);
            }
            other => {
                return Err(syntax_error(format!("unknown option key '{other}'")));
            }
        }
        last_key = Some(key);
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    mod shapes {
        use super::*;

        #[test]
        fn sequential_and_parallel_groups() {
            let plan = parse_script("prep 'setup' && w1 'a' & w2 'b' && done").unwrap();
            assert_eq!(plan.groups.len(), 3);

            assert_eq!(plan.groups[0].mode, GroupMode::Sequential);
            assert_eq!(plan.groups[0].commands[0].name, "prep");
            assert_eq!(plan.groups[0].commands[0].prompt.as_deref(), Some("setup"));

            assert_eq!(plan.groups[1].mode, GroupMode::Parallel);
            let names: Vec<_> = plan.groups[1]
                .commands
                .iter()
                .map(|c| c.name.as_str())
                .collect();
            assert_eq!(names, vec!["w1", "w2"]);

            assert_eq!(plan.groups[2].mode, GroupMode::Sequential);
            assert_eq!(plan.groups[2].commands[0].name, "done");
            assert_eq!(plan.groups[2].commands[0].prompt, None);
        }

        #[test]
        fn single_command() {
            let plan = parse_script("solo 'just me'").unwrap();
            assert_eq!(plan.groups.len(), 1);
            assert_eq!(plan.groups[0].mode, GroupMode::Sequential);
            assert_eq!(plan.command_count(), 1);
        }

        #[test]
        fn three_way_parallel() {
            let plan = parse_script("a 'p1' & b 'p2' & c 'p3'").unwrap();
            assert_eq!(plan.groups.len(), 1);
            assert_eq!(plan.groups[0].mode, GroupMode::Parallel);
            assert_eq!(plan.groups[0].commands.len(), 3);
        }

        #[test]
        fn parallel_binds_tighter_than_sequential() {
            let plan = parse_script("a 'x' & b 'y' && c 'z'").unwrap();
            assert_eq!(plan.groups.len(), 2);
            assert_eq!(plan.groups[0].commands.len(), 2);
            assert_eq!(plan.groups[1].commands.len(), 1);
        }
    }

    mod options {
        use super::*;

        #[test]
        fn option_block_with_list_and_int() {
            let plan = parse_script("agent[input:file.md,tail:100] 'go'").unwrap();
            let command = &plan.groups[0].commands[0];
            assert_eq!(command.input, vec!["file.md"]);
            assert_eq!(command.tail, Some(100));
            assert_eq!(command.prompt.as_deref(), Some("go"));
        }

        #[test]
        fn input_list_extends_across_commas() {
            let plan = parse_script("agent[input:a.md,b.md,tail:5] 'go'").unwrap();
            let command = &plan.groups[0].commands[0];
            assert_eq!(command.input, vec!["a.md", "b.md"]);
            assert_eq!(command.tail, Some(5));
        }

        #[test]
        fn repeated_input_keys_accumulate() {
            let plan = parse_script("agent[input:a.md,input:b.md] 'go'").unwrap();
            assert_eq!(plan.groups[0].commands[0].input, vec!["a.md", "b.md"]);
        }

        #[test]
        fn engine_model_timeout() {
            let plan =
                parse_script("agent[engine:claude,model:claude-opus-4-1,timeout:30000] 'go'")
                    .unwrap();
            let command = &plan.groups[0].commands[0];
            assert_eq!(command.engine.as_deref(), Some("claude"));
            assert_eq!(command.model.as_deref(), Some("claude-opus-4-1"));
            assert_eq!(command.timeout_ms, Some(30_000));
        }

        #[test]
        fn unknown_key_is_rejected() {
            let err = parse_script("agent[color:red] 'go'").unwrap_err();
            assert_eq!(err.code(), "workflow.invalid_command_syntax");
        }

        #[test]
        fn non_numeric_tail_is_rejected() {
            let err = parse_script("agent[tail:lots] 'go'").unwrap_err();
            assert_eq!(err.code(), "workflow.invalid_command_syntax");
        }
    }

    mod quoting {
        use super::*;

        #[test]
        fn double_quotes_hold_single_quotes() {
            let plan = parse_script(r#"agent "don't stop""#).unwrap();
            assert_eq!(
                plan.groups[0].commands[0].prompt.as_deref(),
                Some("don't stop")
            );
        }

        #[test]
        fn single_quotes_hold_double_quotes() {
            let plan = parse_script(r#"agent 'say "hi" loudly'"#).unwrap();
            assert_eq!(
                plan.groups[0].commands[0].prompt.as_deref(),
                Some(r#"say "hi" loudly"#)
            );
        }

        #[test]
        fn unterminated_prompt_is_rejected() {
            let err = parse_script("agent 'oops").unwrap_err();
            assert_eq!(err.code(), "workflow.invalid_command_syntax");
        }
    }

    mod rejects {
        use super::*;

        #[test]
        fn empty_script() {
            assert!(parse_script("").is_err());
            assert!(parse_script("   ").is_err());
        }

        #[test]
        fn leading_operator() {
            assert!(parse_script("&& agent 'x'").is_err());
        }

        #[test]
        fn trailing_operator() {
            assert!(parse_script("agent 'x' &&").is_err());
        }

        #[test]
        fn doubled_operator() {
            assert!(parse_script("a 'x' && & b 'y'").is_err());
        }

        #[test]
        fn prompt_without_name() {
            assert!(parse_script("'floating prompt'").is_err());
        }
    }

    mod round_trip {
        use super::*;

        fn assert_round_trips(script: &str) {
            let plan = parse_script(script).unwrap();
            let canonical = plan.to_string();
            let reparsed = parse_script(&canonical).unwrap();
            assert_eq!(reparsed, plan, "canonical form {canonical:?} diverged");
        }

        #[test]
        fn canonical_form_reparses_identically() {
            for script in [
                "prep 'setup' && w1 'a' & w2 'b' && done",
                "agent[input:file.md,tail:100] 'go'",
                "a[engine:claude,model:m,timeout:1000] 'x' & b 'y'",
                r#"agent "don't stop""#,
                "bare-name",
                "x[input:a.md,input:b.md,tail:3] 'p' && y 'q'",
            ] {
                assert_round_trips(script);
            }
        }

        #[test]
        fn canonical_form_is_stable() {
            let plan = parse_script("agent[tail:2,input:f.md] 'go'").unwrap();
            // canonical option order: input first
            assert_eq!(plan.to_string(), "agent[input:f.md,tail:2] 'go'");
            assert_round_trips(&plan.to_string());
        }
    }
}
