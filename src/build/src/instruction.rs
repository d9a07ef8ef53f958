//! Stratafile parser.
//!
//! Parses a Dockerfile-like instruction list into typed build steps.
//! Supports line continuations (`\`), comments, and both shell and JSON
//! (exec) forms for RUN/CMD/ENTRYPOINT.
//!
//! RUN and COPY capture the working directory and environment in effect at
//! their line, so every instruction is self-contained and its canonical form
//! alone determines what the step does.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde_json::json;
use strata_core::error::{BuildError, Result};

use crate::snapshot::join_image_path;

/// A single build instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// `FROM <reference>`
    ImportBase { reference: String },
    /// `RUN [--no-cache] <command>`
    RunCommand {
        argv: Vec<String>,
        working_dir: String,
        env: BTreeMap<String, String>,
        /// Force a cache miss for this step even when a record exists
        no_cache: bool,
    },
    /// `COPY <src>... <dst>`
    CopyContext { sources: Vec<String>, dest: String },
    /// `ENV <key>=<value>` or `ENV <key> <value>`
    SetEnv { key: String, value: String },
    /// `ENTRYPOINT ["exec", "form"]` or `ENTRYPOINT command`
    SetEntrypoint { argv: Vec<String> },
    /// `WORKDIR <path>`
    SetWorkdir { path: String },
    /// `CMD ["exec", "form"]` or `CMD command`
    SetCmd { argv: Vec<String> },
    /// `LABEL <key>=<value>`
    SetLabel { key: String, value: String },
}

impl Instruction {
    /// Deterministic serialization used as the cache key component.
    ///
    /// Independent of source formatting and comments; sensitive to every
    /// semantic argument. The per-step no-cache flag is excluded so that
    /// dropping the flag can reuse the last recorded result.
    pub fn canonical_form(&self) -> String {
        let (keyword, args) = match self {
            Instruction::ImportBase { reference } => ("FROM", json!({ "reference": reference })),
            Instruction::RunCommand {
                argv,
                working_dir,
                env,
                ..
            } => (
                "RUN",
                json!({ "argv": argv, "env": env, "workdir": working_dir }),
            ),
            Instruction::CopyContext { sources, dest } => {
                ("COPY", json!({ "dest": dest, "sources": sources }))
            }
            Instruction::SetEnv { key, value } => ("ENV", json!({ "key": key, "value": value })),
            Instruction::SetEntrypoint { argv } => ("ENTRYPOINT", json!({ "argv": argv })),
            Instruction::SetWorkdir { path } => ("WORKDIR", json!({ "path": path })),
            Instruction::SetCmd { argv } => ("CMD", json!({ "argv": argv })),
            Instruction::SetLabel { key, value } => {
                ("LABEL", json!({ "key": key, "value": value }))
            }
        };
        format!("{} {}", keyword, args)
    }

    /// Whether a recorded result for this step may be reused.
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, Instruction::RunCommand { no_cache: true, .. })
    }

    /// Directive keyword.
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::ImportBase { .. } => "FROM",
            Instruction::RunCommand { .. } => "RUN",
            Instruction::CopyContext { .. } => "COPY",
            Instruction::SetEnv { .. } => "ENV",
            Instruction::SetEntrypoint { .. } => "ENTRYPOINT",
            Instruction::SetWorkdir { .. } => "WORKDIR",
            Instruction::SetCmd { .. } => "CMD",
            Instruction::SetLabel { .. } => "LABEL",
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::ImportBase { reference } => write!(f, "FROM {}", reference),
            Instruction::RunCommand { argv, no_cache, .. } => {
                let flag = if *no_cache { "--no-cache " } else { "" };
                match argv.as_slice() {
                    [sh, c, script] if sh == "/bin/sh" && c == "-c" => {
                        write!(f, "RUN {}{}", flag, script)
                    }
                    _ => write!(f, "RUN {}{:?}", flag, argv),
                }
            }
            Instruction::CopyContext { sources, dest } => {
                write!(f, "COPY {} {}", sources.join(" "), dest)
            }
            Instruction::SetEnv { key, value } => write!(f, "ENV {}={}", key, value),
            Instruction::SetEntrypoint { argv } => write!(f, "ENTRYPOINT {:?}", argv),
            Instruction::SetWorkdir { path } => write!(f, "WORKDIR {}", path),
            Instruction::SetCmd { argv } => write!(f, "CMD {:?}", argv),
            Instruction::SetLabel { key, value } => write!(f, "LABEL {}={}", key, value),
        }
    }
}

/// Parsed instruction list, in order.
#[derive(Debug, Clone)]
pub struct Buildfile {
    pub instructions: Vec<Instruction>,
}

impl Buildfile {
    /// Parse an instruction list from its text content.
    pub fn parse(content: &str) -> Result<Self> {
        let mut parser = Parser::default();
        for (line_num, line) in join_continuation_lines(content) {
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            parser.parse_line(trimmed, line_num)?;
        }

        if parser.instructions.is_empty() {
            return Err(BuildError::Parse {
                line: 0,
                message: "instruction list is empty".to_string(),
            });
        }

        Ok(Buildfile {
            instructions: parser.instructions,
        })
    }

    /// Parse an instruction list from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| BuildError::Parse {
            line: 0,
            message: format!("Failed to read {}: {}", path.display(), e),
        })?;
        Self::parse(&content)
    }
}

/// Parse raw text into an ordered instruction sequence.
pub fn parse(raw: &str) -> Result<Vec<Instruction>> {
    Buildfile::parse(raw).map(|b| b.instructions)
}

/// Join lines ending with `\` into single logical lines.
///
/// Returns each logical line with the number of the physical line it starts
/// on. Comment lines inside a continuation are dropped and continued parts
/// are joined with a single space, so indentation does not leak into the
/// instruction text.
fn join_continuation_lines(content: &str) -> Vec<(usize, String)> {
    let mut logical_lines = Vec::new();
    let mut current = String::new();
    let mut start_line = 0;

    for (idx, line) in content.lines().enumerate() {
        let continuing = !current.is_empty();
        let part = if continuing { line.trim() } else { line };

        if continuing && (part.is_empty() || part.starts_with('#')) {
            continue;
        }
        if !continuing {
            start_line = idx + 1;
        }

        if let Some(stripped) = part.strip_suffix('\\') {
            current.push_str(stripped.trim_end());
            current.push(' ');
        } else {
            current.push_str(part);
            logical_lines.push((start_line, std::mem::take(&mut current)));
        }
    }

    // Trailing continuation without a final line
    if !current.trim().is_empty() {
        logical_lines.push((start_line, current.trim_end().to_string()));
    }

    logical_lines
}

/// Parse state: the working directory and environment in effect.
struct Parser {
    instructions: Vec<Instruction>,
    workdir: String,
    env: BTreeMap<String, String>,
}

impl Default for Parser {
    fn default() -> Self {
        Self {
            instructions: Vec::new(),
            workdir: "/".to_string(),
            env: BTreeMap::new(),
        }
    }
}

impl Parser {
    fn parse_line(&mut self, line: &str, line_num: usize) -> Result<()> {
        let (keyword, rest) = split_first_word(line);
        let keyword_upper = keyword.to_uppercase();

        if self.instructions.is_empty() && keyword_upper != "FROM" {
            return Err(parse_err(line_num, "first instruction must be FROM"));
        }

        let instruction = match keyword_upper.as_str() {
            "FROM" => self.parse_from(rest, line_num)?,
            "RUN" => self.parse_run(rest, line_num)?,
            "COPY" => self.parse_copy(rest, line_num)?,
            "ENV" => self.parse_env(rest, line_num)?,
            "ENTRYPOINT" => Instruction::SetEntrypoint {
                argv: parse_exec_or_shell(rest, "ENTRYPOINT", line_num)?,
            },
            "CMD" => Instruction::SetCmd {
                argv: parse_exec_or_shell(rest, "CMD", line_num)?,
            },
            "WORKDIR" => self.parse_workdir(rest, line_num)?,
            "LABEL" => parse_label(rest, line_num)?,
            _ => {
                return Err(parse_err(
                    line_num,
                    format!("unsupported instruction '{}'", keyword),
                ))
            }
        };

        self.instructions.push(instruction);
        Ok(())
    }

    // --- Individual instruction parsers ---

    fn parse_from(&self, rest: &str, line_num: usize) -> Result<Instruction> {
        if !self.instructions.is_empty() {
            return Err(parse_err(
                line_num,
                "only one FROM is allowed (multi-stage builds are not supported)",
            ));
        }
        let words = split_words(rest, line_num)?;
        match words.as_slice() {
            [reference] => Ok(Instruction::ImportBase {
                reference: reference.clone(),
            }),
            [] => Err(parse_err(line_num, "FROM requires an image reference")),
            _ => Err(parse_err(
                line_num,
                "FROM takes a single reference (stage aliases are not supported)",
            )),
        }
    }

    fn parse_run(&self, rest: &str, line_num: usize) -> Result<Instruction> {
        let mut rest = rest;
        let mut no_cache = false;
        while rest.starts_with("--") {
            let (flag, after) = split_first_word(rest);
            match flag {
                "--no-cache" => no_cache = true,
                other => {
                    return Err(parse_err(
                        line_num,
                        format!("unsupported RUN flag '{}'", other),
                    ))
                }
            }
            rest = after;
        }

        Ok(Instruction::RunCommand {
            argv: parse_exec_or_shell(rest, "RUN", line_num)?,
            working_dir: self.workdir.clone(),
            env: self.env.clone(),
            no_cache,
        })
    }

    fn parse_copy(&self, rest: &str, line_num: usize) -> Result<Instruction> {
        if rest.starts_with("--") {
            let (flag, _) = split_first_word(rest);
            return Err(parse_err(
                line_num,
                format!("unsupported COPY flag '{}'", flag),
            ));
        }

        let parts = if rest.starts_with('[') {
            parse_json_array(rest, line_num)?
        } else {
            split_words(rest, line_num)?
        };
        if parts.len() < 2 {
            return Err(parse_err(
                line_num,
                "COPY requires at least one source and a destination",
            ));
        }

        let (dst, srcs) = parts.split_last().ok_or_else(|| {
            parse_err(line_num, "COPY requires at least one source and a destination")
        })?;
        let into_dir = dst.ends_with('/')
            || dst == "."
            || dst.ends_with("/.")
            || srcs.len() > 1;
        let mut dest = join_image_path(&self.workdir, dst);
        if into_dir && dest != "/" {
            dest.push('/');
        }

        Ok(Instruction::CopyContext {
            sources: srcs.iter().map(|s| normalize_context_path(s)).collect(),
            dest,
        })
    }

    fn parse_env(&mut self, rest: &str, line_num: usize) -> Result<Instruction> {
        let (key, value) = parse_key_value(rest, "ENV", line_num)?;
        self.env.insert(key.clone(), value.clone());
        Ok(Instruction::SetEnv { key, value })
    }

    fn parse_workdir(&mut self, rest: &str, line_num: usize) -> Result<Instruction> {
        let path = rest.trim();
        if path.is_empty() {
            return Err(parse_err(line_num, "WORKDIR requires a path"));
        }
        self.workdir = join_image_path(&self.workdir, &unquote(path));
        Ok(Instruction::SetWorkdir {
            path: self.workdir.clone(),
        })
    }
}

fn parse_label(rest: &str, line_num: usize) -> Result<Instruction> {
    let (key, value) = parse_key_value(rest, "LABEL", line_num)?;
    Ok(Instruction::SetLabel { key, value })
}

// --- Helpers ---

fn parse_err(line: usize, message: impl Into<String>) -> BuildError {
    BuildError::Parse {
        line,
        message: message.into(),
    }
}

/// Split a string into the first word and the rest.
fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

/// `KEY=VALUE` or legacy `KEY VALUE`.
fn parse_key_value(rest: &str, keyword: &str, line_num: usize) -> Result<(String, String)> {
    if rest.is_empty() {
        return Err(parse_err(
            line_num,
            format!("{} requires a key and value", keyword),
        ));
    }

    let eq_pos = rest.find('=');
    let space_pos = rest.find(char::is_whitespace);
    let (key, value) = match (eq_pos, space_pos) {
        (Some(eq), Some(sp)) if eq < sp => {
            let words = split_words(&rest[eq + 1..], line_num)?;
            if words.len() > 1 {
                return Err(parse_err(
                    line_num,
                    format!("{} accepts a single KEY=VALUE pair per line", keyword),
                ));
            }
            (&rest[..eq], words.into_iter().next().unwrap_or_default())
        }
        (Some(eq), None) => (&rest[..eq], unquote(&rest[eq + 1..])),
        _ => {
            let (key, value) = split_first_word(rest);
            (key, unquote(value))
        }
    };

    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(parse_err(
            line_num,
            format!("{} has an invalid key '{}'", keyword, key),
        ));
    }
    Ok((key.to_string(), value))
}

/// JSON exec form, or shell form wrapped in `/bin/sh -c`.
fn parse_exec_or_shell(rest: &str, keyword: &str, line_num: usize) -> Result<Vec<String>> {
    if rest.is_empty() {
        return Err(parse_err(
            line_num,
            format!("{} requires an argument", keyword),
        ));
    }

    if rest.starts_with('[') {
        let argv = parse_json_array(rest, line_num)?;
        if argv.is_empty() {
            return Err(parse_err(
                line_num,
                format!("{} exec form must not be empty", keyword),
            ));
        }
        Ok(argv)
    } else {
        Ok(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            rest.to_string(),
        ])
    }
}

/// Parse a JSON array string like `["a", "b", "c"]` into a Vec<String>.
fn parse_json_array(s: &str, line_num: usize) -> Result<Vec<String>> {
    serde_json::from_str(s)
        .map_err(|e| parse_err(line_num, format!("invalid JSON array '{}': {}", s, e)))
}

/// Remove surrounding quotes from a string.
fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// Whitespace split that keeps quoted strings together and strips the quotes.
fn split_words(s: &str, line_num: usize) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_word = false;

    for c in s.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(parse_err(line_num, "unterminated quote"));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Lexically tidy a build-context path without resolving `..`, so the
/// containment check still sees traversal attempts.
fn normalize_context_path(p: &str) -> String {
    let parts: Vec<&str> = p
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();
    if parts.is_empty() {
        ".".to_string()
    } else if p.starts_with('/') {
        format!("/{}", parts.join("/"))
    } else {
        parts.join("/")
    }
}
