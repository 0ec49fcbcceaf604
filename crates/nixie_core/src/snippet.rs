//! Configuration snippet store.
//!
//! Snippets come from outside (an analyzer, the user) and are kept as
//! `<name>.nix` files. Before a snippet is applied it must pass `validate`,
//! which checks the shapes nixie knows how to emit: a whole module
//! (`{ config, pkgs, ... }: { ... }` or `{ ... }`) or a partial list of
//! `option = value;` bindings. It is not a Nix parser.

use nixie_shared::result::{ErrorKind, ExecutionError};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub trait SnippetStore: Send + Sync {
    /// Snippet text by name, None if there is no such snippet
    fn get(&self, name: &str) -> Option<String>;

    fn validate(&self, snippet: &str) -> Result<(), ExecutionError> {
        validate_snippet(snippet)
    }
}

/// Directory of `<name>.nix` files
pub struct DirSnippetStore {
    dir: PathBuf,
}

impl DirSnippetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SnippetStore for DirSnippetStore {
    fn get(&self, name: &str) -> Option<String> {
        if !is_valid_name(name) {
            return None;
        }
        let path = self.dir.join(format!("{}.nix", name));
        match fs::read_to_string(&path) {
            Ok(content) => Some(content),
            Err(e) => {
                debug!("No snippet at {}: {}", path.display(), e);
                None
            }
        }
    }
}

pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn malformed(detail: String) -> ExecutionError {
    ExecutionError::new(ErrorKind::MalformedInput, detail)
        .with_explanation("The configuration snippet isn't valid, so it was not applied.")
}

/// Structural check: balanced delimiters, closed strings, terminated bindings.
pub fn validate_snippet(snippet: &str) -> Result<(), ExecutionError> {
    let code = strip_comments(snippet);
    let trimmed = code.trim();
    if trimmed.is_empty() {
        return Err(malformed("snippet is empty".to_string()));
    }

    let mut stack: Vec<(char, usize)> = Vec::new();
    let chars: Vec<char> = code.chars().collect();
    let mut line = 1;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => line += 1,
            '"' => {
                let start = line;
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\' {
                        i += 1;
                    } else if chars[i] == '\n' {
                        line += 1;
                    }
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(malformed(format!("unterminated string from line {}", start)));
                }
            }
            '\'' if chars.get(i + 1) == Some(&'\'') => {
                let start = line;
                i += 2;
                loop {
                    if i + 1 >= chars.len() {
                        return Err(malformed(format!(
                            "unterminated indented string from line {}",
                            start
                        )));
                    }
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    if chars[i] == '\'' && chars[i + 1] == '\'' {
                        i += 1;
                        break;
                    }
                    i += 1;
                }
            }
            '{' | '[' | '(' => stack.push((c, line)),
            '}' | ']' | ')' => {
                let expected = match c {
                    '}' => '{',
                    ']' => '[',
                    _ => '(',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_line)) => {
                        return Err(malformed(format!(
                            "'{}' on line {} closes '{}' from line {}",
                            c, line, open, open_line
                        )))
                    }
                    None => return Err(malformed(format!("unmatched '{}' on line {}", c, line))),
                }
            }
            _ => {}
        }
        i += 1;
    }
    if let Some((open, open_line)) = stack.pop() {
        return Err(malformed(format!("'{}' from line {} is never closed", open, open_line)));
    }

    let is_module = trimmed.starts_with('{');
    if !is_module && !trimmed.ends_with(';') {
        return Err(malformed(
            "partial snippet must end with a ';'-terminated binding".to_string(),
        ));
    }
    if !is_module && !trimmed.contains('=') {
        return Err(malformed("partial snippet has no bindings".to_string()));
    }
    Ok(())
}

/// Drop `#` line comments and `/* */` block comments outside strings.
fn strip_comments(snippet: &str) -> String {
    let mut out = String::with_capacity(snippet.len());
    let mut chars = snippet.chars().peekable();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if c == '\\' {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '#' => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        out.push('\n');
                    }
                    if prev == '*' && skipped == '/' {
                        break;
                    }
                    prev = skipped;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Module text for a snippet: partial bindings are wrapped into a module.
pub fn as_module(snippet: &str) -> String {
    let trimmed = snippet.trim();
    if strip_comments(trimmed).trim_start().starts_with('{') {
        format!("{}\n", trimmed)
    } else {
        let body: Vec<String> = trimmed.lines().map(|l| format!("  {}", l)).collect();
        format!("{{ config, pkgs, ... }}:\n{{\n{}\n}}\n", body.join("\n"))
    }
}

/// Path the snippet `name` is written to inside `include_dir`
pub fn include_path(include_dir: &Path, name: &str) -> PathBuf {
    include_dir.join(format!("{}.nix", name))
}

/// Write a validated snippet into the include directory (temp file + rename).
pub fn install_snippet(include_dir: &Path, name: &str, snippet: &str) -> std::io::Result<PathBuf> {
    fs::create_dir_all(include_dir)?;
    let path = include_path(include_dir, name);
    let temp_path = path.with_extension("nix.tmp");
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(as_module(snippet).as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, &path)?;
    info!("Snippet '{}' written to {}", name, path.display());
    Ok(path)
}
