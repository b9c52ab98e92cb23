//! Double-mustache placeholder expansion for probe configuration.
//!
//! Sources without `{{` are returned verbatim. Placeholders are either
//! a dotted field path resolved against the target host (`{{ .id }}`,
//! `{{ .ipAddresses.eth0 }}`), or one of two helper functions:
//!
//! - `env "K1" "K2"`: first non-empty lookup, checking the per-probe
//!   env mapping before the process environment; when every key is
//!   empty the last key itself is returned (callers rely on this to
//!   pass a literal fallback).
//! - `must_env "K"`: like `env` but an error when the key is missing.
//!
//! Compiled templates are cached for the process lifetime, keyed by the
//! env mapping identity and the source string.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template parse failed: {0}")]
    Parse(String),
    #[error("no value for {0}")]
    MissingValue(String),
    #[error("cannot render {0} as a string")]
    Unrenderable(String),
    #[error("environment variable {0} is not defined")]
    MustEnv(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field(Vec<String>),
    Env(Vec<String>),
    MustEnv(String),
}

static EXPAND_CACHE: Lazy<DashMap<String, Arc<Vec<Segment>>>> = Lazy::new(DashMap::new);

fn cache_key(src: &str, env: Option<&HashMap<String, String>>) -> String {
    match env {
        None => src.to_string(),
        Some(env) => {
            let mut pairs: Vec<_> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
            pairs.sort();
            format!("{}\u{0}{}", pairs.join("\u{1}"), src)
        }
    }
}

/// Expand `src` against `host` (the target host's API JSON) and the
/// per-probe env mapping.
pub fn expand(
    src: &str,
    host: Option<&Value>,
    env: Option<&HashMap<String, String>>,
) -> Result<String, TemplateError> {
    if !src.contains("{{") {
        return Ok(src.to_string());
    }

    let key = cache_key(src, env);
    let segments = match EXPAND_CACHE.get(&key) {
        Some(cached) => {
            trace!(%key, "expand cache hit");
            Arc::clone(&cached)
        }
        None => {
            trace!(%key, "expand cache miss");
            let parsed = Arc::new(parse(src)?);
            EXPAND_CACHE.insert(key, Arc::clone(&parsed));
            parsed
        }
    };

    let mut out = String::with_capacity(src.len());
    for seg in segments.iter() {
        match seg {
            Segment::Literal(s) => out.push_str(s),
            Segment::Field(path) => out.push_str(&resolve_field(path, host)?),
            Segment::Env(keys) => out.push_str(&resolve_env(keys, env)),
            Segment::MustEnv(k) => out.push_str(&resolve_must_env(k, env)?),
        }
    }
    Ok(out)
}

fn parse(src: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = src;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Literal(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| TemplateError::Parse(format!("unclosed placeholder in {src:?}")))?;
        segments.push(parse_action(after[..end].trim())?);
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    Ok(segments)
}

fn parse_action(action: &str) -> Result<Segment, TemplateError> {
    if action.is_empty() {
        return Err(TemplateError::Parse("empty placeholder".to_string()));
    }
    if let Some(path) = action.strip_prefix('.') {
        if path.is_empty() || action.contains(char::is_whitespace) {
            return Err(TemplateError::Parse(format!("invalid field path {action:?}")));
        }
        return Ok(Segment::Field(path.split('.').map(str::to_string).collect()));
    }
    let (func, args) = match action.split_once(char::is_whitespace) {
        Some((f, a)) => (f, tokenize_args(a)?),
        None => (action, Vec::new()),
    };
    match func {
        "env" => {
            if args.is_empty() {
                return Err(TemplateError::Parse("env requires at least one key".to_string()));
            }
            Ok(Segment::Env(args))
        }
        "must_env" => {
            if args.len() != 1 {
                return Err(TemplateError::Parse("must_env requires exactly one key".to_string()));
            }
            Ok(Segment::MustEnv(args.into_iter().next().unwrap()))
        }
        other => Err(TemplateError::Parse(format!("unknown function {other:?}"))),
    }
}

fn tokenize_args(s: &str) -> Result<Vec<String>, TemplateError> {
    let mut args = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' || c == '`' {
            chars.next();
            let mut arg = String::new();
            loop {
                match chars.next() {
                    Some(q) if q == c => break,
                    Some(ch) => arg.push(ch),
                    None => {
                        return Err(TemplateError::Parse(format!("unterminated string in {s:?}")))
                    }
                }
            }
            args.push(arg);
        } else {
            let mut arg = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                arg.push(ch);
                chars.next();
            }
            args.push(arg);
        }
    }
    Ok(args)
}

fn resolve_field(path: &[String], host: Option<&Value>) -> Result<String, TemplateError> {
    let dotted = || format!(".{}", path.join("."));
    let mut cur = host.ok_or_else(|| TemplateError::MissingValue(dotted()))?;
    for part in path {
        cur = cur
            .get(part)
            .ok_or_else(|| TemplateError::MissingValue(dotted()))?;
    }
    match cur {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Err(TemplateError::MissingValue(dotted())),
        Value::Array(_) | Value::Object(_) => Err(TemplateError::Unrenderable(dotted())),
    }
}

fn resolve_env(keys: &[String], env: Option<&HashMap<String, String>>) -> String {
    for key in keys {
        if let Some(v) = env.and_then(|e| e.get(key)) {
            if !v.is_empty() {
                return v.clone();
            }
        }
        if let Ok(v) = std::env::var(key) {
            if !v.is_empty() {
                return v;
            }
        }
    }
    keys.last().cloned().unwrap_or_default()
}

fn resolve_must_env(key: &str, env: Option<&HashMap<String, String>>) -> Result<String, TemplateError> {
    if let Some(v) = env.and_then(|e| e.get(key)) {
        return Ok(v.clone());
    }
    match std::env::var(key) {
        Ok(v) => Ok(v),
        Err(_) => Err(TemplateError::MustEnv(key.to_string())),
    }
}
