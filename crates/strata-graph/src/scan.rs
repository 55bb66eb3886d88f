//! Lexical scan of template bodies
//!
//! Finds `{{ ref('model') }}`, `{{ source('src', 'table') }}` and friends
//! without evaluating the template. Only calls whose arguments are string
//! literals are recognized.

use regex::Regex;
use std::sync::OnceLock;
use strata_core::{DocCall, RefCall, SourceCall};

/// Everything the scanner found in one body
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanResult {
    /// `ref()` calls in order of appearance
    pub refs: Vec<RefCall>,

    /// `source()` calls in order of appearance
    pub sources: Vec<SourceCall>,

    /// `doc()` calls in order of appearance
    pub docs: Vec<DocCall>,

    /// `metric()` calls
    pub metrics: Vec<RefCall>,

    /// Literal keyword arguments of `config()` calls
    pub config: Vec<(String, serde_json::Value)>,

    /// Every function name called inside a Jinja block (macro candidates)
    pub calls: Vec<String>,
}

impl ScanResult {
    fn merge(&mut self, other: ScanResult) {
        for r in other.refs {
            push_unique(&mut self.refs, r);
        }
        for s in other.sources {
            push_unique(&mut self.sources, s);
        }
        for d in other.docs {
            push_unique(&mut self.docs, d);
        }
        for m in other.metrics {
            push_unique(&mut self.metrics, m);
        }
        self.config.extend(other.config);
        for c in other.calls {
            push_unique(&mut self.calls, c);
        }
    }
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

fn block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Comments come first so blocks inside them are consumed, not scanned
    RE.get_or_init(|| Regex::new(r"(?s)\{#.*?#\}|\{\{(.*?)\}\}|\{%(.*?)%\}").expect("valid block regex"))
}

fn call_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)(?:^|[^\w.])(ref|source|doc|metric)\s*\(([^()]*)\)").expect("valid call regex")
    })
}

fn config_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)(?:^|[^\w.])config\s*\((.*?)\)\s*$").expect("valid config regex"))
}

fn kwarg_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(\w+)\s*=\s*('[^']*'|"[^"]*"|True|False|true|false|-?\d+)"#).expect("valid kwarg regex")
    })
}

fn literal_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^\s*(?:'([^']*)'|"([^"]*)")\s*$"#).expect("valid literal regex"))
}

fn identifier_call_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|[^\w.])([A-Za-z_]\w*)\s*\(").expect("valid identifier regex"))
}

/// Scan a template body; only text inside `{{ }}` and `{% %}` is considered,
/// and nothing inside `{# #}` comments
pub fn scan_template(body: &str) -> ScanResult {
    let mut result = ScanResult::default();

    for block in block_regex().captures_iter(body) {
        let Some(inner) = block.get(1).or_else(|| block.get(2)) else {
            continue;
        };
        result.merge(scan_expression(inner.as_str()));
    }

    result
}

/// Scan a bare expression such as a declared `ref('orders')` dependency
pub fn scan_expression(expression: &str) -> ScanResult {
    let mut result = ScanResult::default();

    for call in call_regex().captures_iter(expression) {
        let function = &call[1];
        let Some(args) = positional_literals(&call[2]) else {
            continue;
        };

        match (function, args.as_slice()) {
            ("ref", [name]) => push_unique(&mut result.refs, RefCall { name: name.clone(), package: None }),
            ("ref", [package, name]) => push_unique(
                &mut result.refs,
                RefCall {
                    name: name.clone(),
                    package: Some(package.clone()),
                },
            ),
            ("source", [source_name, table]) => {
                push_unique(&mut result.sources, SourceCall(source_name.clone(), table.clone()))
            }
            ("doc", [name]) => push_unique(&mut result.docs, DocCall { name: name.clone(), package: None }),
            ("doc", [package, name]) => push_unique(
                &mut result.docs,
                DocCall {
                    name: name.clone(),
                    package: Some(package.clone()),
                },
            ),
            ("metric", [name]) => push_unique(&mut result.metrics, RefCall { name: name.clone(), package: None }),
            ("metric", [package, name]) => push_unique(
                &mut result.metrics,
                RefCall {
                    name: name.clone(),
                    package: Some(package.clone()),
                },
            ),
            _ => {}
        }
    }

    if let Some(config) = config_regex().captures(expression.trim()) {
        for kwarg in kwarg_regex().captures_iter(&config[1]) {
            result.config.push((kwarg[1].to_string(), literal_value(&kwarg[2])));
        }
    }

    for call in identifier_call_regex().captures_iter(expression) {
        push_unique(&mut result.calls, call[1].to_string());
    }

    result
}

/// Split call arguments, keeping leading string literals and dropping kwargs.
///
/// Returns `None` when a positional argument is not a string literal.
fn positional_literals(args: &str) -> Option<Vec<String>> {
    let mut literals = Vec::new();

    for part in split_args(args) {
        if part.trim().is_empty() {
            continue;
        }
        if is_kwarg(part) {
            continue;
        }
        let caps = literal_regex().captures(part)?;
        let value = caps.get(1).or_else(|| caps.get(2))?.as_str();
        literals.push(value.to_string());
    }

    Some(literals)
}

/// Split on commas outside quotes
fn split_args(args: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, ch) in args.char_indices() {
        match (quote, ch) {
            (None, '\'') | (None, '"') => quote = Some(ch),
            (Some(q), c) if c == q => quote = None,
            (None, ',') => {
                parts.push(&args[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&args[start..]);

    parts
}

fn is_kwarg(part: &str) -> bool {
    let trimmed = part.trim_start();
    let ident_len = trimmed
        .char_indices()
        .take_while(|(_, c)| c.is_alphanumeric() || *c == '_')
        .count();
    ident_len > 0 && trimmed[ident_len..].trim_start().starts_with('=')
}

fn literal_value(raw: &str) -> serde_json::Value {
    match raw {
        "True" | "true" => serde_json::Value::Bool(true),
        "False" | "false" => serde_json::Value::Bool(false),
        _ => {
            if let Ok(n) = raw.parse::<i64>() {
                return serde_json::Value::from(n);
            }
            let unquoted = raw
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
                .or_else(|| raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
                .unwrap_or(raw);
            serde_json::Value::String(unquoted.to_string())
        }
    }
}
