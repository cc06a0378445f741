//! Non-fatal async misuse warnings.
//!
//! Flags async functions that never await and blocking sleeps or sync file
//! calls made directly inside an async function. Nested functions are
//! judged on their own.

use tree_sitter::Node;

use crate::syntax::{parse_tree, Grammar};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lang {
    Rust,
    Python,
    Script,
}

impl Lang {
    fn of(grammar: Grammar) -> Option<Self> {
        match grammar {
            Grammar::Rust => Some(Lang::Rust),
            Grammar::Python => Some(Lang::Python),
            Grammar::JavaScript | Grammar::TypeScript | Grammar::Tsx => Some(Lang::Script),
            Grammar::Json | Grammar::Toml | Grammar::Yaml => None,
        }
    }

    fn is_function(self, kind: &str) -> bool {
        match self {
            Lang::Rust => matches!(kind, "function_item" | "closure_expression"),
            Lang::Python => matches!(kind, "function_definition" | "lambda"),
            Lang::Script => matches!(
                kind,
                "function_declaration" | "function_expression" | "function" | "arrow_function" | "method_definition"
            ),
        }
    }

    fn is_await(self, node: Node<'_>) -> bool {
        match self {
            Lang::Rust | Lang::Script => node.kind() == "await_expression",
            Lang::Python => {
                node.kind() == "await"
                    || (matches!(node.kind(), "for_statement" | "with_statement") && has_token(node, "async"))
            }
        }
    }

    fn is_async(self, node: Node<'_>) -> bool {
        match self {
            Lang::Rust => {
                let mut cursor = node.walk();
                let found = node
                    .children(&mut cursor)
                    .any(|c| c.kind() == "function_modifiers" && has_token(c, "async"));
                found
            }
            Lang::Python | Lang::Script => has_token(node, "async"),
        }
    }

    fn call_kind(self) -> &'static str {
        match self {
            Lang::Python => "call",
            Lang::Rust | Lang::Script => "call_expression",
        }
    }

    fn is_blocking_call(self, callee: &str) -> bool {
        match self {
            Lang::Python => callee == "time.sleep",
            Lang::Rust => callee.ends_with("thread::sleep"),
            Lang::Script => callee.rsplit('.').next().is_some_and(|name| name.ends_with("Sync")),
        }
    }
}

fn has_token(node: Node<'_>, token: &str) -> bool {
    let mut cursor = node.walk();
    let found = node.children(&mut cursor).any(|c| c.kind() == token);
    found
}

fn text<'a>(node: Node<'_>, source: &'a str) -> &'a str {
    node.utf8_text(source.as_bytes()).unwrap_or("")
}

fn function_name(node: Node<'_>, source: &str) -> String {
    if let Some(name) = node.child_by_field_name("name") {
        return text(name, source).to_string();
    }
    node.parent()
        .filter(|p| p.kind() == "variable_declarator")
        .and_then(|p| p.child_by_field_name("name"))
        .map(|n| text(n, source).to_string())
        .unwrap_or_else(|| "<anonymous>".to_string())
}

/// Bodies like `pass` or `...` are stubs, not missing awaits.
fn is_stub(node: Node<'_>, source: &str) -> bool {
    let Some(body) = node.child_by_field_name("body") else {
        return true;
    };
    let mut cursor = body.walk();
    let statements: Vec<Node<'_>> = body.named_children(&mut cursor).collect();
    match statements.as_slice() {
        [] => true,
        [only] => only.kind() == "pass_statement" || text(*only, source).trim() == "...",
        _ => false,
    }
}

#[derive(Default)]
struct BodyScan {
    awaits: bool,
    blocking: Vec<(usize, String)>,
}

fn scan_body(lang: Lang, node: Node<'_>, source: &str, scan: &mut BodyScan) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if lang.is_function(child.kind()) {
            continue;
        }
        if lang.is_await(child) {
            scan.awaits = true;
        }
        if child.kind() == lang.call_kind() {
            if let Some(callee) = child.child_by_field_name("function") {
                let callee = text(callee, source);
                if lang.is_blocking_call(callee) {
                    scan.blocking.push((child.start_position().row + 1, callee.to_string()));
                }
            }
        }
        scan_body(lang, child, source, scan);
    }
}

fn visit(lang: Lang, node: Node<'_>, path: &str, source: &str, out: &mut Vec<String>) {
    if lang.is_function(node.kind()) && lang.is_async(node) {
        let name = function_name(node, source);
        let mut scan = BodyScan::default();
        if let Some(body) = node.child_by_field_name("body") {
            scan_body(lang, body, source, &mut scan);
        }
        if !scan.awaits && !is_stub(node, source) {
            out.push(format!(
                "{}:{}: async function '{}' never awaits; consider making it synchronous",
                path,
                node.start_position().row + 1,
                name
            ));
        }
        for (line, call) in scan.blocking {
            out.push(format!(
                "{}:{}: blocking call '{}' inside async function '{}'",
                path, line, call, name
            ));
        }
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        visit(lang, child, path, source, out);
    }
}

/// Async misuse warnings for one file's post-change content.
///
/// Files without a source grammar, or that do not parse, yield nothing.
pub fn async_warnings(path: &str, content: &str) -> Vec<String> {
    let Some(grammar) = Grammar::for_path(path) else {
        return Vec::new();
    };
    let Some(lang) = Lang::of(grammar) else {
        return Vec::new();
    };
    let Some(tree) = parse_tree(content, grammar) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    visit(lang, tree.root_node(), path, content, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_async_without_await_is_flagged() {
        let source = "\
import asyncio

async def fetch(client):
    return client.get('/x')

async def ok(client):
    return await client.get('/x')

async def stub(self):
    ...
";
        let warnings = async_warnings("app/api.py", source);
        assert_eq!(
            warnings,
            vec!["app/api.py:3: async function 'fetch' never awaits; consider making it synchronous"]
        );
    }

    #[test]
    fn python_blocking_sleep_is_flagged() {
        let source = "\
import time

async def poll(client):
    time.sleep(1)
    return await client.get('/x')

def sync_poll():
    time.sleep(1)
";
        let warnings = async_warnings("poll.py", source);
        assert_eq!(warnings, vec!["poll.py:4: blocking call 'time.sleep' inside async function 'poll'"]);
    }

    #[test]
    fn python_async_for_counts_as_awaiting() {
        let source = "async def drain(stream):\n    async for item in stream:\n        print(item)\n";
        assert!(async_warnings("drain.py", source).is_empty());
    }

    #[test]
    fn nested_functions_are_judged_separately() {
        let source = "\
async def outer(client):
    def helper():
        return 1
    return await client.get(helper())
";
        assert!(async_warnings("nested.py", source).is_empty());
    }

    #[test]
    fn rust_async_fn_and_thread_sleep() {
        let source = "\
async fn load(path: &str) -> String {
    std::thread::sleep(std::time::Duration::from_millis(10));
    tokio::fs::read_to_string(path).await.unwrap_or_default()
}

async fn idle() -> u32 {
    1
}

fn plain() -> u32 {
    2
}
";
        let warnings = async_warnings("src/load.rs", source);
        assert_eq!(warnings.len(), 2, "{:?}", warnings);
        assert!(warnings.iter().any(|w| w.contains("blocking call 'std::thread::sleep'")));
        assert!(warnings.iter().any(|w| w.contains("async function 'idle' never awaits")));
    }

    #[test]
    fn script_sync_calls_in_async_functions() {
        let source = "\
const fs = require('fs');
const load = async (path) => {
  const data = fs.readFileSync(path);
  return await parse(data);
};
async function noop() {
  return 1;
}
";
        let warnings = async_warnings("lib/load.js", source);
        assert_eq!(warnings.len(), 2, "{:?}", warnings);
        assert!(warnings[0].contains("blocking call 'fs.readFileSync' inside async function 'load'"));
        assert!(warnings[1].contains("async function 'noop' never awaits"));
    }

    #[test]
    fn unsupported_files_yield_nothing() {
        assert!(async_warnings("README.md", "async def x(): pass").is_empty());
        assert!(async_warnings("data.json", "{}").is_empty());
    }
}
