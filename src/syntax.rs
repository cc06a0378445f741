//! Grammar-based syntax checks for generated file content.
//!
//! Source languages go through tree-sitter; data formats go through their
//! serde parsers. Files with no known grammar are reported as unchecked.

use std::cell::RefCell;

use tree_sitter::{Node, Parser};

thread_local! {
    static RUST_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // A failed set_language surfaces as a parse failure below
        let _ = p.set_language(&tree_sitter_rust::LANGUAGE.into());
        p
    });

    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });

    static JS_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_javascript::LANGUAGE.into());
        p
    });

    static TS_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into());
        p
    });

    static TSX_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_typescript::LANGUAGE_TSX.into());
        p
    });
}

/// Grammar selected from a file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grammar {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Tsx,
    Json,
    Toml,
    Yaml,
}

impl Grammar {
    pub fn for_path(path: &str) -> Option<Grammar> {
        let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())?;
        match ext.as_str() {
            "rs" => Some(Grammar::Rust),
            "py" | "pyi" => Some(Grammar::Python),
            "js" | "jsx" | "mjs" | "cjs" => Some(Grammar::JavaScript),
            "ts" | "mts" | "cts" => Some(Grammar::TypeScript),
            "tsx" => Some(Grammar::Tsx),
            "json" => Some(Grammar::Json),
            "toml" => Some(Grammar::Toml),
            "yaml" | "yml" => Some(Grammar::Yaml),
            _ => None,
        }
    }

    /// True for languages whose import statements are checked.
    pub fn is_source(self) -> bool {
        matches!(
            self,
            Grammar::Rust | Grammar::Python | Grammar::JavaScript | Grammar::TypeScript | Grammar::Tsx
        )
    }
}

/// Outcome of a syntax check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntaxCheck {
    Valid,
    Invalid(String),
    /// No grammar for this file type.
    Unchecked,
}

pub(crate) fn parse_tree(content: &str, grammar: Grammar) -> Option<tree_sitter::Tree> {
    match grammar {
        Grammar::Rust => RUST_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Grammar::Python => PYTHON_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Grammar::JavaScript => JS_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Grammar::TypeScript => TS_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Grammar::Tsx => TSX_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Grammar::Json | Grammar::Toml | Grammar::Yaml => None,
    }
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.has_error() || child.is_missing() {
            if let Some(found) = first_error(child) {
                return Some(found);
            }
        }
    }
    None
}

/// Checks that `content` parses under the grammar implied by `path`.
pub fn check_syntax(path: &str, content: &str) -> SyntaxCheck {
    let Some(grammar) = Grammar::for_path(path) else {
        return SyntaxCheck::Unchecked;
    };

    match grammar {
        Grammar::Json => match serde_json::from_str::<serde_json::Value>(content) {
            Ok(_) => SyntaxCheck::Valid,
            Err(e) => SyntaxCheck::Invalid(e.to_string()),
        },
        Grammar::Toml => match content.parse::<toml::Value>() {
            Ok(_) => SyntaxCheck::Valid,
            Err(e) => SyntaxCheck::Invalid(e.to_string().trim().to_string()),
        },
        Grammar::Yaml => match serde_yaml::from_str::<serde_yaml::Value>(content) {
            Ok(_) => SyntaxCheck::Valid,
            Err(e) => SyntaxCheck::Invalid(e.to_string()),
        },
        _ => {
            let Some(tree) = parse_tree(content, grammar) else {
                return SyntaxCheck::Invalid("parser produced no tree".to_string());
            };
            let root = tree.root_node();
            if !root.has_error() {
                return SyntaxCheck::Valid;
            }
            let node = first_error(root).unwrap_or(root);
            let pos = node.start_position();
            let what = if node.is_missing() {
                format!("missing {}", node.kind())
            } else {
                "syntax error".to_string()
            };
            SyntaxCheck::Invalid(format!("{} at line {}, column {}", what, pos.row + 1, pos.column + 1))
        }
    }
}
