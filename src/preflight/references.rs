//! Import extraction and resolution for the reference check.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::manifest::DependencyManifest;
use crate::syntax::Grammar;

const PYTHON_STDLIB: &[&str] = &[
    "__future__", "abc", "argparse", "array", "ast", "asyncio", "base64", "binascii", "bisect",
    "builtins", "bz2", "calendar", "cmath", "codecs", "collections", "concurrent",
    "configparser", "contextlib", "contextvars", "copy", "csv", "ctypes", "dataclasses",
    "datetime", "decimal", "difflib", "dis", "email", "enum", "errno", "fnmatch", "fractions",
    "functools", "gc", "getpass", "gettext", "glob", "gzip", "hashlib", "heapq", "hmac",
    "html", "http", "importlib", "inspect", "io", "ipaddress", "itertools", "json", "keyword",
    "locale", "logging", "lzma", "math", "mimetypes", "multiprocessing", "numbers", "operator",
    "os", "pathlib", "pickle", "pkgutil", "platform", "pprint", "queue", "random", "re",
    "secrets", "select", "shlex", "shutil", "signal", "site", "socket", "sqlite3", "ssl",
    "stat", "statistics", "string", "struct", "subprocess", "sys", "sysconfig", "tempfile",
    "textwrap", "threading", "time", "timeit", "token", "tokenize", "traceback", "types",
    "typing", "unicodedata", "unittest", "urllib", "uuid", "warnings", "weakref", "xml",
    "zipfile", "zlib", "zoneinfo",
];

/// Import names whose distribution is published under another name.
const PYTHON_ALIASES: &[(&str, &str)] = &[
    ("yaml", "pyyaml"),
    ("PIL", "pillow"),
    ("sklearn", "scikit_learn"),
    ("cv2", "opencv_python"),
    ("bs4", "beautifulsoup4"),
    ("dateutil", "python_dateutil"),
    ("jwt", "pyjwt"),
    ("dotenv", "python_dotenv"),
];

const RUST_ROOTS: &[&str] = &["crate", "self", "super", "std", "core", "alloc", "proc_macro", "test"];

const NODE_BUILTINS: &[&str] = &[
    "assert", "async_hooks", "buffer", "child_process", "cluster", "console", "crypto", "dgram",
    "dns", "events", "fs", "http", "http2", "https", "net", "os", "path", "perf_hooks",
    "process", "querystring", "readline", "stream", "string_decoder", "timers", "tls", "tty",
    "url", "util", "v8", "vm", "worker_threads", "zlib",
];

const JS_EXTENSIONS: &[&str] = &[
    "", ".js", ".jsx", ".mjs", ".cjs", ".ts", ".tsx", ".json", "/index.js", "/index.jsx",
    "/index.ts", "/index.tsx",
];

static PYTHON_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*import[ \t]+([^#\n;]+)").expect("PYTHON_IMPORT_RE regex should compile")
});

static PYTHON_FROM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*from[ \t]+(\.*)([A-Za-z_][\w\.]*)?[ \t]+import\b")
        .expect("PYTHON_FROM_RE regex should compile")
});

/// `use foo::...` and `extern crate foo`, capturing the root segment.
static RUST_USE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[ \t]*(?:pub(?:\([^)]*\))?[ \t]+)?(?:use[ \t]+(?:::)?|extern[ \t]+crate[ \t]+)([A-Za-z_][A-Za-z0-9_]*)",
    )
    .expect("RUST_USE_RE regex should compile")
});

/// ES imports, re-exports, `require()` and dynamic `import()`.
static JS_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:\bimport\s+(?:[\w*{}\s,$]+?\s+from\s+)?|\bexport\s+(?:\*|\{[^}]*\})\s+from\s+|\brequire\s*\(\s*|\bimport\s*\(\s*)['"]([^'"\n]+)['"]"#,
    )
    .expect("JS_IMPORT_RE regex should compile")
});

/// A reference that could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Unresolved {
    pub line: usize,
    pub name: String,
}

fn line_of(content: &str, offset: usize) -> usize {
    content[..offset].matches('\n').count() + 1
}

/// Resolves imports against declared dependencies and the post-change file set.
pub(crate) struct Resolver<'a> {
    manifest: &'a DependencyManifest,
    paths: &'a BTreeSet<String>,
}

impl<'a> Resolver<'a> {
    pub fn new(manifest: &'a DependencyManifest, paths: &'a BTreeSet<String>) -> Self {
        Self { manifest, paths }
    }

    /// Lists the imports in `content` that resolve to nothing.
    pub fn unresolved(&self, file: &str, grammar: Grammar, content: &str) -> Vec<Unresolved> {
        match grammar {
            Grammar::Python => self.python(file, content),
            Grammar::Rust => self.rust(content),
            Grammar::JavaScript | Grammar::TypeScript | Grammar::Tsx => self.js(file, content),
            Grammar::Json | Grammar::Toml | Grammar::Yaml => Vec::new(),
        }
    }

    fn has_module_file(&self, name: &str, extensions: &[&str]) -> bool {
        self.paths.iter().any(|p| {
            let segments: Vec<&str> = p.split('/').collect();
            let (last, dirs) = match segments.split_last() {
                Some(split) => split,
                None => return false,
            };
            dirs.contains(&name)
                || extensions
                    .iter()
                    .any(|ext| last.strip_suffix(ext) == Some(name))
        })
    }

    fn python(&self, file: &str, content: &str) -> Vec<Unresolved> {
        let mut missing = Vec::new();

        for caps in PYTHON_IMPORT_RE.captures_iter(content) {
            let Some(list) = caps.get(1) else { continue };
            for item in list.as_str().split(',') {
                let module = item.split_whitespace().next().unwrap_or("");
                let top = module.split('.').next().unwrap_or("");
                if !top.is_empty() && !self.python_top_level(top) {
                    missing.push(Unresolved {
                        line: line_of(content, list.start()),
                        name: module.to_string(),
                    });
                }
            }
        }

        for caps in PYTHON_FROM_RE.captures_iter(content) {
            let dots = caps.get(1).map(|m| m.as_str().len()).unwrap_or(0);
            let module = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            let offset = caps.get(0).map(|m| m.start()).unwrap_or(0);
            let top = module.split('.').next().unwrap_or("");

            let resolved = if dots > 0 {
                top.is_empty() || self.python_relative(file, dots, top)
            } else {
                self.python_top_level(top)
            };
            if !resolved {
                missing.push(Unresolved {
                    line: line_of(content, offset),
                    name: format!("{}{}", ".".repeat(dots), module),
                });
            }
        }

        missing
    }

    fn python_top_level(&self, top: &str) -> bool {
        if PYTHON_STDLIB.contains(&top) || self.manifest.contains(top) {
            return true;
        }
        if let Some((_, dist)) = PYTHON_ALIASES.iter().find(|(import, _)| *import == top) {
            if self.manifest.contains(dist) {
                return true;
            }
        }
        self.has_module_file(top, &[".py", ".pyi"])
    }

    fn python_relative(&self, file: &str, dots: usize, top: &str) -> bool {
        let mut dir: Vec<&str> = file.split('/').collect();
        dir.pop();
        for _ in 1..dots {
            if dir.pop().is_none() {
                return false;
            }
        }
        let base = dir.join("/");
        let prefix = if base.is_empty() {
            top.to_string()
        } else {
            format!("{}/{}", base, top)
        };
        self.paths.contains(&format!("{}.py", prefix))
            || self.paths.iter().any(|p| p.starts_with(&format!("{}/", prefix)))
    }

    fn rust(&self, content: &str) -> Vec<Unresolved> {
        let mut missing = Vec::new();
        for caps in RUST_USE_RE.captures_iter(content) {
            let Some(name) = caps.get(1) else { continue };
            let root = name.as_str();
            if RUST_ROOTS.contains(&root)
                || self.manifest.contains(root)
                || self.has_module_file(root, &[".rs"])
                || declares_item(content, root)
            {
                continue;
            }
            missing.push(Unresolved {
                line: line_of(content, name.start()),
                name: root.to_string(),
            });
        }
        missing
    }

    fn js(&self, file: &str, content: &str) -> Vec<Unresolved> {
        let mut missing = Vec::new();
        for caps in JS_IMPORT_RE.captures_iter(content) {
            let Some(spec) = caps.get(1) else { continue };
            if !self.js_specifier(file, spec.as_str()) {
                missing.push(Unresolved {
                    line: line_of(content, spec.start()),
                    name: spec.as_str().to_string(),
                });
            }
        }
        missing
    }

    fn js_specifier(&self, file: &str, spec: &str) -> bool {
        if spec.starts_with("node:") {
            return true;
        }
        if spec.starts_with('.') {
            let mut dir: Vec<&str> = file.split('/').collect();
            dir.pop();
            let Some(target) = join_relative(&dir, spec) else {
                return false;
            };
            return JS_EXTENSIONS
                .iter()
                .any(|ext| self.paths.contains(&format!("{}{}", target, ext)));
        }
        if spec.starts_with('/') {
            return false;
        }

        let mut parts = spec.split('/');
        let first = parts.next().unwrap_or("");
        let package = if first.starts_with('@') {
            match parts.next() {
                Some(second) => format!("{}/{}", first, second),
                None => first.to_string(),
            }
        } else {
            first.to_string()
        };

        NODE_BUILTINS.contains(&first)
            || self.manifest.contains(&package)
            || JS_EXTENSIONS
                .iter()
                .any(|ext| self.paths.contains(&format!("{}{}", spec, ext)))
    }
}

/// True if `content` itself defines an item called `name`.
fn declares_item(content: &str, name: &str) -> bool {
    let pattern = format!(
        r"\b(?:mod|enum|struct|trait|type|fn|const|static|union)\s+{}\b",
        regex::escape(name)
    );
    Regex::new(&pattern)
        .map(|re| re.is_match(content))
        .unwrap_or(false)
}

/// Joins a `./` or `../` specifier onto `dir`. `None` if it leaves the root.
fn join_relative(dir: &[&str], spec: &str) -> Option<String> {
    let mut parts: Vec<&str> = dir.iter().copied().filter(|s| !s.is_empty()).collect();
    for segment in spec.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}
