//! Front end of the software platform's kernel compiler.
//!
//! This is not a C compiler. It checks what a build can reasonably reject
//! without type information (lexical structure, delimiter balance, kernel
//! signatures) and records each kernel's parameter list so that entry points
//! can be resolved against host reference implementations.

use logos::{Filter, Lexer, Logos};
use std::collections::HashMap;
use std::fmt;

/// One compiler error, positioned in the submitted text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<source>:{}:{}: error: {}", self.line, self.column, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpace {
    Global,
    Local,
    Constant,
    Private,
}

impl AddressSpace {
    fn parse(word: &str) -> Option<Self> {
        match word {
            "__global" | "global" => Some(AddressSpace::Global),
            "__local" | "local" => Some(AddressSpace::Local),
            "__constant" | "constant" => Some(AddressSpace::Constant),
            "__private" | "private" => Some(AddressSpace::Private),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub type_name: String,
    pub address_space: Option<AddressSpace>,
    pub pointer: bool,
    /// Bytes a by-value argument occupies, when its type is known.
    pub value_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSignature {
    pub name: String,
    pub params: Vec<Param>,
}

/// Kernels found in a program that built cleanly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledProgram {
    kernels: Vec<KernelSignature>,
}

impl CompiledProgram {
    pub fn kernel(&self, name: &str) -> Option<&KernelSignature> {
        self.kernels.iter().find(|k| k.name == name)
    }

    pub fn kernels(&self) -> &[KernelSignature] {
        &self.kernels
    }
}

/// Join diagnostics into a build log, one per line.
pub fn render_log(diagnostics: &[Diagnostic]) -> String {
    let mut log = String::new();
    for diag in diagnostics {
        log.push_str(&diag.to_string());
        log.push('\n');
    }
    log.push_str(&format!(
        "{} error{} generated.\n",
        diagnostics.len(),
        if diagnostics.len() == 1 { "" } else { "s" }
    ));
    log
}

pub fn compile(source: &str) -> Result<CompiledProgram, Vec<Diagnostic>> {
    let mut diagnostics = Vec::new();
    let lines = LineIndex::new(source);
    let tokens = lex(source, &lines, &mut diagnostics);
    check_delimiters(&tokens, &lines, &mut diagnostics);
    let structs = collect_struct_sizes(&tokens);
    let kernels = collect_kernels(&tokens, &structs, &mut diagnostics);

    if diagnostics.is_empty() {
        Ok(CompiledProgram { kernels })
    } else {
        Err(diagnostics)
    }
}

#[derive(Logos, Debug, Clone, PartialEq, Eq)]
#[logos(skip r"\s+|//[^\n]*|#[^\n]*")]
enum TokenKind {
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[regex(r"[0-9][A-Za-z0-9_.]*")]
    Number,

    #[regex(r#""([^"\\\n]|\\.)*""#)]
    #[regex(r"'([^'\\\n]|\\.)*'")]
    Literal,

    /// A quote with no closing partner on its line.
    #[regex(r#""([^"\\\n]|\\.)*"#, |_| '"')]
    #[regex(r"'([^'\\\n]|\\.)*", |_| '\'')]
    OpenLiteral(char),

    /// A block comment still open at the end of the text.
    #[token("/*", block_comment)]
    OpenComment,

    #[token("/", |_| '/')]
    #[regex(r"[!$%&()*+,\-.:;<=>?@\[\\\]^`{|}~]", |lex| lex.slice().chars().next())]
    Punct(char),
}

fn block_comment(lex: &mut Lexer<'_, TokenKind>) -> Filter<()> {
    match lex.remainder().find("*/") {
        Some(end) => {
            lex.bump(end + 2);
            Filter::Skip
        }
        None => {
            lex.bump(lex.remainder().len());
            Filter::Emit(())
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    line: usize,
    column: usize,
}

impl Token {
    fn ident(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Ident(word) => Some(word),
            _ => None,
        }
    }

    fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct(c)
    }

    fn error(&self, message: impl Into<String>) -> Diagnostic {
        Diagnostic {
            line: self.line,
            column: self.column,
            message: message.into(),
        }
    }
}

/// Maps byte offsets to 1-based line and column.
struct LineIndex<'a> {
    source: &'a str,
    starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    fn new(source: &'a str) -> Self {
        let mut starts = vec![0];
        starts.extend(source.match_indices('\n').map(|(i, _)| i + 1));
        Self { source, starts }
    }

    fn position(&self, offset: usize) -> (usize, usize) {
        let line = self.starts.partition_point(|&start| start <= offset).max(1);
        let start = self.starts[line - 1];
        let column = self
            .source
            .get(start..offset)
            .map_or(0, |text| text.chars().count());
        (line, column + 1)
    }

    fn end(&self) -> (usize, usize) {
        self.position(self.source.len())
    }
}

fn lex(source: &str, lines: &LineIndex<'_>, diagnostics: &mut Vec<Diagnostic>) -> Vec<Token> {
    let mut tokens = Vec::new();

    for (kind, span) in TokenKind::lexer(source).spanned() {
        let (line, column) = lines.position(span.start);
        let message = match kind {
            Ok(TokenKind::OpenComment) => "unterminated /* comment".to_string(),
            Ok(TokenKind::OpenLiteral(quote)) => {
                format!("missing terminating {} character", quote)
            }
            Ok(kind) => {
                tokens.push(Token { kind, line, column });
                continue;
            }
            Err(()) => {
                let c = source.get(span).and_then(|s| s.chars().next());
                format!("unexpected character '{}'", c.unwrap_or('?'))
            }
        };
        diagnostics.push(Diagnostic {
            line,
            column,
            message,
        });
    }

    tokens
}

fn closer_for(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

fn opener_for(close: char) -> char {
    match close {
        ')' => '(',
        ']' => '[',
        _ => '{',
    }
}

fn check_delimiters(tokens: &[Token], lines: &LineIndex<'_>, diagnostics: &mut Vec<Diagnostic>) {
    let mut open: Vec<&Token> = Vec::new();

    for token in tokens {
        let c = match token.kind {
            TokenKind::Punct(c) => c,
            _ => continue,
        };
        match c {
            '(' | '[' | '{' => open.push(token),
            ')' | ']' | '}' => match open.last() {
                Some(top) if top.is_punct(opener_for(c)) => {
                    open.pop();
                }
                Some(top) => {
                    let expected = match top.kind {
                        TokenKind::Punct(o) => closer_for(o),
                        _ => '}',
                    };
                    diagnostics.push(token.error(format!("expected '{}'", expected)));
                    open.pop();
                }
                None => diagnostics.push(token.error(format!("extraneous closing '{}'", c))),
            },
            _ => {}
        }
    }

    let (end_line, end_column) = lines.end();
    for token in open.into_iter().rev() {
        if let TokenKind::Punct(o) = token.kind {
            diagnostics.push(Diagnostic {
                line: end_line,
                column: end_column,
                message: format!(
                    "expected '{}' to match '{}' at {}:{}",
                    closer_for(o),
                    o,
                    token.line,
                    token.column
                ),
            });
        }
    }
}

/// Size in bytes of an OpenCL C scalar type.
fn scalar_size(type_name: &str) -> Option<usize> {
    match type_name {
        "char" | "uchar" | "unsigned char" => Some(1),
        "short" | "ushort" | "unsigned short" => Some(2),
        "int" | "uint" | "unsigned int" | "unsigned" | "float" => Some(4),
        "long" | "ulong" | "unsigned long" | "double" => Some(8),
        _ => None,
    }
}

/// Sizes of the `struct` definitions made only of scalar fields, laid out
/// with natural alignment.
fn collect_struct_sizes(tokens: &[Token]) -> HashMap<String, usize> {
    let mut sizes = HashMap::new();
    let mut pos = 0;

    while pos + 2 < tokens.len() {
        let opens_body = tokens[pos].ident() == Some("struct") && tokens[pos + 2].is_punct('{');
        let Some(tag) = tokens[pos + 1].ident().filter(|_| opens_body) else {
            pos += 1;
            continue;
        };
        let body = &tokens[pos + 3..];
        let Some(len) = body.iter().position(|t| t.is_punct('}')) else {
            break;
        };
        if let Some(size) = struct_size(&body[..len]) {
            sizes.insert(tag.to_string(), size);
        }
        pos += 3 + len + 1;
    }

    sizes
}

fn struct_size(fields: &[Token]) -> Option<usize> {
    let mut offset = 0usize;
    let mut align = 1usize;

    for field in fields.split(|t| t.is_punct(';')).filter(|f| !f.is_empty()) {
        // Pointers, arrays and multiple declarators are not laid out here.
        let words: Option<Vec<&str>> = field.iter().map(Token::ident).collect();
        let words = words?;
        let (_, type_words) = words.split_last()?;
        let size = scalar_size(&type_words.join(" "))?;
        offset = (offset + size - 1) / size * size + size;
        align = align.max(size);
    }

    if offset == 0 {
        return None;
    }
    Some((offset + align - 1) / align * align)
}

fn collect_kernels(
    tokens: &[Token],
    structs: &HashMap<String, usize>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<KernelSignature> {
    let mut kernels: Vec<KernelSignature> = Vec::new();
    let mut pos = 0;

    while pos < tokens.len() {
        let is_kernel = matches!(tokens[pos].ident(), Some("__kernel") | Some("kernel"));
        if !is_kernel {
            pos += 1;
            continue;
        }
        let qualifier = &tokens[pos];
        pos += 1;

        match tokens.get(pos).and_then(Token::ident) {
            Some("void") => pos += 1,
            Some(_) => {
                diagnostics.push(tokens[pos].error("kernel must have void return type"));
                continue;
            }
            None => {
                diagnostics.push(qualifier.error("expected a return type after kernel qualifier"));
                continue;
            }
        }

        let name_token = match tokens.get(pos) {
            Some(token) if token.ident().is_some() => token,
            _ => {
                diagnostics.push(qualifier.error("expected kernel name"));
                continue;
            }
        };
        let name = name_token.ident().unwrap_or_default().to_string();
        pos += 1;

        if !tokens.get(pos).map_or(false, |t| t.is_punct('(')) {
            diagnostics.push(name_token.error(format!("expected '(' after '{}'", name)));
            continue;
        }
        pos += 1;

        let params_start = pos;
        let mut depth = 1;
        while pos < tokens.len() && depth > 0 {
            if tokens[pos].is_punct('(') {
                depth += 1;
            } else if tokens[pos].is_punct(')') {
                depth -= 1;
            }
            pos += 1;
        }
        if depth > 0 {
            // Reported by the delimiter check.
            break;
        }
        let params_tokens = &tokens[params_start..pos - 1];

        match tokens.get(pos) {
            Some(t) if t.is_punct('{') => {}
            // A prototype declares nothing runnable.
            Some(t) if t.is_punct(';') => continue,
            Some(t) => {
                diagnostics.push(t.error(format!("expected function body after '{}'", name)));
                continue;
            }
            None => {
                let message = format!("expected function body after '{}'", name);
                diagnostics.push(name_token.error(message));
                continue;
            }
        }

        let mut params = parse_params(params_tokens, diagnostics);
        for param in params.iter_mut().filter(|p| !p.pointer) {
            param.value_size = match param.type_name.strip_prefix("struct ") {
                Some(tag) => structs.get(tag).copied(),
                None => scalar_size(&param.type_name),
            };
        }
        if kernels.iter().any(|k| k.name == name) {
            diagnostics.push(name_token.error(format!("redefinition of '{}'", name)));
            continue;
        }
        kernels.push(KernelSignature { name, params });
    }

    kernels
}

fn parse_params(tokens: &[Token], diagnostics: &mut Vec<Diagnostic>) -> Vec<Param> {
    let mut params = Vec::new();

    let is_void = tokens.len() == 1 && tokens[0].ident() == Some("void");
    if tokens.is_empty() || is_void {
        return params;
    }

    for chunk in tokens.split(|t| t.is_punct(',')) {
        let Some(first) = chunk.first() else {
            diagnostics.push(tokens[0].error("expected parameter declarator"));
            continue;
        };

        let mut address_space = None;
        let mut words = Vec::new();
        let mut pointer = false;
        for token in chunk {
            if token.is_punct('*') {
                pointer = true;
            } else if let Some(word) = token.ident() {
                match AddressSpace::parse(word) {
                    Some(space) => address_space = Some(space),
                    None if matches!(word, "const" | "volatile" | "restrict") => {}
                    None => words.push(word.to_string()),
                }
            }
        }

        if words.len() < 2 {
            diagnostics.push(first.error("expected parameter type and name"));
            continue;
        }
        let name = words.pop().unwrap_or_default();

        let address_ok = matches!(
            address_space,
            Some(AddressSpace::Global) | Some(AddressSpace::Local) | Some(AddressSpace::Constant)
        );
        if pointer && !address_ok {
            diagnostics.push(first.error(format!(
                "pointer argument '{}' to a kernel function must reside in \
                 '__global', '__constant' or '__local' address space",
                name
            )));
            continue;
        }

        params.push(Param {
            name,
            type_name: words.join(" "),
            address_space,
            pointer,
            value_size: None,
        });
    }

    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::PACKED_INDEX_SOURCE;

    #[test]
    fn test_packed_index_source_compiles() {
        let program = compile(PACKED_INDEX_SOURCE).unwrap();
        let kernel = program.kernel("entry_point").unwrap();
        assert_eq!(kernel.params.len(), 1);
        assert_eq!(kernel.params[0].name, "C");
        assert_eq!(kernel.params[0].type_name, "int");
        assert_eq!(kernel.params[0].address_space, Some(AddressSpace::Global));
        assert!(kernel.params[0].pointer);
    }

    #[test]
    fn test_missing_brace() {
        let diags = compile("__kernel void f(__global int *c) {\n    c[0] = 1;\n").unwrap_err();
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.starts_with("expected '}'"));
        assert_eq!(diags[0].line, 3);
    }

    #[test]
    fn test_non_void_kernel() {
        let diags = compile("__kernel int f(__global int *c) { return 0; }").unwrap_err();
        assert!(diags[0].message.contains("void return type"));
        assert_eq!((diags[0].line, diags[0].column), (1, 10));
    }

    #[test]
    fn test_private_pointer_rejected() {
        let diags = compile("kernel void f(int *c) { }").unwrap_err();
        assert!(diags[0].message.contains("address space"));
    }

    #[test]
    fn test_comments_and_directives() {
        let source = "#define N 8\n/* block ( */\n// line {\n\
                      kernel void a(void) { }\nkernel void b() { }\n";
        let program = compile(source).unwrap();
        assert_eq!(program.kernels().len(), 2);
        assert!(program.kernel("a").unwrap().params.is_empty());

        let diags = compile("kernel void a() { } /* open").unwrap_err();
        assert_eq!(diags[0].message, "unterminated /* comment");
    }

    #[test]
    fn test_literals_and_positions() {
        let diags = compile("kernel void a() {\n  x = \"open;\n}").unwrap_err();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].message, "missing terminating \" character");
        assert_eq!((diags[0].line, diags[0].column), (2, 7));

        let source = "kernel void a() { x = 'c'; y = \"s\\\"t\"; z = 1.5f; }";
        assert!(compile(source).unwrap().kernel("a").is_some());

        let diags = compile("kernel void a() { \u{7} }").unwrap_err();
        assert_eq!(diags[0].message, "unexpected character '\u{7}'");
        assert_eq!((diags[0].line, diags[0].column), (1, 19));
    }

    #[test]
    fn test_by_value_arguments() {
        let program = compile(crate::kernel::COLOR_SUM_SOURCE).unwrap();
        let params = &program.kernel("entry_point").unwrap().params;
        assert_eq!(params.len(), 3);
        assert_eq!(params[1].type_name, "struct color");
        assert!(!params[1].pointer);
        assert_eq!(params[1].value_size, Some(12));
        assert_eq!(params[2].value_size, None);

        let program = compile(
            "struct mixed { char tag; int count; };\n\
             kernel void k(struct mixed m, const uint n, float4 v) { }",
        )
        .unwrap();
        let params = &program.kernel("k").unwrap().params;
        assert_eq!(params[0].value_size, Some(8));
        assert_eq!(params[1].type_name, "uint");
        assert_eq!(params[1].value_size, Some(4));
        assert_eq!(params[2].value_size, None);
    }

    #[test]
    fn test_prototypes_and_redefinition() {
        let program = compile("kernel void a(global int *x);").unwrap();
        assert!(program.kernels().is_empty());

        let diags = compile("kernel void a() { }\nkernel void a() { }").unwrap_err();
        assert_eq!(diags[0].message, "redefinition of 'a'");
    }

    #[test]
    fn test_render_log() {
        let diags = compile(") )").unwrap_err();
        let log = render_log(&diags);
        assert!(log.starts_with("<source>:1:1: error: extraneous closing ')'\n"));
        assert!(log.ends_with("2 errors generated.\n"));
    }
}
