// parser.rs — Parser for the re-emission notation and symbolic text
//
// Parses a token stream (from the lexer) into a `Script` AST, and parses the
// symbolic sub-language into `Expr` / `Range`. Uses chumsky combinators; the
// expression grammar is shared between scripts and standalone symbolic text.
//
// Preconditions: input is a valid token stream from `lexer::lex()` /
//                `lexer::lex_inline()`.
// Postconditions: `parse` returns an AST plus any parse errors (non-fatal);
//                 `parse_expr` / `parse_range` return canonical values.
// Failure modes: syntax errors produce `Rich` diagnostics (`ExprParseError`
//                for symbolic text).
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::ast::*;
use crate::lexer::{LexResult, Token};
use crate::subset::{Dim, Range};
use crate::symbolic::{Expr, ExprParseError};

/// Result of parsing: AST plus any errors.
#[derive(Debug)]
pub struct ParseResult {
    pub script: Option<Script>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

/// Parse a script. Lexes then parses.
pub fn parse(source: &str) -> ParseResult {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();
    let lex_errors = lex_errors(&lex_result);

    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = script_parser(source);
    let (script, parse_errors) = parser.parse(stream).into_output_errors();

    let mut errors = lex_errors;
    errors.extend(parse_errors.into_iter().map(|e| e.into_owned()));
    ParseResult { script, errors }
}

/// Parse symbolic expression text such as `N - 1` or `min(i + 4, N)`.
pub fn parse_expr(text: &str) -> Result<Expr, ExprParseError> {
    let lex_result = crate::lexer::lex_inline(text);
    if let Some(err) = lex_result.errors.first() {
        return Err(expr_error(text, err.message.clone()));
    }
    let len = text.len();
    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));
    expr_parser(text)
        .parse(stream)
        .into_result()
        .map_err(|errs| expr_error(text, join_errors(&errs)))
}

/// Parse subset text such as `0:N, i` (exclusive stops, optional steps).
pub fn parse_range(text: &str) -> Result<Range, ExprParseError> {
    let lex_result = crate::lexer::lex_inline(text);
    if let Some(err) = lex_result.errors.first() {
        return Err(expr_error(text, err.message.clone()));
    }
    let len = text.len();
    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));
    range_parser(text)
        .parse(stream)
        .into_result()
        .map_err(|errs| expr_error(text, join_errors(&errs)))
}

fn expr_error(text: &str, message: String) -> ExprParseError {
    ExprParseError {
        text: text.to_string(),
        message,
    }
}

fn join_errors(errs: &[Rich<'_, Token, SimpleSpan>]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn lex_errors(lex_result: &LexResult) -> Vec<Rich<'static, Token, SimpleSpan>> {
    lex_result
        .errors
        .iter()
        .map(|e| {
            let span: SimpleSpan = (e.span.start..e.span.end).into();
            Rich::custom(span, e.message.clone())
        })
        .collect()
}

// ── Symbolic sub-language ──

#[derive(Clone, Copy)]
enum MulOp {
    Mul,
    FloorDiv,
    Mod,
}

fn expr_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, Expr, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + Clone + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    let name = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        source[span.start()..span.end()].to_string()
    });

    recursive(move |expr| {
        let call_args = expr
            .clone()
            .separated_by(just(Token::Comma))
            .at_least(1)
            .collect::<Vec<Expr>>()
            .delimited_by(just(Token::LParen), just(Token::RParen));

        let symbol_or_call = name
            .clone()
            .then(call_args.or_not())
            .try_map(|(n, args), span| match (n.as_str(), args.as_deref()) {
                (_, None) => Ok(Expr::sym(n.clone())),
                ("min", Some([a, b])) => Ok(Expr::min(a, b)),
                ("max", Some([a, b])) => Ok(Expr::max(a, b)),
                _ => Err(Rich::custom(span, format!("unknown function '{n}'"))),
            });

        let atom = select! { Token::Int(v) => Expr::int(v) }
            .or(symbol_or_call)
            .or(expr
                .clone()
                .delimited_by(just(Token::LParen), just(Token::RParen)));

        let unary = just(Token::Minus)
            .repeated()
            .foldr(atom, |_, e: Expr| Expr::neg(&e));

        let mul_op = choice((
            just(Token::Star).to(MulOp::Mul),
            just(Token::SlashSlash).to(MulOp::FloorDiv),
            just(Token::Percent).to(MulOp::Mod),
        ));
        let product = unary
            .clone()
            .foldl(mul_op.then(unary).repeated(), |a, (op, b)| match op {
                MulOp::Mul => Expr::mul(&a, &b),
                MulOp::FloorDiv => Expr::floordiv(&a, &b),
                MulOp::Mod => Expr::modulo(&a, &b),
            });

        let add_op = just(Token::Plus).to(true).or(just(Token::Minus).to(false));
        product
            .clone()
            .foldl(add_op.then(product).repeated(), |a, (plus, b)| {
                if plus {
                    Expr::add(&a, &b)
                } else {
                    Expr::sub(&a, &b)
                }
            })
    })
}

fn range_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, Range, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + Clone + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    let expr = expr_parser(source);
    let dim = expr
        .clone()
        .then(
            just(Token::Colon)
                .ignore_then(expr)
                .repeated()
                .at_most(2)
                .collect::<Vec<Expr>>(),
        )
        .map(|(start, rest)| {
            let mut rest = rest.into_iter();
            match (rest.next(), rest.next()) {
                (None, _) => Dim::index(start),
                (Some(stop), None) => Dim::span(start, &stop),
                (Some(stop), Some(step)) => Dim::new(start, Expr::sub(&stop, &Expr::one()), step),
            }
        });
    dim.separated_by(just(Token::Comma))
        .at_least(1)
        .collect::<Vec<Dim>>()
        .map(Range::new)
}

// ── Script parser ──

/// What follows `for <params> in`.
#[derive(Clone)]
enum ForKind {
    Map(Range),
    Pipeline(Range),
    Consume {
        stream: Ident,
        num_pes: Expr,
        condition: Option<String>,
    },
    Loop {
        init: String,
        condition: String,
        update: String,
    },
}
//
// All grammar rules are built inside `script_parser` so that the `source`
// reference is captured once and shared by all combinators.

fn script_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, Script, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    let nl = just(Token::Newline);
    let expr = expr_parser(source);
    let range = range_parser(source);

    // ── Identifier ──

    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        Ident {
            name: source[span.start()..span.end()].to_string(),
            span,
        }
    });
    let ident_kw = ident.clone();
    let keyword = move |word: &'static str| ident_kw.clone().filter(move |id: &Ident| id.name == word);

    let string = select! { Token::StringLit(s) => s };

    let expr_list = expr
        .clone()
        .separated_by(just(Token::Comma))
        .collect::<Vec<Expr>>()
        .delimited_by(just(Token::LBracket), just(Token::RBracket));

    // ── Memlet: IDENT ( '(' expr ',' IDENT ')' )? ( '[' range ']' )? ──

    let wcr = expr
        .clone()
        .then_ignore(just(Token::Comma))
        .then(ident.clone().map(|id| id.name))
        .delimited_by(just(Token::LParen), just(Token::RParen));
    let memlet = ident
        .clone()
        .then(wcr.or_not())
        .then(
            range
                .clone()
                .delimited_by(just(Token::LBracket), just(Token::RBracket))
                .or_not(),
        )
        .map_with(|((data, wcr), subset), e| MemletRef {
            data,
            wcr,
            subset,
            span: e.span(),
        });

    // ── Connector block of `with tasklet/library` ──

    let direction = just(Token::ShiftLeft)
        .to(Direction::In)
        .or(just(Token::ShiftRight).to(Direction::Out));
    let connector = ident
        .clone()
        .then(direction)
        .then(memlet.clone())
        .map(|((name, direction), memlet)| Some(Connector {
            name,
            direction,
            memlet,
        }))
        .or(just(Token::Pass).to(None))
        .then_ignore(nl.clone());
    let connectors = connector
        .repeated()
        .at_least(1)
        .collect::<Vec<Option<Connector>>>()
        .delimited_by(just(Token::Indent), just(Token::Dedent))
        .map(|items| items.into_iter().flatten().collect::<Vec<Connector>>());

    let tasklet = just(Token::With)
        .ignore_then(just(Token::Tasklet))
        .ignore_then(string.clone().delimited_by(just(Token::LParen), just(Token::RParen)))
        .then_ignore(just(Token::Colon))
        .then_ignore(nl.clone())
        .then(connectors.clone())
        .map(|(code, connectors)| StmtKind::Tasklet { code, connectors });

    let property = ident
        .clone()
        .then_ignore(just(Token::Equals))
        .then(string.clone());
    let library = just(Token::With)
        .ignore_then(just(Token::Library))
        .ignore_then(
            string
                .clone()
                .then(
                    just(Token::Comma)
                        .ignore_then(property)
                        .repeated()
                        .collect::<Vec<(Ident, String)>>(),
                )
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .then_ignore(just(Token::Colon))
        .then_ignore(nl.clone())
        .then(connectors)
        .map(|((op, properties), connectors)| StmtKind::Library {
            op,
            properties,
            connectors,
        });

    // ── Simple statements ──

    let label = just(Token::Label)
        .ignore_then(ident.clone())
        .then_ignore(just(Token::Colon))
        .map(StmtKind::Label);

    let goto = just(Token::Goto).ignore_then(ident.clone()).map(|target| {
        if target.name == "exit" {
            StmtKind::Goto(None)
        } else {
            StmtKind::Goto(Some(target))
        }
    });

    let assign = just(Token::Assign)
        .ignore_then(ident.clone())
        .then_ignore(just(Token::Equals))
        .then(string.clone())
        .map(|(name, value)| StmtKind::Assign { name, value });

    let copy = just(Token::Copy)
        .ignore_then(
            keyword("src")
                .ignore_then(just(Token::Equals))
                .ignore_then(memlet.clone())
                .then_ignore(just(Token::Comma))
                .then_ignore(keyword("dst"))
                .then_ignore(just(Token::Equals))
                .then(memlet.clone())
                .then(
                    just(Token::Comma)
                        .ignore_then(keyword("wcr"))
                        .ignore_then(just(Token::Equals))
                        .ignore_then(string.clone())
                        .or_not(),
                )
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .map(|((src, dst), wcr)| StmtKind::Copy { src, dst, wcr });

    let dscopy = just(Token::DsCopy)
        .ignore_then(
            keyword("src")
                .ignore_then(just(Token::Equals))
                .ignore_then(memlet.clone())
                .then_ignore(just(Token::Comma))
                .then_ignore(keyword("dst"))
                .then_ignore(just(Token::Equals))
                .then(ident.clone())
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .map(|(src, dst)| StmtKind::DynScopeCopy { src, dst });

    // IDENT '=' (ndarray | scalar | view | nview | refset) '(' ... ')'
    let ndarray = just(Token::NdArray)
        .ignore_then(
            expr_list
                .clone()
                .then_ignore(just(Token::Comma))
                .then(ident.clone())
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .map(|(shape, dtype)| (Some(shape), dtype));
    let scalar = just(Token::Scalar)
        .ignore_then(ident.clone().delimited_by(just(Token::LParen), just(Token::RParen)))
        .map(|dtype| (None, dtype));
    let decl = ident
        .clone()
        .then_ignore(just(Token::Equals))
        .then(ndarray.or(scalar))
        .map(|(name, (shape, dtype))| StmtKind::Decl { name, dtype, shape });

    let view_kind = just(Token::View).to(false).or(just(Token::NView).to(true));
    let view = ident
        .clone()
        .then_ignore(just(Token::Equals))
        .then(view_kind)
        .then(
            memlet
                .clone()
                .then_ignore(just(Token::Comma))
                .then(expr_list.clone())
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .map(|((name, nested), (source, shape))| StmtKind::View {
            name,
            source,
            shape,
            nested,
        });

    let refset = ident
        .clone()
        .then_ignore(just(Token::Equals))
        .then_ignore(just(Token::RefSet))
        .then(memlet.clone().delimited_by(just(Token::LParen), just(Token::RParen)))
        .map(|(name, source)| StmtKind::RefSet { name, source });

    let simple = choice((
        label,
        goto,
        assign,
        just(Token::Break).to(StmtKind::Break),
        just(Token::Continue).to(StmtKind::Continue),
        just(Token::Pass).to(StmtKind::Pass),
        copy,
        dscopy,
        decl,
        view,
        refset,
    ))
    .then_ignore(nl.clone());

    // ── Scope headers ──

    let params = ident
        .clone()
        .separated_by(just(Token::Comma))
        .at_least(1)
        .collect::<Vec<Ident>>();
    let bracket_range = range
        .clone()
        .delimited_by(just(Token::LBracket), just(Token::RBracket));

    let for_kind = choice((
        just(Token::Map)
            .ignore_then(bracket_range.clone())
            .map(ForKind::Map),
        just(Token::Pipeline)
            .ignore_then(bracket_range)
            .map(ForKind::Pipeline),
        just(Token::Consume)
            .ignore_then(
                ident
                    .clone()
                    .then_ignore(just(Token::Comma))
                    .then(expr.clone())
                    .then(just(Token::Comma).ignore_then(string.clone()).or_not())
                    .delimited_by(just(Token::LParen), just(Token::RParen)),
            )
            .map(|((stream, num_pes), condition)| ForKind::Consume {
                stream,
                num_pes,
                condition,
            }),
        just(Token::Loop)
            .ignore_then(
                string
                    .clone()
                    .then_ignore(just(Token::Comma))
                    .then(string.clone())
                    .then_ignore(just(Token::Comma))
                    .then(string.clone())
                    .delimited_by(just(Token::LParen), just(Token::RParen)),
            )
            .map(|((init, condition), update)| ForKind::Loop {
                init,
                condition,
                update,
            }),
    ));

    let for_header = just(Token::For)
        .ignore_then(params)
        .then_ignore(just(Token::In))
        .then(for_kind)
        .try_map(|(mut params, kind), span| {
            let mut single = || {
                if params.len() == 1 {
                    Ok(params.remove(0))
                } else {
                    Err(Rich::custom(span, "expected exactly one loop variable"))
                }
            };
            match kind {
                ForKind::Map(range) => Ok(ScopeHeader::Map { params, range }),
                ForKind::Pipeline(range) => Ok(ScopeHeader::Pipeline { params, range }),
                ForKind::Consume {
                    stream,
                    num_pes,
                    condition,
                } => Ok(ScopeHeader::Consume {
                    pe_index: single()?,
                    stream,
                    num_pes,
                    condition,
                }),
                ForKind::Loop {
                    init,
                    condition,
                    update,
                } => Ok(ScopeHeader::Loop {
                    var: single()?,
                    init,
                    condition,
                    update,
                }),
            }
        });

    let header = choice((
        for_header,
        just(Token::While).ignore_then(string.clone()).map(ScopeHeader::While),
        just(Token::Do)
            .ignore_then(just(Token::While))
            .ignore_then(string.clone())
            .map(ScopeHeader::DoWhile),
        just(Token::If).ignore_then(string.clone()).map(ScopeHeader::If),
        just(Token::Elif).ignore_then(string.clone()).map(ScopeHeader::Elif),
        just(Token::Else).to(ScopeHeader::Else),
        just(Token::StateIf).ignore_then(string.clone()).map(ScopeHeader::StateIf),
        just(Token::GBlock).to(ScopeHeader::GBlock),
    ));

    // ── Statements ──

    let stmt = recursive(move |stmt| {
        let block = stmt
            .repeated()
            .at_least(1)
            .collect::<Vec<Stmt>>()
            .delimited_by(just(Token::Indent), just(Token::Dedent));
        let scope = header
            .then_ignore(just(Token::Colon))
            .then_ignore(just(Token::Newline))
            .then(block)
            .map(|(header, body)| StmtKind::Scope { header, body });
        choice((scope, tasklet, library, simple))
            .map_with(|kind, e| Stmt {
                kind,
                span: e.span(),
            })
            .boxed()
    });

    let body = stmt
        .repeated()
        .at_least(1)
        .collect::<Vec<Stmt>>()
        .delimited_by(just(Token::Indent), just(Token::Dedent));

    // ── Header: symbols, `@program`, `def name(params):` ──

    let symbol_decl = ident
        .clone()
        .then_ignore(just(Token::Equals))
        .then_ignore(just(Token::Symbol))
        .then(
            string
                .clone()
                .ignore_then(just(Token::Comma))
                .ignore_then(ident.clone())
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .then_ignore(nl.clone())
        .map_with(|(name, dtype), e| SymbolDecl {
            name,
            dtype,
            span: e.span(),
        });

    let param = ident
        .clone()
        .then_ignore(just(Token::Colon))
        .then(ident.clone())
        .then(expr_list.or_not())
        .map_with(|((name, dtype), shape), e| Param {
            name,
            dtype,
            shape,
            span: e.span(),
        });

    symbol_decl
        .repeated()
        .collect::<Vec<SymbolDecl>>()
        .then_ignore(just(Token::At))
        .then_ignore(keyword("program"))
        .then_ignore(nl.clone())
        .then_ignore(just(Token::Def))
        .then(ident.clone())
        .then(
            param
                .separated_by(just(Token::Comma))
                .collect::<Vec<Param>>()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .then_ignore(just(Token::Colon))
        .then_ignore(nl)
        .then(body)
        .map_with(|(((symbols, name), params), body), e| Script {
            symbols,
            name,
            params,
            body,
            span: e.span(),
        })
}

// ── Tests ──
