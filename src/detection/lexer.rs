use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    And,
    Or,
    Not,
    LParen,
    RParen,
    /// Raw atomic clause text, whitespace-normalised, quotes preserved.
    Clause(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexError {
    #[error("unterminated string literal")]
    UnterminatedQuote,
}

/// Splits an expression into operator and clause tokens.
///
/// Operators are only recognised outside double-quoted literals. `AND`/`OR` are
/// whole words in any case; `NOT`/`NO` only count as operators where a new
/// operand starts, so `response not contains "x"` stays a single clause.
pub fn tokenize(input: &str) -> Result<Vec<Token>, LexError> {
    let words = split_words(input)?;
    let mut tokens = Vec::new();
    let mut clause: Vec<String> = Vec::new();
    let mut depth = 0usize;
    let mut clause_parens = 0isize;

    for word in words {
        let mut rest = word.as_str();

        if clause.is_empty() {
            while let Some(stripped) = rest.strip_prefix('(') {
                tokens.push(Token::LParen);
                depth += 1;
                rest = stripped;
            }
            if rest.is_empty() {
                continue;
            }
        }

        let (core, closers, balance) = split_group_closers(rest, clause_parens, depth);
        clause_parens = balance;

        if closers == 0 && !core.starts_with('"') {
            if core.eq_ignore_ascii_case("and") {
                flush(&mut clause, &mut tokens);
                clause_parens = 0;
                tokens.push(Token::And);
                continue;
            }
            if core.eq_ignore_ascii_case("or") {
                flush(&mut clause, &mut tokens);
                clause_parens = 0;
                tokens.push(Token::Or);
                continue;
            }
            if clause.is_empty() && (core.eq_ignore_ascii_case("not") || core.eq_ignore_ascii_case("no")) {
                tokens.push(Token::Not);
                continue;
            }
        }

        if !core.is_empty() {
            clause.push(core.to_string());
        }
        if closers > 0 {
            flush(&mut clause, &mut tokens);
            clause_parens = 0;
            for _ in 0..closers {
                tokens.push(Token::RParen);
            }
            depth -= closers;
        }
    }
    flush(&mut clause, &mut tokens);
    Ok(tokens)
}

fn flush(clause: &mut Vec<String>, tokens: &mut Vec<Token>) {
    if !clause.is_empty() {
        tokens.push(Token::Clause(clause.join(" ")));
        clause.clear();
    }
}

/// Whitespace-separated words; a quoted literal (with `\"` escapes) never splits.
fn split_words(input: &str) -> Result<Vec<String>, LexError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut escaped = false;

    for c in input.chars() {
        if in_quote {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quote = false;
            }
            continue;
        }
        if c == '"' {
            in_quote = true;
            current.push(c);
        } else if c.is_whitespace() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }

    if in_quote {
        return Err(LexError::UnterminatedQuote);
    }
    if !current.is_empty() {
        words.push(current);
    }
    Ok(words)
}

/// Separates trailing `)` characters that close an open group from the word.
/// Parentheses that belong to the clause itself (`tool_call_count(x)`, also
/// spread over several words) are kept. `open` is the paren balance of the
/// clause words seen so far; the clause balance after this word is returned.
fn split_group_closers(word: &str, open: isize, depth: usize) -> (&str, usize, isize) {
    let mut balance = open;
    let mut in_quote = false;
    let mut escaped = false;
    for c in word.chars() {
        if in_quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quote = false;
            }
            continue;
        }
        match c {
            '"' => in_quote = true,
            '(' => balance += 1,
            ')' => balance -= 1,
            _ => {}
        }
    }

    if balance >= 0 || depth == 0 {
        return (word, 0, balance.max(0));
    }
    let wanted = (balance.unsigned_abs()).min(depth);
    let trailing = word.chars().rev().take_while(|c| *c == ')').count();
    let closers = wanted.min(trailing);
    (&word[..word.len() - closers], closers, (balance + closers as isize).max(0))
}
