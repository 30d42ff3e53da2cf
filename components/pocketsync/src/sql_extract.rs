/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// Derives the set of tables a SQL statement reads or writes, so watchers
// know which notifications matter to them.  This is a small tokenizer, not
// a SQL parser: it over-approximates, which at worst means a watcher
// re-runs its query for a table it didn't actually touch.  Names introduced
// by `WITH <name> AS (...)` are excluded; the CTE bodies themselves are
// still scanned.

use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Punct(char),
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn tokenize(sql: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = sql.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            _ if c.is_whitespace() => {
                chars.next();
            }
            '-' => {
                chars.next();
                if chars.peek() == Some(&'-') {
                    // line comment
                    for c in chars.by_ref() {
                        if c == '\n' {
                            break;
                        }
                    }
                } else {
                    tokens.push(Token::Punct('-'));
                }
            }
            '/' => {
                chars.next();
                if chars.peek() == Some(&'*') {
                    chars.next();
                    let mut prev = '\0';
                    for c in chars.by_ref() {
                        if prev == '*' && c == '/' {
                            break;
                        }
                        prev = c;
                    }
                } else {
                    tokens.push(Token::Punct('/'));
                }
            }
            '\'' => {
                // string literal; '' escapes a quote
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\'' {
                        if chars.peek() == Some(&'\'') {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
            }
            '"' | '`' => {
                // quoted identifier
                let quote = c;
                chars.next();
                let mut name = String::new();
                while let Some(c) = chars.next() {
                    if c == quote {
                        if chars.peek() == Some(&quote) {
                            name.push(quote);
                            chars.next();
                        } else {
                            break;
                        }
                    } else {
                        name.push(c);
                    }
                }
                tokens.push(Token::Ident(name));
            }
            '[' => {
                // bracket-quoted identifier
                chars.next();
                let mut name = String::new();
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    name.push(c);
                }
                tokens.push(Token::Ident(name));
            }
            _ if is_ident_start(c) => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if is_ident_continue(c) {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(name));
            }
            _ => {
                chars.next();
                tokens.push(Token::Punct(c));
            }
        }
    }
    tokens
}

fn is_kw(token: &Token, kw: &str) -> bool {
    matches!(token, Token::Ident(name) if name.eq_ignore_ascii_case(kw))
}

// Keywords that end a comma-separated FROM list.
const FROM_LIST_TERMINATORS: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "LIMIT", "HAVING", "WINDOW", "UNION", "EXCEPT", "INTERSECT",
    "JOIN", "ON", "USING", "SET", "LEFT", "RIGHT", "INNER", "OUTER", "CROSS", "NATURAL",
    "RETURNING",
];

/// The tables referenced by `sql`, lowercased and deduplicated.
pub fn referenced_tables(sql: &str) -> HashSet<String> {
    let tokens = tokenize(sql);
    let mut tables = HashSet::new();
    let mut cte_aliases: HashSet<String> = HashSet::new();

    let mut depth: i32 = 0;
    let mut expect_table = false;
    let mut in_from_list = false;
    let mut from_depth = 0;
    // Depth of the WITH clause we're inside, if any, and whether the next
    // identifier at that depth names a CTE.
    let mut with_depth: Option<i32> = None;
    let mut expect_cte_alias = false;

    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];
        match token {
            Token::Punct('(') => {
                depth += 1;
                // `FROM (SELECT ...)` - nothing to collect.
                expect_table = false;
            }
            Token::Punct(')') => {
                depth -= 1;
                if in_from_list && depth < from_depth {
                    in_from_list = false;
                }
            }
            Token::Punct(',') => {
                if let Some(wd) = with_depth {
                    if depth == wd {
                        // next alias in `WITH a AS (...), b AS (...)`
                        expect_cte_alias = true;
                        i += 1;
                        continue;
                    }
                }
                if in_from_list && depth == from_depth {
                    expect_table = true;
                }
            }
            Token::Punct(_) => {}
            Token::Ident(name) => {
                if expect_cte_alias {
                    cte_aliases.insert(name.to_lowercase());
                    expect_cte_alias = false;
                } else if is_kw(token, "WITH") {
                    with_depth = Some(depth);
                    expect_cte_alias = true;
                    // skip an optional RECURSIVE
                    if tokens
                        .get(i + 1)
                        .map(|t| is_kw(t, "RECURSIVE"))
                        .unwrap_or(false)
                    {
                        i += 1;
                    }
                } else if is_kw(token, "FROM") || is_kw(token, "JOIN") {
                    expect_table = true;
                    in_from_list = is_kw(token, "FROM");
                    from_depth = depth;
                } else if is_kw(token, "INTO") {
                    expect_table = true;
                } else if is_kw(token, "UPDATE") {
                    // skip a conflict clause: UPDATE OR ROLLBACK t
                    if tokens.get(i + 1).map(|t| is_kw(t, "OR")).unwrap_or(false) {
                        i += 2;
                    }
                    expect_table = true;
                } else if expect_table {
                    let mut table = name.clone();
                    // schema-qualified: take the part after the dot.
                    if tokens.get(i + 1) == Some(&Token::Punct('.')) {
                        if let Some(Token::Ident(real)) = tokens.get(i + 2) {
                            table = real.clone();
                            i += 2;
                        }
                    }
                    tables.insert(table.to_lowercase());
                    expect_table = false;
                } else if let Some(wd) = with_depth {
                    // the statement after the WITH header ends alias
                    // collection
                    if depth == wd
                        && (is_kw(token, "SELECT")
                            || is_kw(token, "INSERT")
                            || is_kw(token, "DELETE")
                            || is_kw(token, "REPLACE"))
                    {
                        with_depth = None;
                    }
                }
                if in_from_list
                    && FROM_LIST_TERMINATORS
                        .iter()
                        .any(|kw| is_kw(token, kw))
                {
                    in_from_list = is_kw(token, "JOIN");
                }
            }
        }
        i += 1;
    }

    tables
        .into_iter()
        .filter(|t| !cte_aliases.contains(t))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(sql: &str) -> Vec<String> {
        let mut v: Vec<String> = referenced_tables(sql).into_iter().collect();
        v.sort();
        v
    }

    #[test]
    fn test_simple_select() {
        assert_eq!(tables("SELECT * FROM todos"), &["todos"]);
        assert_eq!(tables("select id from Todos where done = 1"), &["todos"]);
    }

    #[test]
    fn test_joins() {
        assert_eq!(
            tables("SELECT * FROM todos t JOIN lists l ON l.id = t.list_id"),
            &["lists", "todos"]
        );
        assert_eq!(
            tables("SELECT * FROM a LEFT OUTER JOIN b ON b.x = a.x INNER JOIN c USING (y)"),
            &["a", "b", "c"]
        );
    }

    #[test]
    fn test_from_comma_list() {
        assert_eq!(
            tables("SELECT a.x, b.y FROM todos a, lists b WHERE a.id = b.id"),
            &["lists", "todos"]
        );
    }

    #[test]
    fn test_writes() {
        assert_eq!(tables("INSERT INTO todos (t) VALUES (1)"), &["todos"]);
        assert_eq!(
            tables("INSERT OR REPLACE INTO todos (t) VALUES (1)"),
            &["todos"]
        );
        assert_eq!(tables("UPDATE todos SET t = 2"), &["todos"]);
        assert_eq!(tables("UPDATE OR IGNORE todos SET t = 2"), &["todos"]);
        assert_eq!(tables("DELETE FROM todos WHERE id = 1"), &["todos"]);
    }

    #[test]
    fn test_cte_aliases_excluded_bodies_scanned() {
        assert_eq!(
            tables("WITH recent AS (SELECT * FROM todos WHERE ts > 5) SELECT * FROM recent"),
            &["todos"]
        );
        assert_eq!(
            tables(
                "WITH a AS (SELECT * FROM t1), b AS (SELECT * FROM t2)
                 SELECT * FROM a JOIN b ON a.x = b.x"
            ),
            &["t1", "t2"]
        );
        assert_eq!(
            tables("WITH RECURSIVE cnt(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM cnt) SELECT x FROM cnt"),
            Vec::<String>::new()
        );
    }

    #[test]
    fn test_subqueries() {
        assert_eq!(
            tables("SELECT * FROM (SELECT * FROM inner_t) WHERE x IN (SELECT y FROM other)"),
            &["inner_t", "other"]
        );
    }

    #[test]
    fn test_strings_and_comments_ignored() {
        assert_eq!(
            tables("SELECT 'FROM fake' FROM todos -- FROM commented\n WHERE x = 1"),
            &["todos"]
        );
        assert_eq!(
            tables("SELECT /* FROM block */ * FROM todos"),
            &["todos"]
        );
    }

    #[test]
    fn test_quoted_and_qualified_names() {
        assert_eq!(tables("SELECT * FROM \"To dos\""), &["to dos"]);
        assert_eq!(tables("SELECT * FROM main.todos"), &["todos"]);
        assert_eq!(tables("SELECT * FROM `todos`"), &["todos"]);
    }

    #[test]
    fn test_duplicates_collapse() {
        assert_eq!(
            tables("SELECT * FROM todos WHERE id IN (SELECT id FROM todos)"),
            &["todos"]
        );
    }
}
