//! Lenient tokenization of Trino SQL, just deep enough for routing decisions.
//!
//! This is intentionally not a SQL parser. It strips comments, splits the statement into
//! words, quoted identifiers, literals and symbols, determines the leading statement keyword
//! and harvests the table-ish identifiers mentioned after `FROM`, `JOIN`, `INTO` and friends.
//! Anything it does not understand it skips over.

use snafu::Snafu;
use strum::{Display, EnumString};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Unterminated block comment"))]
    UnterminatedBlockComment,

    #[snafu(display("Unterminated string literal"))]
    UnterminatedStringLiteral,

    #[snafu(display("Unterminated quoted identifier"))]
    UnterminatedQuotedIdentifier,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    /// A bare word. Keywords are matched case-insensitively against this.
    Word(String),

    /// A `"quoted"` identifier with the `""` escape already collapsed. Case preserved.
    Quoted(String),

    /// A `'string'` literal. The content is irrelevant for routing.
    Literal,

    Number,

    Symbol(char),
}

/// The query type as exposed to routing rules, derived from the leading statement keyword.
#[derive(Clone, Copy, Debug, Default, Display, EnumString, PartialEq, Eq, Hash)]
pub enum QueryType {
    #[strum(serialize = "SELECT")]
    Select,
    #[strum(serialize = "INSERT")]
    Insert,
    #[strum(serialize = "UPDATE")]
    Update,
    #[strum(serialize = "DELETE")]
    Delete,
    #[strum(serialize = "EXPLAIN")]
    Explain,
    #[strum(serialize = "DESCRIBE")]
    Describe,
    #[strum(serialize = "SHOW")]
    Show,
    #[strum(serialize = "CREATE")]
    Create,
    #[strum(serialize = "DROP")]
    Drop,
    #[strum(serialize = "ALTER")]
    Alter,
    #[strum(serialize = "USE")]
    Use,
    #[strum(serialize = "CALL")]
    Call,
    /// A statement kind we do not classify further (e.g. MERGE, VALUES, GRANT).
    #[strum(serialize = "other")]
    Other,
    /// The SQL could not be tokenized at all.
    #[default]
    #[strum(serialize = "unknown")]
    Unknown,
}

/// The coarser classification Trino resource groups use.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash)]
pub enum ResourceGroupQueryType {
    #[strum(serialize = "DATA_DEFINITION")]
    DataDefinition,
    #[strum(serialize = "DATA_MANAGEMENT")]
    DataManagement,
    #[strum(serialize = "DESCRIBE")]
    Describe,
    #[strum(serialize = "READ_ONLY")]
    ReadOnly,
    #[default]
    #[strum(serialize = "UNKNOWN")]
    Unknown,
}

impl QueryType {
    pub fn from_leading_keyword(keyword: &str) -> Self {
        match keyword.to_ascii_uppercase().as_str() {
            "SELECT" => Self::Select,
            "INSERT" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            "EXPLAIN" => Self::Explain,
            "DESCRIBE" | "DESC" => Self::Describe,
            "SHOW" => Self::Show,
            "CREATE" => Self::Create,
            "DROP" => Self::Drop,
            "ALTER" => Self::Alter,
            "USE" => Self::Use,
            "CALL" => Self::Call,
            _ => Self::Other,
        }
    }
}

impl ResourceGroupQueryType {
    pub fn from_leading_keyword(keyword: &str) -> Self {
        match keyword.to_ascii_uppercase().as_str() {
            "CREATE" | "DROP" | "ALTER" | "COMMENT" | "GRANT" | "REVOKE" | "DENY" => {
                Self::DataDefinition
            }
            "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "CALL" | "REFRESH" => Self::DataManagement,
            "DESCRIBE" | "DESC" | "SHOW" => Self::Describe,
            "SELECT" | "EXPLAIN" | "VALUES" | "TABLE" | "USE" | "EXECUTE" => Self::ReadOnly,
            _ => Self::Unknown,
        }
    }
}

/// A dotted identifier as written in the statement, one entry per component.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawIdentifier {
    pub parts: Vec<String>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SqlAnalysis {
    /// The first statement keyword after comments and an optional `WITH` prelude,
    /// uppercased. `None` for an empty statement.
    pub leading_keyword: Option<String>,

    /// Identifiers referenced as tables.
    pub tables: Vec<RawIdentifier>,

    /// Schema references from `SHOW TABLES FROM <schema>`.
    pub schemas: Vec<RawIdentifier>,

    /// Catalog/schema references from `USE <catalog>.<schema>` / `USE <schema>`.
    pub use_targets: Vec<RawIdentifier>,
}

pub fn analyze(sql: &str) -> Result<SqlAnalysis, Error> {
    let tokens = tokenize(sql)?;

    Ok(SqlAnalysis {
        leading_keyword: leading_statement_keyword(&tokens),
        tables: harvest_tables(&tokens),
        schemas: harvest_show_tables_schemas(&tokens),
        use_targets: harvest_use_targets(&tokens),
    })
}

pub fn tokenize(sql: &str) -> Result<Vec<Token>, Error> {
    let mut tokens = Vec::new();
    let mut chars = sql.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '-' if chars.peek().is_some_and(|(_, c)| *c == '-') => {
                // Line comment, runs to the end of the line
                for (_, c) in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek().is_some_and(|(_, c)| *c == '*') => {
                chars.next();
                let mut terminated = false;
                let mut previous = ' ';
                for (_, c) in chars.by_ref() {
                    if previous == '*' && c == '/' {
                        terminated = true;
                        break;
                    }
                    previous = c;
                }
                if !terminated {
                    return UnterminatedBlockCommentSnafu.fail();
                }
            }
            '\'' => {
                let mut terminated = false;
                while let Some((_, c)) = chars.next() {
                    if c == '\'' {
                        // A doubled quote is an escaped quote inside the literal
                        if chars.peek().is_some_and(|(_, c)| *c == '\'') {
                            chars.next();
                        } else {
                            terminated = true;
                            break;
                        }
                    }
                }
                if !terminated {
                    return UnterminatedStringLiteralSnafu.fail();
                }
                tokens.push(Token::Literal);
            }
            '"' => {
                let mut identifier = String::new();
                let mut terminated = false;
                while let Some((_, c)) = chars.next() {
                    if c == '"' {
                        if chars.peek().is_some_and(|(_, c)| *c == '"') {
                            chars.next();
                            identifier.push('"');
                        } else {
                            terminated = true;
                            break;
                        }
                    } else {
                        identifier.push(c);
                    }
                }
                if !terminated {
                    return UnterminatedQuotedIdentifierSnafu.fail();
                }
                tokens.push(Token::Quoted(identifier));
            }
            c if c.is_ascii_digit() => {
                while chars
                    .peek()
                    .is_some_and(|(_, c)| c.is_ascii_alphanumeric() || *c == '.' || *c == '_')
                {
                    chars.next();
                }
                tokens.push(Token::Number);
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut word = String::from(c);
                while let Some((_, c)) = chars.peek() {
                    if c.is_alphanumeric() || *c == '_' || *c == '$' {
                        word.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(word));
            }
            c => tokens.push(Token::Symbol(c)),
        }
    }

    Ok(tokens)
}

fn is_keyword(token: &Token, keyword: &str) -> bool {
    match token {
        Token::Word(word) => word.eq_ignore_ascii_case(keyword),
        _ => false,
    }
}

const STATEMENT_KEYWORDS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "MERGE", "TABLE", "VALUES",
];

/// Keywords that can never start a table reference, so a harvest trigger followed by one of
/// these is a subquery or some other construct we leave alone.
const NOT_A_TABLE_NAME: &[&str] = &[
    "SELECT", "VALUES", "UNNEST", "LATERAL", "WHERE", "GROUP", "ORDER", "WITH", "ON", "USING",
    "AS", "JOIN", "CROSS", "INNER", "LEFT", "RIGHT", "FULL", "NATURAL", "SET", "TABLE", "LIMIT",
    "HAVING", "UNION", "EXCEPT", "INTERSECT", "OFFSET", "FETCH",
];

fn leading_statement_keyword(tokens: &[Token]) -> Option<String> {
    let first_word = tokens.iter().find_map(|t| match t {
        Token::Word(word) => Some(word),
        _ => None,
    })?;

    if !first_word.eq_ignore_ascii_case("WITH") {
        return Some(first_word.to_ascii_uppercase());
    }

    // `WITH a AS (...), b AS (...) SELECT ...`: the main statement starts at the first
    // statement keyword at parenthesis depth zero after the prelude.
    let mut depth = 0i32;
    for token in tokens {
        match token {
            Token::Symbol('(') => depth += 1,
            Token::Symbol(')') => depth -= 1,
            Token::Word(word) if depth == 0 => {
                if STATEMENT_KEYWORDS
                    .iter()
                    .any(|k| word.eq_ignore_ascii_case(k))
                {
                    return Some(word.to_ascii_uppercase());
                }
            }
            _ => {}
        }
    }

    Some(first_word.to_ascii_uppercase())
}

/// Parses a dotted identifier chain starting at `start`. Returns the identifier and the index
/// of the first token after it.
fn parse_qualified_name(tokens: &[Token], start: usize) -> Option<(RawIdentifier, usize)> {
    let mut parts = Vec::new();
    let mut i = start;

    loop {
        match tokens.get(i) {
            Some(Token::Word(word)) => {
                if parts.is_empty()
                    && NOT_A_TABLE_NAME.iter().any(|k| word.eq_ignore_ascii_case(k))
                {
                    return None;
                }
                parts.push(word.clone());
            }
            Some(Token::Quoted(quoted)) => parts.push(quoted.clone()),
            _ => return None,
        }
        i += 1;

        match tokens.get(i) {
            Some(Token::Symbol('.')) => i += 1,
            _ => break,
        }
    }

    Some((RawIdentifier { parts }, i))
}

fn harvest_tables(tokens: &[Token]) -> Vec<RawIdentifier> {
    let mut tables = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        let token = &tokens[i];

        // `SHOW TABLES FROM ...` references a schema, not a table. Handled separately.
        if is_keyword(token, "SHOW") {
            if tokens.get(i + 1).is_some_and(|t| is_keyword(t, "TABLES")) {
                i += 3;
                continue;
            }
            i += 1;
            continue;
        }

        // Table-valued `TABLE(catalog.schema.function(...))`
        if is_keyword(token, "TABLE") && matches!(tokens.get(i + 1), Some(Token::Symbol('('))) {
            if let Some((identifier, next)) = parse_qualified_name(tokens, i + 2) {
                tables.push(identifier);
                i = next;
            } else {
                i += 2;
            }
            continue;
        }

        if is_keyword(token, "FROM") || is_keyword(token, "JOIN") || is_keyword(token, "INTO") {
            i = harvest_table_list(tokens, i + 1, &mut tables);
            continue;
        }

        // `UPDATE t SET ...` (but not the SET keyword itself re-triggering)
        if is_keyword(token, "UPDATE") {
            if let Some((identifier, next)) = parse_qualified_name(tokens, i + 1) {
                tables.push(identifier);
                i = next;
                continue;
            }
        }

        // `CREATE [OR REPLACE] TABLE [IF NOT EXISTS] t`, `DROP TABLE [IF EXISTS] t`,
        // `ALTER TABLE [IF EXISTS] t`
        if is_keyword(token, "CREATE") || is_keyword(token, "DROP") || is_keyword(token, "ALTER") {
            let mut j = i + 1;
            let mut saw_table = false;
            while let Some(Token::Word(word)) = tokens.get(j) {
                if word.eq_ignore_ascii_case("TABLE") {
                    saw_table = true;
                    j += 1;
                    break;
                }
                if word.eq_ignore_ascii_case("OR") || word.eq_ignore_ascii_case("REPLACE") {
                    j += 1;
                } else {
                    break;
                }
            }
            if saw_table {
                // Skip an optional IF [NOT] EXISTS
                while tokens.get(j).is_some_and(|t| {
                    is_keyword(t, "IF") || is_keyword(t, "NOT") || is_keyword(t, "EXISTS")
                }) {
                    j += 1;
                }
                if let Some((identifier, next)) = parse_qualified_name(tokens, j) {
                    tables.push(identifier);
                    i = next;
                    continue;
                }
            }
            i += 1;
            continue;
        }

        // Only in statement position, `DESC` is also the ORDER BY modifier
        if i == 0 && (is_keyword(token, "DESCRIBE") || is_keyword(token, "DESC")) {
            if let Some((identifier, next)) = parse_qualified_name(tokens, i + 1) {
                tables.push(identifier);
                i = next;
                continue;
            }
        }

        i += 1;
    }

    tables
}

/// Harvests a comma-separated table list after `FROM`, tolerating aliases.
fn harvest_table_list(tokens: &[Token], start: usize, tables: &mut Vec<RawIdentifier>) -> usize {
    let mut i = start;

    loop {
        // A subquery or table function instead of a plain reference ends the harvest here,
        // the inner tokens trigger their own FROM/JOIN handling later in the walk.
        match tokens.get(i) {
            Some(Token::Symbol('(')) => return i,
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("TABLE") => return i,
            _ => {}
        }

        let Some((identifier, mut next)) = parse_qualified_name(tokens, i) else {
            return i;
        };
        tables.push(identifier);

        // Optional `AS alias` or bare alias
        if tokens.get(next).is_some_and(|t| is_keyword(t, "AS")) {
            next += 1;
        }
        if let Some(Token::Word(word)) = tokens.get(next) {
            if !NOT_A_TABLE_NAME.iter().any(|k| word.eq_ignore_ascii_case(k)) {
                next += 1;
            }
        }

        match tokens.get(next) {
            Some(Token::Symbol(',')) => i = next + 1,
            _ => return next,
        }
    }
}

fn harvest_show_tables_schemas(tokens: &[Token]) -> Vec<RawIdentifier> {
    let mut schemas = Vec::new();
    let mut i = 0;

    while i + 2 < tokens.len() {
        if is_keyword(&tokens[i], "SHOW")
            && is_keyword(&tokens[i + 1], "TABLES")
            && (is_keyword(&tokens[i + 2], "FROM") || is_keyword(&tokens[i + 2], "IN"))
        {
            if let Some((identifier, next)) = parse_qualified_name(tokens, i + 3) {
                schemas.push(identifier);
                i = next;
                continue;
            }
        }
        i += 1;
    }

    schemas
}

fn harvest_use_targets(tokens: &[Token]) -> Vec<RawIdentifier> {
    let mut targets = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        if is_keyword(&tokens[i], "USE") {
            if let Some((identifier, next)) = parse_qualified_name(tokens, i + 1) {
                targets.push(identifier);
                i = next;
                continue;
            }
        }
        i += 1;
    }

    targets
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;

    fn ident(parts: &[&str]) -> RawIdentifier {
        RawIdentifier {
            parts: parts.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[rstest]
    #[case("SELECT 1", "SELECT")]
    #[case("select * from foo", "SELECT")]
    #[case("  -- a comment\nINSERT INTO t VALUES (1)", "INSERT")]
    #[case("/* block\ncomment */ UPDATE t SET x = 1", "UPDATE")]
    #[case("WITH x AS (SELECT 1) SELECT * FROM x", "SELECT")]
    #[case("WITH x AS (SELECT 1), y AS (SELECT 2) INSERT INTO t SELECT * FROM x", "INSERT")]
    #[case("EXPLAIN SELECT 1", "EXPLAIN")]
    #[case("show catalogs", "SHOW")]
    #[case("MERGE INTO t USING s ON t.id = s.id", "MERGE")]
    fn test_leading_statement_keyword(#[case] sql: &str, #[case] expected: &str) {
        let analysis = analyze(sql).unwrap();
        assert_eq!(analysis.leading_keyword.as_deref(), Some(expected));
    }

    #[rstest]
    #[case("SELECT", QueryType::Select)]
    #[case("desc", QueryType::Describe)]
    #[case("MERGE", QueryType::Other)]
    #[case("GRANT", QueryType::Other)]
    fn test_query_type_from_keyword(#[case] keyword: &str, #[case] expected: QueryType) {
        assert_eq!(QueryType::from_leading_keyword(keyword), expected);
    }

    #[rstest]
    #[case("CREATE", ResourceGroupQueryType::DataDefinition)]
    #[case("merge", ResourceGroupQueryType::DataManagement)]
    #[case("SHOW", ResourceGroupQueryType::Describe)]
    #[case("SELECT", ResourceGroupQueryType::ReadOnly)]
    #[case("BACKUP", ResourceGroupQueryType::Unknown)]
    fn test_resource_group_query_type_from_keyword(
        #[case] keyword: &str,
        #[case] expected: ResourceGroupQueryType,
    ) {
        assert_eq!(ResourceGroupQueryType::from_leading_keyword(keyword), expected);
    }

    #[rstest]
    #[case("SELECT * FROM t", vec![ident(&["t"])])]
    #[case("SELECT * FROM s.t", vec![ident(&["s", "t"])])]
    #[case("SELECT * FROM c.s.t", vec![ident(&["c", "s", "t"])])]
    #[case("SELECT * FROM a, b.c", vec![ident(&["a"]), ident(&["b", "c"])])]
    #[case("SELECT * FROM a x JOIN b y ON x.id = y.id", vec![ident(&["a"]), ident(&["b"])])]
    #[case("SELECT * FROM a AS x, b", vec![ident(&["a"]), ident(&["b"])])]
    #[case("INSERT INTO c.s.t SELECT * FROM src", vec![ident(&["c", "s", "t"]), ident(&["src"])])]
    #[case("UPDATE t SET x = 1 WHERE y = 2", vec![ident(&["t"])])]
    #[case("DELETE FROM c.s.t WHERE x = 1", vec![ident(&["c", "s", "t"])])]
    #[case("MERGE INTO tgt USING src ON tgt.id = src.id", vec![ident(&["tgt"])])]
    #[case("CREATE TABLE c.s.t (x int)", vec![ident(&["c", "s", "t"])])]
    #[case("CREATE OR REPLACE TABLE t (x int)", vec![ident(&["t"])])]
    #[case("DROP TABLE IF EXISTS s.t", vec![ident(&["s", "t"])])]
    #[case("ALTER TABLE t EXECUTE optimize", vec![ident(&["t"])])]
    #[case("DESCRIBE c.s.t", vec![ident(&["c", "s", "t"])])]
    #[case("SELECT * FROM (SELECT 1)", vec![])]
    #[case("SELECT * FROM (SELECT * FROM inner_t)", vec![ident(&["inner_t"])])]
    #[case("SELECT * FROM TABLE(system.sequence(1, 10))", vec![ident(&["system", "sequence"])])]
    #[case(r#"SELECT * FROM "My Catalog"."Sch"."Tab""#, vec![ident(&["My Catalog", "Sch", "Tab"])])]
    #[case(r#"SELECT * FROM "we""ird""#, vec![ident(&["we\"ird"])])]
    #[case("SELECT 'from nowhere'", vec![])]
    #[case("SHOW TABLES FROM s", vec![])]
    fn test_harvest_tables(#[case] sql: &str, #[case] expected: Vec<RawIdentifier>) {
        let analysis = analyze(sql).unwrap();
        assert_eq!(analysis.tables, expected);
    }

    #[test]
    fn test_show_tables_from_references_a_schema() {
        let analysis = analyze("SHOW TABLES FROM c.s").unwrap();
        assert_eq!(analysis.schemas, vec![ident(&["c", "s"])]);
        assert!(analysis.tables.is_empty());
    }

    #[test]
    fn test_use_statement() {
        let analysis = analyze("USE hive.logs").unwrap();
        assert_eq!(analysis.use_targets, vec![ident(&["hive", "logs"])]);
    }

    #[test]
    fn test_comments_are_stripped() {
        let sql = indoc! {r#"
            -- leading comment with FROM fake_table
            /* and a block one,
               also mentioning FROM another_fake */
            SELECT * FROM real_table
        "#};
        let analysis = analyze(sql).unwrap();
        assert_eq!(analysis.tables, vec![ident(&["real_table"])]);
    }

    #[rstest]
    #[case("SELECT '")]
    #[case("SELECT \"broken")]
    #[case("SELECT 1 /* unterminated")]
    fn test_malformed_sql_fails_tokenization(#[case] sql: &str) {
        assert!(analyze(sql).is_err());
    }

    #[test]
    fn test_quoted_keyword_is_not_a_statement_keyword() {
        // A CTE named "select" (quoted) must not be mistaken for the main statement
        let analysis = analyze(r#"WITH "select" AS (SELECT 1) DELETE FROM t"#).unwrap();
        assert_eq!(analysis.leading_keyword.as_deref(), Some("DELETE"));
    }
}
