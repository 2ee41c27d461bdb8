//! SQL dialect identity.
//!
//! A [`Driver`] is the identity token keying the lookup, function and cast
//! registries. It also knows the dialect's identifier quoting, its
//! placeholder syntax, and how an INSERT reports generated keys.

use std::fmt;
use std::str::FromStr;

use quarry_core::QuarryError;

/// A supported SQL dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Driver {
    /// `PostgreSQL`: `"ident"`, `$n` placeholders, `RETURNING`.
    Postgres,
    /// `SQLite`: `"ident"`, `?` placeholders, `RETURNING`.
    Sqlite,
    /// `MySQL`: `` `ident` ``, `?` placeholders, last-insert-id.
    MySql,
}

/// How an INSERT reports the row it created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Returning {
    /// Nothing is read back.
    None,
    /// The driver reports the generated primary key out of band.
    LastInsertId,
    /// `RETURNING <cols>` reads the inserted row back.
    Columns,
}

impl Driver {
    /// Every supported driver.
    pub const ALL: [Self; 3] = [Self::Postgres, Self::Sqlite, Self::MySql];

    /// The canonical engine name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
            Self::MySql => "mysql",
        }
    }

    /// The identifier quote character.
    pub const fn quote_char(self) -> char {
        match self {
            Self::Postgres | Self::Sqlite => '"',
            Self::MySql => '`',
        }
    }

    /// Quotes an identifier, doubling any embedded quote character.
    pub fn quote(self, ident: &str) -> String {
        let q = self.quote_char();
        let mut out = String::with_capacity(ident.len() + 2);
        out.push(q);
        for c in ident.chars() {
            if c == q {
                out.push(q);
            }
            out.push(c);
        }
        out.push(q);
        out
    }

    /// The INSERT returning capability.
    pub const fn returning(self) -> Returning {
        match self {
            Self::Postgres | Self::Sqlite => Returning::Columns,
            Self::MySql => Returning::LastInsertId,
        }
    }

    /// Whether `SELECT ... FOR UPDATE` is understood.
    pub const fn supports_for_update(self) -> bool {
        !matches!(self, Self::Sqlite)
    }

    /// Whether an aggregate SELECT without GROUP BY rejects plain columns
    /// (PostgreSQL always, MySQL under `ONLY_FULL_GROUP_BY`).
    pub const fn requires_full_group_by(self) -> bool {
        !matches!(self, Self::Sqlite)
    }

    /// Rewrites `?` placeholders into the dialect's form.
    ///
    /// Question marks inside string literals and quoted identifiers are left
    /// alone.
    pub fn rebind(self, sql: &str) -> String {
        match self {
            Self::Sqlite | Self::MySql => sql.to_string(),
            Self::Postgres => {
                let mut out = String::with_capacity(sql.len() + 8);
                let mut n = 0;
                scan_placeholders(sql, |chunk| match chunk {
                    Chunk::Text(t) => out.push_str(t),
                    Chunk::Placeholder => {
                        n += 1;
                        out.push('$');
                        out.push_str(&n.to_string());
                    }
                });
                out
            }
        }
    }
}

enum Chunk<'a> {
    Text(&'a str),
    Placeholder,
}

fn scan_placeholders<'a>(sql: &'a str, mut emit: impl FnMut(Chunk<'a>)) {
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in sql.char_indices() {
        match (quote, c) {
            (None, '\'' | '"' | '`') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, '?') => {
                emit(Chunk::Text(&sql[start..i]));
                emit(Chunk::Placeholder);
                start = i + 1;
            }
            _ => {}
        }
    }
    emit(Chunk::Text(&sql[start..]));
}

/// Counts `?` placeholders outside literals and quoted identifiers.
pub fn count_placeholders(sql: &str) -> usize {
    let mut n = 0;
    scan_placeholders(sql, |chunk| {
        if matches!(chunk, Chunk::Placeholder) {
            n += 1;
        }
    });
    n
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Driver {
    type Err = QuarryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "mysql" | "mariadb" => Ok(Self::MySql),
            other => Err(QuarryError::UnknownDriver(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str() {
        assert_eq!("postgresql".parse::<Driver>().unwrap(), Driver::Postgres);
        assert_eq!("SQLite3".parse::<Driver>().unwrap(), Driver::Sqlite);
        assert_eq!("mysql".parse::<Driver>().unwrap(), Driver::MySql);
        assert!(matches!(
            "oracle".parse::<Driver>(),
            Err(QuarryError::UnknownDriver(ref n)) if n == "oracle"
        ));
    }

    #[test]
    fn test_quote() {
        assert_eq!(Driver::Postgres.quote("todos"), "\"todos\"");
        assert_eq!(Driver::MySql.quote("todos"), "`todos`");
        assert_eq!(Driver::Sqlite.quote("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_rebind_postgres() {
        assert_eq!(
            Driver::Postgres.rebind("SELECT * FROM t WHERE a = ? AND b IN (?, ?)"),
            "SELECT * FROM t WHERE a = $1 AND b IN ($2, $3)"
        );
    }

    #[test]
    fn test_rebind_skips_literals() {
        assert_eq!(
            Driver::Postgres.rebind("SELECT '?' , \"a?\" FROM t WHERE x = ?"),
            "SELECT '?' , \"a?\" FROM t WHERE x = $1"
        );
        assert_eq!(count_placeholders("SELECT '?' FROM t WHERE x = ?"), 1);
    }

    #[test]
    fn test_rebind_noop_for_question_mark_dialects() {
        let sql = "UPDATE t SET a = ? WHERE b = ?";
        assert_eq!(Driver::Sqlite.rebind(sql), sql);
        assert_eq!(Driver::MySql.rebind(sql), sql);
    }

    #[test]
    fn test_returning_capability() {
        assert_eq!(Driver::Postgres.returning(), Returning::Columns);
        assert_eq!(Driver::Sqlite.returning(), Returning::Columns);
        assert_eq!(Driver::MySql.returning(), Returning::LastInsertId);
        assert!(!Driver::Sqlite.supports_for_update());
        assert!(Driver::Postgres.requires_full_group_by());
        assert!(!Driver::Sqlite.requires_full_group_by());
    }
}
