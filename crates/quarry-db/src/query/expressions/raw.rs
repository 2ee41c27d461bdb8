//! Raw SQL templates.
//!
//! A template is SQL text with two kinds of references:
//!
//! - `![Name]` is a field path, rendered as a resolved column reference;
//! - `?[n]` is the n-th caller-supplied parameter (1-based) and may repeat.
//!
//! Parameters no `?[n]` refers to are consumed in order by bare `?`
//! placeholders. Text inside quotes is copied verbatim, and `%` carries no
//! special meaning. Every reference is checked when the template is parsed.

use std::sync::OnceLock;

use quarry_core::{QuarryError, QuarryResult};
use regex::Regex;

use super::context::ExprContext;
use super::core::Fragment;
use crate::value::Value;

/// Quoted runs, `![..]` / `?[..]` references and bare `?`. The `open` and
/// `unclosed` groups only match what the complete forms could not.
fn token() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| {
        Regex::new(
            r#"'[^']*'|"[^"]*"|`[^`]*`|(?P<open>['"`])|(?P<kind>[!?])\[(?P<inner>[^\]]*)\]|(?P<unclosed>[!?])\[|\?"#,
        )
        .expect("raw template token pattern is valid")
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Piece {
    Text(String),
    Column(String),
    Param(usize),
}

/// A parsed raw template and its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTemplate {
    statement: String,
    pieces: Vec<Piece>,
    params: Vec<Value>,
    target: Option<String>,
}

impl RawTemplate {
    /// Parses `statement` against `params`.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::InvalidExpression`] for an unterminated
    /// reference, a `?[n]` outside `1..=params.len()`, or a number of bare `?`
    /// different from the number of unreferenced parameters.
    ///
    /// # Examples
    ///
    /// ```
    /// use quarry_db::query::expressions::RawTemplate;
    /// use quarry_db::value::Value;
    ///
    /// let t = RawTemplate::parse("![ID] % ?[1] = ?", vec![Value::Int(2), Value::Int(0)]).unwrap();
    /// assert_eq!(t.columns().collect::<Vec<_>>(), vec!["ID"]);
    /// assert!(RawTemplate::parse("?[3]", vec![Value::Int(1)]).is_err());
    /// ```
    pub fn parse(statement: &str, params: Vec<Value>) -> QuarryResult<Self> {
        let invalid = |reason: String| {
            QuarryError::InvalidExpression(format!("{reason} in `{statement}`"))
        };

        let mut pieces = Vec::new();
        let mut referenced = vec![false; params.len()];
        let mut bare = Vec::new();
        let mut text_start = 0;

        for caps in token().captures_iter(statement) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            if let Some(open) = caps.name("open") {
                return Err(invalid(format!("unterminated quoted text at {}", open.start())));
            }
            if let Some(unclosed) = caps.name("unclosed") {
                return Err(invalid(format!(
                    "unterminated `{}[` at {}",
                    unclosed.as_str(),
                    unclosed.start()
                )));
            }
            let piece = match (caps.name("kind").map(|k| k.as_str()), caps.name("inner")) {
                (Some("!"), Some(inner)) => {
                    let inner = inner.as_str().trim();
                    if inner.is_empty() {
                        return Err(invalid("empty field reference `![]`".to_string()));
                    }
                    Piece::Column(inner.to_string())
                }
                (Some(_), Some(inner)) => {
                    let inner = inner.as_str().trim();
                    let n: usize = inner
                        .parse()
                        .map_err(|_| invalid(format!("bad parameter index `?[{inner}]`")))?;
                    if n == 0 || n > params.len() {
                        return Err(invalid(format!(
                            "parameter `?[{n}]` out of range ({} supplied)",
                            params.len()
                        )));
                    }
                    referenced[n - 1] = true;
                    Piece::Param(n - 1)
                }
                _ if whole.as_str() == "?" => Piece::Param(usize::MAX),
                // quoted text stays in the surrounding SQL
                _ => continue,
            };

            let text = &statement[text_start..whole.start()];
            if !text.is_empty() {
                pieces.push(Piece::Text(text.to_string()));
            }
            if piece == Piece::Param(usize::MAX) {
                bare.push(pieces.len());
            }
            pieces.push(piece);
            text_start = whole.end();
        }
        if text_start < statement.len() {
            pieces.push(Piece::Text(statement[text_start..].to_string()));
        }

        let unreferenced: Vec<usize> = referenced
            .iter()
            .enumerate()
            .filter(|(_, used)| !**used)
            .map(|(idx, _)| idx)
            .collect();
        if bare.len() != unreferenced.len() {
            return Err(invalid(format!(
                "{} bare `?` for {} unreferenced parameter(s)",
                bare.len(),
                unreferenced.len()
            )));
        }
        for (slot, param) in bare.into_iter().zip(unreferenced) {
            pieces[slot] = Piece::Param(param);
        }

        Ok(Self {
            statement: statement.to_string(),
            pieces,
            params,
            target: None,
        })
    }

    /// Parses a template whose `%s` markers are replaced, in order, by
    /// references to `fields`.
    pub fn with_fields(statement: &str, fields: &[&str]) -> QuarryResult<Self> {
        let markers = statement.matches("%s").count();
        if markers != fields.len() {
            return Err(QuarryError::InvalidExpression(format!(
                "`{statement}` has {markers} `%s` marker(s) for {} field(s)",
                fields.len()
            )));
        }
        let mut expanded = String::with_capacity(statement.len() + fields.len() * 8);
        let mut rest = statement;
        for field in fields {
            if let Some((before, after)) = rest.split_once("%s") {
                expanded.push_str(before);
                expanded.push_str("![");
                expanded.push_str(field);
                expanded.push(']');
                rest = after;
            }
        }
        expanded.push_str(rest);
        Self::parse(&expanded, Vec::new())
    }

    /// Parses an update assignment: the first `![Field]` before `=` is the
    /// column being written.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::InvalidExpression`] if no field precedes the
    /// first `=`.
    pub fn assignment(statement: &str, params: Vec<Value>) -> QuarryResult<Self> {
        let mut template = Self::parse(statement, params)?;
        let target = template.pieces.iter().find_map(|p| match p {
            Piece::Column(name) => Some(Some(name.clone())),
            Piece::Text(t) if t.contains('=') => Some(None),
            _ => None,
        });
        match target {
            Some(Some(name)) => {
                template.target = Some(name);
                Ok(template)
            }
            _ => Err(QuarryError::InvalidExpression(format!(
                "`{statement}` does not assign to a field; expected `![Field] = ...`"
            ))),
        }
    }

    /// The template text as written.
    pub fn statement(&self) -> &str {
        &self.statement
    }

    /// The supplied parameters.
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// The field an assignment writes.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// The only field reference when the template is nothing else.
    pub(crate) fn bare_column(&self) -> Option<&str> {
        let mut column = None;
        for piece in &self.pieces {
            match piece {
                Piece::Column(name) if column.is_none() => column = Some(name.as_str()),
                Piece::Text(text) if text.trim().is_empty() => {}
                _ => return None,
            }
        }
        column
    }

    /// Field references in order of appearance.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.pieces.iter().filter_map(|p| match p {
            Piece::Column(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Renders the template; field references are resolved under `prefix`
    /// when given.
    pub(crate) fn render(
        &self,
        ctx: &mut ExprContext<'_>,
        prefix: Option<&str>,
    ) -> QuarryResult<Fragment> {
        let mut out = Fragment::default();
        for piece in &self.pieces {
            match piece {
                Piece::Text(text) => out.push_sql(text),
                Piece::Column(name) => {
                    let path = prefix.map_or_else(|| name.clone(), |p| format!("{p}.{name}"));
                    let column = ctx.resolve_column(&path)?;
                    out.push(&column);
                }
                Piece::Param(idx) => match self.params.get(*idx) {
                    Some(Value::List(items)) => {
                        for (i, item) in items.iter().enumerate() {
                            if i > 0 {
                                out.push_sql(", ");
                            }
                            out.bind(item.clone());
                        }
                    }
                    Some(value) => out.bind(value.clone()),
                    None => {
                        return Err(QuarryError::InvalidExpression(format!(
                            "parameter {} missing in `{}`",
                            idx + 1,
                            self.statement
                        )))
                    }
                },
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::driver::Driver;
    use crate::query::expressions::Engine;
    use crate::testing;

    fn render(template: &RawTemplate, driver: Driver, updating: bool) -> Fragment {
        let engine = Engine::new(Arc::new(testing::registry()));
        let base = engine.registry.meta("Todo").unwrap();
        let mut ctx = ExprContext::new(&engine, driver, base);
        ctx.set_updating(updating);
        template.render(&mut ctx, None).unwrap()
    }

    #[test]
    fn test_positional_params_repeat() {
        let t = RawTemplate::assignment(
            "![Done]=(![ID]%?[1]=?[2] OR ![ID]%?[1]=?[3] OR ?[4])",
            vec![Value::Int(2), Value::Int(0), Value::Int(1), Value::Bool(true)],
        )
        .unwrap();
        assert_eq!(t.target(), Some("Done"));
        let f = render(&t, Driver::Sqlite, true);
        assert_eq!(f.sql, r#""done"=("id"%?=? OR "id"%?=? OR ?)"#);
        assert_eq!(
            f.args,
            vec![
                Value::Int(2),
                Value::Int(0),
                Value::Int(2),
                Value::Int(1),
                Value::Bool(true)
            ]
        );
    }

    #[test]
    fn test_bare_placeholders_take_unreferenced_params() {
        let t = RawTemplate::parse(
            "![Title] = ? OR ![ID] > ?[2] OR ![ID] < ?",
            vec![Value::from("a"), Value::Int(5), Value::Int(9)],
        )
        .unwrap();
        let f = render(&t, Driver::Postgres, false);
        assert_eq!(
            f.sql,
            r#""todos"."title" = ? OR "todos"."id" > ? OR "todos"."id" < ?"#
        );
        assert_eq!(f.args, vec![Value::from("a"), Value::Int(5), Value::Int(9)]);
    }

    #[test]
    fn test_out_of_range_index() {
        let err = RawTemplate::parse("?[2]", vec![Value::Int(1)]).unwrap_err();
        assert!(matches!(err, QuarryError::InvalidExpression(ref m) if m.contains("?[2]")));
        assert!(RawTemplate::parse("?[0]", vec![Value::Int(1)]).is_err());
    }

    #[test]
    fn test_param_count_mismatch() {
        assert!(RawTemplate::parse("? + ?", vec![Value::Int(1)]).is_err());
        assert!(RawTemplate::parse("?[1]", vec![Value::Int(1), Value::Int(2)]).is_err());
    }

    #[test]
    fn test_percent_preserved_and_quotes_verbatim() {
        let t = RawTemplate::parse("![Title] LIKE '50% ?[1]'", Vec::new()).unwrap();
        let f = render(&t, Driver::Postgres, false);
        assert_eq!(f.sql, r#""todos"."title" LIKE '50% ?[1]'"#);
        assert!(f.args.is_empty());
    }

    #[test]
    fn test_list_param_expands() {
        let t = RawTemplate::parse("![ID] IN (?[1])", vec![Value::list([1, 2, 3])]).unwrap();
        let f = render(&t, Driver::Sqlite, false);
        assert_eq!(f.sql, r#""todos"."id" IN (?, ?, ?)"#);
        assert_eq!(f.args.len(), 3);
    }

    #[test]
    fn test_with_fields() {
        let t = RawTemplate::with_fields("UPPER(%s) || %s", &["Title", "User.Name"]).unwrap();
        assert_eq!(t.columns().collect::<Vec<_>>(), vec!["Title", "User.Name"]);
        assert!(RawTemplate::with_fields("%s", &[]).is_err());
    }

    #[test]
    fn test_assignment_requires_target() {
        assert!(RawTemplate::assignment("UPPER(![Title])", Vec::new()).is_err());
        assert!(RawTemplate::assignment("x = ![Title]", Vec::new()).is_err());
    }

    #[test]
    fn test_doubled_quotes_and_backticks_stay_verbatim() {
        let t = RawTemplate::parse("![Title] = 'it''s ?' AND `a?b` = ?", vec![Value::Int(1)])
            .unwrap();
        let f = render(&t, Driver::Sqlite, false);
        assert_eq!(f.sql, r#""todos"."title" = 'it''s ?' AND `a?b` = ?"#);
        assert_eq!(f.args, vec![Value::Int(1)]);
    }

    #[test]
    fn test_empty_field_reference() {
        let err = RawTemplate::parse("![ ]", Vec::new()).unwrap_err();
        assert!(matches!(err, QuarryError::InvalidExpression(ref m) if m.contains("![]")));
        assert!(RawTemplate::parse("?[x]", vec![Value::Int(1)]).is_err());
    }

    #[test]
    fn test_bare_column() {
        let t = RawTemplate::with_fields(" %s ", &["Author.Name"]).unwrap();
        assert_eq!(t.bare_column(), Some("Author.Name"));
        let t = RawTemplate::with_fields("UPPER(%s)", &["Author.Name"]).unwrap();
        assert_eq!(t.bare_column(), None);
        let t = RawTemplate::with_fields("%s %s", &["ID", "Title"]).unwrap();
        assert_eq!(t.bare_column(), None);
    }

    #[test]
    fn test_unterminated_reference() {
        assert!(RawTemplate::parse("![Title", Vec::new()).is_err());
        assert!(RawTemplate::parse("'open", Vec::new()).is_err());
    }
}
