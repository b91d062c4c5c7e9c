//! Filter DSL
//!
//! Small composable predicates (equality, membership, substring) that compile
//! onto a `QueryBuilder`. Column names come from code, never from user input;
//! only operands are bound.

use sqlx::{QueryBuilder, Sqlite};

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Text(String),
    Int(i64),
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Text(v.to_string())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Text(v)
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Int(v)
    }
}

#[derive(Debug, Clone)]
enum Predicate {
    Eq(&'static str, Arg),
    In(&'static str, Vec<Arg>),
    Contains(&'static str, String),
}

/// A conjunction of predicates.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    predicates: Vec<Predicate>,
}

fn escape_like(needle: &str) -> String {
    needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &'static str, value: impl Into<Arg>) -> Self {
        self.predicates.push(Predicate::Eq(column, value.into()));
        self
    }

    pub fn is_in(mut self, column: &'static str, values: Vec<Arg>) -> Self {
        self.predicates.push(Predicate::In(column, values));
        self
    }

    pub fn contains(mut self, column: &'static str, needle: &str) -> Self {
        self.predicates
            .push(Predicate::Contains(column, needle.to_string()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Append ` WHERE ...` to the builder. An empty `IN ()` matches nothing,
    /// which is the only sound reading of membership in the empty set.
    pub fn push_where(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        for (i, predicate) in self.predicates.iter().enumerate() {
            qb.push(if i == 0 { " WHERE " } else { " AND " });
            match predicate {
                Predicate::Eq(column, arg) => {
                    qb.push(*column).push(" = ");
                    push_arg(qb, arg);
                }
                Predicate::In(column, args) => {
                    if args.is_empty() {
                        qb.push("1 = 0");
                        continue;
                    }
                    qb.push(*column).push(" IN (");
                    for (j, arg) in args.iter().enumerate() {
                        if j > 0 {
                            qb.push(", ");
                        }
                        push_arg(qb, arg);
                    }
                    qb.push(")");
                }
                Predicate::Contains(column, needle) => {
                    qb.push(*column)
                        .push(" LIKE ")
                        .push_bind(format!("%{}%", escape_like(needle)))
                        .push(" ESCAPE '\\'");
                }
            }
        }
    }
}

fn push_arg(qb: &mut QueryBuilder<'_, Sqlite>, arg: &Arg) {
    match arg {
        Arg::Text(v) => qb.push_bind(v.clone()),
        Arg::Int(v) => qb.push_bind(*v),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql_for(filters: &Filters) -> String {
        let mut qb = QueryBuilder::new("SELECT * FROM repos");
        filters.push_where(&mut qb);
        qb.sql().to_string()
    }

    #[test]
    fn empty_filters_add_no_clause() {
        assert_eq!(sql_for(&Filters::new()), "SELECT * FROM repos");
    }

    #[test]
    fn predicates_join_with_and() {
        let filters = Filters::new()
            .eq("did", "did:plc:x")
            .contains("name", "demo");
        let sql = sql_for(&filters);
        assert!(sql.contains("WHERE did = "));
        assert!(sql.contains("AND name LIKE "));
        assert!(sql.contains("ESCAPE"));
    }

    #[test]
    fn membership_binds_each_value() {
        let filters = Filters::new().is_in("knot", vec!["a".into(), "b".into()]);
        let sql = sql_for(&filters);
        assert!(sql.contains("knot IN ("));
    }

    #[test]
    fn empty_membership_matches_nothing() {
        let filters = Filters::new().is_in("knot", vec![]);
        assert!(sql_for(&filters).contains("1 = 0"));
    }

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("50%_done"), "50\\%\\_done");
    }
}
