//! Structural validation of generated SQL.
//!
//! This is the boundary between free-text model output and a live database.
//! A [`SynthesizedQuery`] can only be obtained from [`validate`], and every
//! backend only accepts a `SynthesizedQuery`, so unvalidated SQL cannot reach
//! a backend.
//!
//! A statement passes when:
//! - it parses as exactly one query (`SELECT`, set operations of selects,
//!   optional non-recursive CTEs) with no `INTO`, locking or `FETCH` clause;
//! - every relation is the dataset table or a CTE defined in the statement;
//! - every column identifier resolves to a column exposed by a `FROM` source
//!   of its own or an enclosing `SELECT` (the table, a CTE, or a derived
//!   table), and every qualifier names one of those sources;
//! - projection aliases are only visible to `ORDER BY`, `GROUP BY` and
//!   `HAVING`, never to the expressions that define them;
//! - every function is on the allowlist (`ST_*` only for PostGIS);
//! - the top-level projection returns the geometry and id columns.
//!
//! The row cap is enforced by adding or clamping `LIMIT`. The returned
//! `sql_text` is the validated statement re-rendered from its AST.

use sqlparser::ast::{
    Expr, Ident, JoinConstraint, JoinOperator, ObjectName, Query, Select, SelectItem, SetExpr,
    Statement, TableAlias, TableFactor, Value as SqlValue, Visit, Visitor,
};
use sqlparser::dialect::{Dialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::ControlFlow;

use crate::error::EngineError;
use crate::models::{ColumnRole, SchemaDescriptor, SqlDialect};

/// Functions any dialect may call.
const ALLOWED_FUNCTIONS: &[&str] = &[
    "abs", "avg", "ceil", "ceiling", "coalesce", "concat", "count", "dense_rank", "floor",
    "greatest", "ifnull", "instr", "least", "length", "lower", "ltrim", "max", "min", "ntile",
    "nullif", "percent_rank", "power", "rank", "replace", "round", "row_number", "rtrim", "sqrt",
    "stddev", "substr", "substring", "sum", "total", "trim", "upper", "variance",
];

/// A validated, read-only query ready for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedQuery {
    sql_text: String,
    referenced_variables: BTreeSet<String>,
}

impl SynthesizedQuery {
    pub fn sql_text(&self) -> &str {
        &self.sql_text
    }

    /// Catalog variables the query mentions.
    pub fn referenced_variables(&self) -> &BTreeSet<String> {
        &self.referenced_variables
    }
}

fn dialect_for(dialect: SqlDialect) -> Box<dyn Dialect> {
    match dialect {
        SqlDialect::Sqlite => Box::new(SQLiteDialect {}),
        SqlDialect::Postgres => Box::new(PostgreSqlDialect {}),
    }
}

fn reject(reason: impl Into<String>, sql: &str) -> EngineError {
    EngineError::unsafe_query(reason, Some(sql.to_string()))
}

/// A `FROM` item and the (lowercase) columns it exposes.
#[derive(Clone, Debug)]
struct Source {
    /// Table name or alias; `None` for unaliased subqueries and set-operation output.
    name: Option<String>,
    columns: Vec<String>,
}

/// Names visible at one point of the statement.
#[derive(Clone, Default)]
struct Scope {
    /// CTEs defined so far, with their output columns.
    ctes: HashMap<String, Vec<String>>,
    /// Sources of the `SELECT` being checked.
    sources: Vec<Source>,
    /// Sources of enclosing selects, for correlated subqueries.
    outer: Vec<Source>,
    /// Projection aliases; only consulted where `allow_aliases` is set.
    aliases: HashSet<String>,
}

impl Scope {
    /// Scope for a query nested directly inside `self`.
    fn nested(&self) -> Scope {
        let mut outer = self.outer.clone();
        outer.extend(self.sources.iter().cloned());
        Scope {
            ctes: self.ctes.clone(),
            sources: Vec::new(),
            outer,
            aliases: HashSet::new(),
        }
    }

    fn visible(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter().chain(self.outer.iter())
    }
}

/// Validate `sql` against `schema`.
pub fn validate(sql: &str, schema: &SchemaDescriptor) -> Result<SynthesizedQuery, EngineError> {
    let dialect = dialect_for(schema.dialect);
    let mut statements = Parser::parse_sql(dialect.as_ref(), sql)
        .map_err(|e| reject(format!("the SQL could not be parsed: {}", e), sql))?;

    if statements.len() != 1 {
        return Err(reject(
            format!("expected exactly one statement, found {}", statements.len()),
            sql,
        ));
    }
    let mut statement = statements.remove(0);

    let query = match &statement {
        Statement::Query(query) => query,
        _ => return Err(reject("only SELECT queries are allowed", sql)),
    };

    let mut checker = Checker {
        schema,
        table: schema.table.to_lowercase(),
        referenced: BTreeSet::new(),
    };
    checker
        .query(query, &Scope::default())
        .map_err(|r| reject(r, sql))?;

    if !projection_covers(&query.body, &schema.geometry_column) {
        return Err(reject(
            format!(
                "the query must select the geometry column `{}`",
                schema.geometry_column
            ),
            sql,
        ));
    }
    if !projection_covers(&query.body, &schema.id_column) {
        return Err(reject(
            format!("the query must select the id column `{}`", schema.id_column),
            sql,
        ));
    }

    let referenced_variables = checker.referenced;
    if let Statement::Query(query) = &mut statement {
        enforce_limit(query, schema.max_rows).map_err(|r| reject(r, sql))?;
    }

    Ok(SynthesizedQuery {
        sql_text: statement.to_string(),
        referenced_variables,
    })
}

struct Checker<'a> {
    schema: &'a SchemaDescriptor,
    table: String,
    referenced: BTreeSet<String>,
}

impl Checker<'_> {
    /// Check `query` nested in `parent`; returns its output columns.
    fn query(&mut self, query: &Query, parent: &Scope) -> Result<Vec<String>, String> {
        if !query.locks.is_empty() {
            return Err("locking clauses are not allowed".to_string());
        }
        if query.fetch.is_some() {
            return Err("use LIMIT instead of FETCH".to_string());
        }

        let mut scope = parent.nested();
        if let Some(with) = &query.with {
            if with.recursive {
                return Err("recursive CTEs are not allowed".to_string());
            }
            for cte in &with.cte_tables {
                let columns = self.query(&cte.query, &scope)?;
                let columns = renamed(&cte.alias, columns);
                scope.ctes.insert(cte.alias.name.value.to_lowercase(), columns);
            }
        }

        let (columns, body_scope) = self.set_expr(&query.body, &scope)?;
        self.visit_in(&query.order_by, &body_scope, true)?;
        self.visit_in(&query.limit, &scope, false)?;
        self.visit_in(&query.offset, &scope, false)?;
        Ok(columns)
    }

    /// Returns the output columns and the scope `ORDER BY` resolves in.
    fn set_expr(&mut self, body: &SetExpr, scope: &Scope) -> Result<(Vec<String>, Scope), String> {
        match body {
            SetExpr::Select(select) => self.select(select, scope),
            SetExpr::Query(query) => {
                let columns = self.query(query, scope)?;
                Ok((columns.clone(), output_scope(scope, columns)))
            }
            SetExpr::SetOperation { left, right, .. } => {
                let (columns, _) = self.set_expr(left, scope)?;
                self.set_expr(right, scope)?;
                Ok((columns.clone(), output_scope(scope, columns)))
            }
            _ => Err("only SELECT queries are allowed".to_string()),
        }
    }

    fn select(&mut self, select: &Select, parent: &Scope) -> Result<(Vec<String>, Scope), String> {
        if select.into.is_some() {
            return Err("SELECT INTO is not allowed".to_string());
        }
        if select.qualify.is_some() || !select.named_window.is_empty() {
            return Err("QUALIFY and WINDOW clauses are not supported".to_string());
        }

        let mut scope = Scope {
            ctes: parent.ctes.clone(),
            sources: Vec::new(),
            outer: parent.outer.clone(),
            aliases: HashSet::new(),
        };
        for table in &select.from {
            self.table_factor(&table.relation, &mut scope)?;
            for join in &table.joins {
                self.table_factor(&join.relation, &mut scope)?;
            }
        }
        for table in &select.from {
            for join in &table.joins {
                self.join_constraint(&join.join_operator, &scope)?;
            }
        }

        let mut columns = Vec::new();
        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) => {
                    self.visit_in(expr, &scope, false)?;
                    match expr {
                        Expr::Identifier(ident) => columns.push(ident.value.to_lowercase()),
                        Expr::CompoundIdentifier(parts) => {
                            if let Some(last) = parts.last() {
                                columns.push(last.value.to_lowercase());
                            }
                        }
                        _ => {}
                    }
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    self.visit_in(expr, &scope, false)?;
                    columns.push(alias.value.to_lowercase());
                }
                SelectItem::Wildcard(_) => {
                    for source in &scope.sources {
                        columns.extend(source.columns.iter().cloned());
                    }
                }
                SelectItem::QualifiedWildcard(name, _) => {
                    let qualifier = name.to_string().to_lowercase();
                    let source = scope
                        .sources
                        .iter()
                        .find(|s| s.name.as_deref() == Some(qualifier.as_str()))
                        .ok_or_else(|| format!("unknown table qualifier `{}`", name))?;
                    columns.extend(source.columns.iter().cloned());
                }
            }
        }

        self.visit_in(&select.distinct, &scope, false)?;
        self.visit_in(&select.selection, &scope, false)?;

        for item in &select.projection {
            if let SelectItem::ExprWithAlias { alias, .. } = item {
                scope.aliases.insert(alias.value.to_lowercase());
            }
        }
        self.visit_in(&select.group_by, &scope, true)?;
        self.visit_in(&select.having, &scope, true)?;

        Ok((columns, scope))
    }

    fn table_factor(&mut self, factor: &TableFactor, scope: &mut Scope) -> Result<(), String> {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let columns = self.relation_columns(name, scope)?;
                let source_name = match alias {
                    Some(alias) => alias.name.value.to_lowercase(),
                    None => name
                        .0
                        .last()
                        .map(|i| i.value.to_lowercase())
                        .unwrap_or_default(),
                };
                let columns = match alias {
                    Some(alias) => renamed(alias, columns),
                    None => columns,
                };
                scope.sources.push(Source {
                    name: Some(source_name),
                    columns,
                });
                Ok(())
            }
            TableFactor::Derived {
                lateral,
                subquery,
                alias,
            } => {
                let parent = if *lateral {
                    scope.clone()
                } else {
                    Scope {
                        sources: Vec::new(),
                        ..scope.clone()
                    }
                };
                let columns = self.query(subquery, &parent)?;
                let (name, columns) = match alias {
                    Some(alias) => (Some(alias.name.value.to_lowercase()), renamed(alias, columns)),
                    None => (None, columns),
                };
                scope.sources.push(Source { name, columns });
                Ok(())
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => {
                self.table_factor(&table_with_joins.relation, scope)?;
                for join in &table_with_joins.joins {
                    self.table_factor(&join.relation, scope)?;
                }
                for join in &table_with_joins.joins {
                    self.join_constraint(&join.join_operator, scope)?;
                }
                Ok(())
            }
            _ => Err("only plain tables and subqueries may appear in FROM".to_string()),
        }
    }

    fn relation_columns(&self, name: &ObjectName, scope: &Scope) -> Result<Vec<String>, String> {
        let parts: Vec<String> = name.0.iter().map(|i| i.value.to_lowercase()).collect();
        let table_columns = || {
            self.schema
                .columns
                .iter()
                .map(|c| c.name.to_lowercase())
                .collect::<Vec<_>>()
        };
        match parts.as_slice() {
            [only] if scope.ctes.contains_key(only) => Ok(scope.ctes[only].clone()),
            [only] if *only == self.table => Ok(table_columns()),
            [schema, only] if (schema == "public" || schema == "main") && *only == self.table => {
                Ok(table_columns())
            }
            _ => Err(format!(
                "unknown table `{}`; only `{}` may be queried",
                name, self.table
            )),
        }
    }

    fn join_constraint(&mut self, operator: &JoinOperator, scope: &Scope) -> Result<(), String> {
        let constraint = match operator {
            JoinOperator::Inner(c)
            | JoinOperator::LeftOuter(c)
            | JoinOperator::RightOuter(c)
            | JoinOperator::FullOuter(c)
            | JoinOperator::LeftSemi(c)
            | JoinOperator::RightSemi(c)
            | JoinOperator::LeftAnti(c)
            | JoinOperator::RightAnti(c) => c,
            _ => return Ok(()),
        };
        match constraint {
            JoinConstraint::On(expr) => self.visit_in(expr, scope, false),
            JoinConstraint::Using(columns) => {
                for column in columns {
                    self.column(None, column, scope, false)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Check every expression in `node` against `scope`. Queries nested in
    /// expressions are checked with `scope` as their enclosing scope.
    fn visit_in<N: Visit>(&mut self, node: &N, scope: &Scope, allow_aliases: bool) -> Result<(), String> {
        let mut visitor = ExprCheck {
            checker: self,
            scope,
            allow_aliases,
            depth: 0,
        };
        match node.visit(&mut visitor) {
            ControlFlow::Break(reason) => Err(reason),
            ControlFlow::Continue(()) => Ok(()),
        }
    }

    fn expr(&mut self, expr: &Expr, scope: &Scope, allow_aliases: bool) -> Result<(), String> {
        match expr {
            Expr::Identifier(ident) => self.column(None, ident, scope, allow_aliases),
            Expr::CompoundIdentifier(parts) => match parts.as_slice() {
                [qualifier, column] => self.column(Some(qualifier), column, scope, false),
                _ => Err(format!(
                    "identifier `{}` is too deeply qualified",
                    parts
                        .iter()
                        .map(|p| p.value.as_str())
                        .collect::<Vec<_>>()
                        .join(".")
                )),
            },
            Expr::Function(function) => check_function(&function.name, self.schema.dialect),
            Expr::Value(SqlValue::Placeholder(p)) => {
                Err(format!("placeholder `{}` is not allowed", p))
            }
            _ => Ok(()),
        }
    }

    fn column(
        &mut self,
        qualifier: Option<&Ident>,
        column: &Ident,
        scope: &Scope,
        allow_aliases: bool,
    ) -> Result<(), String> {
        let name = column.value.to_lowercase();
        let found = match qualifier {
            Some(q) => {
                let q_name = q.value.to_lowercase();
                let source = scope
                    .visible()
                    .find(|s| s.name.as_deref() == Some(q_name.as_str()))
                    .ok_or_else(|| format!("unknown table qualifier `{}`", q.value))?;
                source.columns.contains(&name)
            }
            None => {
                scope.visible().any(|s| s.columns.contains(&name))
                    || (allow_aliases && scope.aliases.contains(&name))
            }
        };

        if !found {
            return Err(if column.quote_style == Some('"') {
                format!(
                    "unknown column `{}` (string literals must use single quotes)",
                    column.value
                )
            } else {
                format!("unknown column `{}`", column.value)
            });
        }
        if let Some(schema_column) = self.schema.column(&column.value) {
            if schema_column.role == ColumnRole::Variable {
                self.referenced.insert(schema_column.name.clone());
            }
        }
        Ok(())
    }
}

/// Expression visitor for one clause; stops at nested query boundaries.
struct ExprCheck<'c, 'a> {
    checker: &'c mut Checker<'a>,
    scope: &'c Scope,
    allow_aliases: bool,
    depth: usize,
}

impl Visitor for ExprCheck<'_, '_> {
    type Break = String;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<String> {
        if self.depth == 0 {
            if let Err(reason) = self.checker.query(query, self.scope) {
                return ControlFlow::Break(reason);
            }
        }
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<String> {
        self.depth -= 1;
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<String> {
        if self.depth > 0 {
            return ControlFlow::Continue(());
        }
        match self.checker.expr(expr, self.scope, self.allow_aliases) {
            Ok(()) => ControlFlow::Continue(()),
            Err(reason) => ControlFlow::Break(reason),
        }
    }
}

/// Apply an alias column list (`AS t(a, b)`) to a source's columns.
fn renamed(alias: &TableAlias, columns: Vec<String>) -> Vec<String> {
    if alias.columns.is_empty() {
        columns
    } else {
        alias.columns.iter().map(|c| c.value.to_lowercase()).collect()
    }
}

fn output_scope(scope: &Scope, columns: Vec<String>) -> Scope {
    Scope {
        ctes: scope.ctes.clone(),
        sources: vec![Source {
            name: None,
            columns,
        }],
        outer: scope.outer.clone(),
        aliases: HashSet::new(),
    }
}

fn check_function(name: &ObjectName, dialect: SqlDialect) -> Result<(), String> {
    let [ident] = name.0.as_slice() else {
        return Err(format!("function `{}` is not allowed", name));
    };
    let lower = ident.value.to_lowercase();
    let spatial = dialect == SqlDialect::Postgres && lower.starts_with("st_");
    if spatial || ALLOWED_FUNCTIONS.contains(&lower.as_str()) {
        Ok(())
    } else {
        Err(format!("function `{}` is not allowed", ident.value))
    }
}

fn projection_covers(body: &SetExpr, column: &str) -> bool {
    match body {
        SetExpr::Select(select) => select.projection.iter().any(|item| match item {
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => true,
            SelectItem::UnnamedExpr(Expr::Identifier(ident)) => {
                ident.value.eq_ignore_ascii_case(column)
            }
            SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => parts
                .last()
                .is_some_and(|p| p.value.eq_ignore_ascii_case(column)),
            SelectItem::ExprWithAlias { alias, .. } => alias.value.eq_ignore_ascii_case(column),
            _ => false,
        }),
        SetExpr::Query(query) => projection_covers(&query.body, column),
        SetExpr::SetOperation { left, .. } => projection_covers(left, column),
        _ => false,
    }
}

fn enforce_limit(query: &mut Query, max_rows: u64) -> Result<(), String> {
    let cap = || Expr::Value(SqlValue::Number(max_rows.to_string(), false));
    match &query.limit {
        None => query.limit = Some(cap()),
        Some(Expr::Value(SqlValue::Number(n, _))) => {
            let n: u64 = n
                .parse()
                .map_err(|_| format!("LIMIT must be a whole number, got {}", n))?;
            if n > max_rows {
                query.limit = Some(cap());
            }
        }
        Some(other) => return Err(format!("LIMIT must be a number, got {}", other)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SchemaColumn;

    fn schema(dialect: SqlDialect) -> SchemaDescriptor {
        let col = |name: &str, role| SchemaColumn {
            name: name.to_string(),
            role,
            description: None,
        };
        SchemaDescriptor {
            table: "censo".to_string(),
            dialect,
            geometry_column: "geom".to_string(),
            id_column: "dicofre".to_string(),
            columns: vec![
                col("dicofre", ColumnRole::Id),
                col("freguesia", ColumnRole::Attribute),
                col("concelho", ColumnRole::Attribute),
                col("pct_women", ColumnRole::Variable),
                col("pop_total", ColumnRole::Variable),
                col("geom", ColumnRole::Geometry),
            ],
            max_rows: 500,
        }
    }

    fn ok(sql: &str) -> SynthesizedQuery {
        validate(sql, &schema(SqlDialect::Sqlite)).unwrap()
    }

    fn reason(sql: &str) -> String {
        match validate(sql, &schema(SqlDialect::Sqlite)).unwrap_err() {
            EngineError::UnsafeQuery { reason, sql: Some(_) } => reason,
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn accepts_simple_filtered_select() {
        let q = ok("SELECT dicofre, freguesia, pct_women, geom FROM censo WHERE concelho = 'Lisboa'");
        assert!(q.sql_text().contains("LIMIT 500"));
        assert!(q.referenced_variables().contains("pct_women"));
        assert!(!q.referenced_variables().contains("freguesia"));
    }

    #[test]
    fn clamps_large_limits_and_keeps_small_ones() {
        assert!(ok("SELECT * FROM censo LIMIT 100000").sql_text().ends_with("LIMIT 500"));
        assert!(ok("SELECT * FROM censo LIMIT 5").sql_text().ends_with("LIMIT 5"));
    }

    #[test]
    fn rejects_unknown_columns() {
        assert!(reason("SELECT dicofre, geom, salary FROM censo").contains("salary"));
    }

    #[test]
    fn hints_at_double_quoted_strings() {
        let r = reason("SELECT * FROM censo WHERE concelho = \"Lisboa\"");
        assert!(r.contains("single quotes"));
    }

    #[test]
    fn rejects_writes_and_ddl() {
        for sql in [
            "DELETE FROM censo",
            "UPDATE censo SET pct_women = 0",
            "INSERT INTO censo (dicofre) VALUES ('1')",
            "DROP TABLE censo",
            "CREATE TABLE x (a INT)",
            "ATTACH DATABASE 'x.db' AS x",
        ] {
            assert!(validate(sql, &schema(SqlDialect::Sqlite)).is_err(), "{sql}");
        }
    }

    #[test]
    fn rejects_multiple_statements() {
        assert!(reason("SELECT * FROM censo; DROP TABLE censo").contains("exactly one"));
    }

    #[test]
    fn rejects_other_tables() {
        assert!(reason("SELECT * FROM sqlite_master").contains("unknown table"));
        assert!(reason("SELECT * FROM censo JOIN users ON 1 = 1").contains("unknown table"));
    }

    #[test]
    fn rejects_select_into_on_postgres() {
        let err = validate(
            "SELECT * INTO copy FROM censo",
            &schema(SqlDialect::Postgres),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::UnsafeQuery { .. }));
    }

    #[test]
    fn function_allowlist() {
        assert!(reason("SELECT dicofre, geom, load_extension('x') FROM censo").contains("load_extension"));
        let pg = schema(SqlDialect::Postgres);
        assert!(validate(
            "SELECT dicofre, ST_Area(geom) AS area, geom FROM censo",
            &pg
        )
        .is_ok());
        assert!(validate("SELECT dicofre, geom, pg_sleep(10) FROM censo", &pg).is_err());
        assert!(reason("SELECT dicofre, ST_Area(geom) AS a, geom FROM censo").contains("ST_Area"));
    }

    #[test]
    fn requires_geometry_and_id() {
        assert!(reason("SELECT dicofre, pct_women FROM censo").contains("geometry"));
        assert!(reason("SELECT pct_women, geom FROM censo").contains("id column"));
    }

    #[test]
    fn aliases_and_ctes_are_known() {
        let q = ok("WITH lx AS (SELECT * FROM censo WHERE concelho = 'Lisboa') \
                    SELECT c.dicofre, c.geom, c.pct_women AS women FROM lx AS c ORDER BY women DESC");
        assert!(q.referenced_variables().contains("pct_women"));
        assert!(reason("SELECT x.dicofre, geom FROM censo").contains("qualifier"));
    }

    #[test]
    fn checks_nested_subqueries() {
        ok("SELECT dicofre, geom, pct_women FROM censo \
            WHERE pct_women > (SELECT AVG(pct_women) FROM censo)");
        assert!(reason(
            "SELECT dicofre, geom FROM censo WHERE dicofre IN (SELECT id FROM other)"
        )
        .contains("unknown"));
    }

    #[test]
    fn aliases_do_not_vouch_for_their_own_expression() {
        assert!(reason("SELECT dicofre, geom, salary AS salary FROM censo").contains("salary"));
        let pg = schema(SqlDialect::Postgres);
        for sql in [
            "SELECT dicofre, geom, ctid AS ctid FROM censo",
            "SELECT dicofre, geom, xmin AS xmin FROM censo",
            "SELECT dicofre, geom, ctid AS c FROM censo ORDER BY c",
        ] {
            match validate(sql, &pg).unwrap_err() {
                EngineError::UnsafeQuery { reason, .. } => assert!(reason.contains("unknown column"), "{sql}"),
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[test]
    fn aliases_resolve_only_after_projection() {
        ok("SELECT dicofre, geom, pct_women AS w FROM censo ORDER BY w DESC");
        ok("SELECT dicofre, geom, ROUND(pct_women) AS w FROM censo GROUP BY dicofre, geom, w HAVING w > 50");
        assert!(reason("SELECT dicofre, geom, pct_women AS w FROM censo WHERE w > 50").contains("`w`"));
    }

    #[test]
    fn derived_tables_expose_only_their_projection() {
        let q = ok("SELECT t.dicofre, t.geom, t.w FROM \
                    (SELECT dicofre, geom, pct_women AS w FROM censo) AS t ORDER BY t.w");
        assert!(q.referenced_variables().contains("pct_women"));
        assert!(reason("SELECT dicofre, geom, pct_women FROM (SELECT dicofre, geom FROM censo) AS t")
            .contains("pct_women"));
        ok("WITH s(id, g, v) AS (SELECT dicofre, geom, pop_total FROM censo) \
            SELECT id AS dicofre, g AS geom, v FROM s");
        assert!(reason("WITH s(id, g) AS (SELECT dicofre, geom FROM censo) SELECT dicofre, geom FROM s")
            .contains("dicofre"));
    }

    #[test]
    fn correlated_subqueries_see_the_outer_table() {
        ok("SELECT a.dicofre, a.geom FROM censo AS a WHERE a.pct_women > \
            (SELECT AVG(b.pct_women) FROM censo AS b WHERE b.concelho = a.concelho)");
        assert!(reason("SELECT dicofre, geom FROM censo WHERE EXISTS (SELECT 1 FROM censo AS b WHERE b.salary > 0)")
            .contains("salary"));
    }

    #[test]
    fn rejects_recursive_ctes() {
        assert!(reason("WITH RECURSIVE r AS (SELECT dicofre, geom FROM censo UNION ALL SELECT dicofre, geom FROM r) \
                        SELECT dicofre, geom FROM r")
            .contains("recursive"));
    }

    #[test]
    fn output_is_stable() {
        let sql = "select dicofre, geom, pct_women from censo where concelho = 'Lisboa'";
        assert_eq!(ok(sql), ok(sql));
    }
}
