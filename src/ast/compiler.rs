//! Select and DDL compiler for the SQL Server dialect.
//!
//! Pure functions over the descriptors in `types.rs`. SQL Server (before
//! OFFSET/FETCH) has no trailing `LIMIT`, so scalar limits render as a leading
//! `top N` and offset pagination is emulated with `row_number()` wrapped in a
//! derived table.

use once_cell::sync::Lazy;
use regex::Regex;

use super::types::*;
use crate::error::CompileError;

/// Ordering expression used by [`apply_random_order`].
pub const RANDOM_ORDER: &str = "NewId()";

/// Alias of the synthetic row-number column used for pagination.
pub const ROW_NUMBER_ALIAS: &str = "_rn";

/// Column that numbers rows when a paginated select has no order.
pub const DEFAULT_ROW_ORDER_COLUMN: &str = "id";

const INTEGER_TYPES: &[&str] = &["int", "integer", "bigint", "smallint", "tinyint"];

static COUNT_DISTINCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)count\(\s*distinct\s+\S+?\s*\)").expect("valid regex"));

/// Quote an identifier with brackets: `id` → `[id]`, `dbo.users` → `[dbo].[users]`.
///
/// Already-bracketed parts and `*` pass through unchanged.
pub fn quote_ident(name: &str) -> String {
    split_ident(name)
        .into_iter()
        .map(|part| {
            if part == "*" || (part.starts_with('[') && part.ends_with(']') && part.len() >= 2) {
                part.to_string()
            } else {
                format!("[{}]", part.replace(']', "]]"))
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Split on dots that are not inside `[...]`.
fn split_ident(name: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_bracket = false;
    let mut chars = name.char_indices().peekable();

    while let Some((i, ch)) = chars.next() {
        match ch {
            '[' if !in_bracket => in_bracket = true,
            // `]]` is an escaped bracket inside a quoted part
            ']' if in_bracket => {
                if matches!(chars.peek(), Some((_, ']'))) {
                    chars.next();
                } else {
                    in_bracket = false;
                }
            }
            '.' if !in_bracket => {
                parts.push(&name[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&name[start..]);
    parts
}

/// Render a value as a SQL literal.
pub fn quote_literal(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Text(s) => quote_string(s),
    }
}

fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// True when the select list is a `count(distinct <expr>)` aggregate.
pub fn is_count_distinct(selects: &str) -> bool {
    COUNT_DISTINCT.is_match(selects)
}

/// Set the row limit.
///
/// A missing or zero offset yields a scalar limit; any other offset yields a
/// pagination range. A zero count clears the limit.
pub fn apply_limit(mut query: SelectQuery, count: u64, offset: Option<u64>) -> SelectQuery {
    query.limit = match (count, offset) {
        (0, _) => None,
        (count, None | Some(0)) => Some(Limit::Count(count)),
        (count, Some(offset)) => Some(Limit::Range { offset, count }),
    };
    query
}

/// Order rows randomly, replacing any previous order.
pub fn apply_random_order(mut query: SelectQuery) -> SelectQuery {
    query.order_by = RANDOM_ORDER.to_string();
    query
}

/// Compile a select descriptor into T-SQL.
pub fn compile_select(query: &SelectQuery) -> Result<String, CompileError> {
    if query.table.is_empty() && query.join.is_empty() {
        return Err(CompileError::EmptyTable);
    }

    let page = match query.limit {
        Some(Limit::Range { count: 0, offset }) => return Err(CompileError::EmptyPage { offset }),
        Some(Limit::Range { offset, count }) => {
            let end = offset
                .checked_add(count)
                .ok_or(CompileError::PageOverflow { offset, count })?;
            Some((offset, end))
        }
        _ => None,
    };

    let distinct = query.distinct && !is_count_distinct(&query.selects);
    let selects = if query.selects.trim().is_empty() {
        "*"
    } else {
        query.selects.as_str()
    };
    let order_by = if query.order_by.is_empty() {
        None
    } else {
        Some(format!("order by {}", query.order_by))
    };

    let mut sql = String::from("select ");

    if let Some(Limit::Count(n)) = query.limit {
        if n > 0 {
            sql.push_str(&format!("top {} ", n));
        }
    }

    if distinct {
        sql.push_str("distinct ");
    }
    sql.push_str(selects);

    if page.is_some() {
        let over = match &order_by {
            Some(order) => order.clone(),
            None => {
                let column = query
                    .row_order_column
                    .as_deref()
                    .unwrap_or(DEFAULT_ROW_ORDER_COLUMN);
                format!("order by {}", quote_ident(column))
            }
        };
        sql.push_str(&format!(
            ", row_number() over({}) {}",
            over,
            quote_ident(ROW_NUMBER_ALIAS)
        ));
    }

    sql.push_str(" from ");
    if query.join.is_empty() {
        sql.push_str(&quote_ident(&query.table));
    } else {
        sql.push_str(&query.join);
    }

    if !query.where_clause.is_empty() {
        sql.push_str(&format!(" where {}", query.where_clause));
    }

    if page.is_none() {
        if let Some(order) = &order_by {
            sql.push(' ');
            sql.push_str(order);
        }
    }

    if !query.group_by.is_empty() {
        sql.push_str(&format!(" group by {}", query.group_by));
    }

    if !query.having.is_empty() {
        sql.push_str(&format!(" having {}", query.having));
    }

    if let Some((start, end)) = page {
        let rn = quote_ident(ROW_NUMBER_ALIAS);
        sql = format!(
            "select * from ({}) tmp where tmp.{} > {} and tmp.{} <= {}",
            sql, rn, start, rn, end
        );
    }

    if !query.union.is_empty() {
        sql.push_str(&format!(" union {}", query.union));
    }

    Ok(sql)
}

/// Compile a table descriptor into a `create table` statement.
pub fn compile_create_table(table: &TableSchema) -> Result<String, CompileError> {
    if table.fields.is_empty() {
        return Err(CompileError::NoColumns(table.name.clone()));
    }

    if table.fields.iter().filter(|f| f.is_identity()).count() > 1 {
        return Err(CompileError::MultipleIdentity(table.name.clone()));
    }

    let mut columns = Vec::with_capacity(table.fields.len());
    let mut primary = Vec::new();
    let mut foreigns = Vec::new();

    for field in &table.fields {
        columns.push(compile_column(field));

        if field.primary {
            primary.push(quote_ident(&field.name));
        }

        if let Some(fk) = &field.foreign_key {
            if !fk.table.is_empty() {
                foreigns.push(format!(
                    "foreign key ({}) references {} ({}) on delete {} on update {}",
                    quote_ident(&field.name),
                    quote_ident(&fk.table),
                    quote_ident(&fk.field),
                    fk.on_delete,
                    fk.on_update
                ));
            }
        }
    }

    if !primary.is_empty() {
        columns.push(format!("primary key({})", primary.join(", ")));
    }
    columns.extend(foreigns);

    Ok(format!(
        "create table {} (\n\t{}\n)",
        quote_ident(&table.name),
        columns.join(",\n\t")
    ))
}

/// Compile a `drop table` statement.
pub fn compile_drop_table(name: &str) -> String {
    format!("drop table {}", quote_ident(name))
}

fn compile_column(field: &FieldDef) -> String {
    let identity = if field.is_identity() {
        field.auto_increment
    } else {
        None
    };

    let (type_name, length) = match identity {
        Some(_) => {
            let lower = field.type_name.to_lowercase();
            let type_name = if INTEGER_TYPES.contains(&lower.as_str()) {
                field.type_name.as_str()
            } else {
                "int"
            };
            (type_name, None)
        }
        None => (field.type_name.as_str(), field.length.as_ref()),
    };

    let mut column = format!("{} {}", quote_ident(&field.name), type_name);

    match length {
        Some(Length::List(parts)) if !parts.is_empty() => {
            let parts: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
            column.push_str(&format!("({})", parts.join(",")));
        }
        Some(Length::Scalar(n)) if *n > 0 => column.push_str(&format!("({})", n)),
        _ => {}
    }

    if let Some(identity) = identity {
        column.push_str(&format!(" identity({},{})", identity.seed, identity.step));
    }

    if field.unique {
        column.push_str(" unique");
    }
    if field.unsigned {
        column.push_str(" unsigned");
    }
    if field.not_null {
        column.push_str(" not null");
    }

    match &field.default {
        Some(Value::Null) => column.push_str(" default null"),
        Some(value) => column.push_str(&format!(" default {}", quote_literal(value))),
        None => {}
    }

    if let Some(comment) = &field.comment {
        if !comment.is_empty() {
            column.push_str(&format!(" comment {}", quote_string(comment)));
        }
    }

    column
}
