//! Replays a recovery script into a database.
//!
//! Only the statements the recovery engine writes are understood:
//! `CREATE TABLE`, `CREATE [UNIQUE] INDEX` and `INSERT INTO ... VALUES`.
//! Inserts are parsed row by row off the token stream so a large script is
//! never held as one syntax tree.

use std::{fs, path::Path};

use sqlparser::{
    ast::{
        ColumnOption, CreateIndex, CreateTable, Expr, ObjectName, Statement, TableConstraint,
        UnaryOperator, Value as SqlValue,
    },
    dialect::GenericDialect,
    keywords::Keyword,
    parser::{IsOptional, Parser},
    tokenizer::Token,
};
use tracing::{debug, info};

use crate::{
    storage::{
        database::Database,
        schema::{ColumnSchema, TableSchemaBuilder},
    },
    types::{
        error::DatabaseError,
        value::{DataType, Value, hex_decode},
    },
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScriptStats {
    pub tables: usize,
    pub indexes: usize,
    pub rows: usize,
}

pub struct ScriptRunner<'a> {
    db: &'a Database,
    stats: ScriptStats,
}

fn object_name(name: &ObjectName) -> String {
    name.0
        .last()
        .map(|ident| ident.value.clone())
        .unwrap_or_default()
}

fn number(digits: &str) -> Result<Value, DatabaseError> {
    match digits.parse::<i64>() {
        Ok(i) => Ok(Value::Integer(i)),
        Err(_) => digits
            .parse::<f64>()
            .map(Value::Real)
            .map_err(|_| DatabaseError::UnsupportedStatement {
                details: format!("numeric literal {}", digits),
            }),
    }
}

/// Turn a literal expression into a value; anything else is rejected.
fn literal(expr: &Expr) -> Result<Value, DatabaseError> {
    match expr {
        Expr::Value(SqlValue::Null) => Ok(Value::Null),
        Expr::Value(SqlValue::Boolean(b)) => Ok(Value::Boolean(*b)),
        Expr::Value(SqlValue::Number(digits, _)) => number(digits),
        Expr::Value(SqlValue::SingleQuotedString(text)) => Ok(Value::Text(text.clone())),
        Expr::Value(SqlValue::HexStringLiteral(hex)) => Ok(Value::Blob(hex_decode(hex)?)),
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match expr.as_ref() {
            Expr::Value(SqlValue::Number(digits, _)) => number(&format!("-{}", digits)),
            inner => match literal(inner)? {
                Value::Real(r) => Ok(Value::Real(-r)),
                other => Err(DatabaseError::UnsupportedStatement {
                    details: format!("cannot negate {:?}", other),
                }),
            },
        },
        Expr::Nested(inner) => literal(inner),
        other => Err(DatabaseError::UnsupportedStatement {
            details: format!("expected a literal, found {}", other),
        }),
    }
}

impl<'a> ScriptRunner<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self {
            db,
            stats: ScriptStats::default(),
        }
    }

    pub fn run_file(&mut self, path: &Path) -> Result<ScriptStats, DatabaseError> {
        let sql = fs::read_to_string(path)?;
        self.run(&sql)
    }

    /// Execute every statement in `sql`; the first failing statement stops
    /// the run.
    pub fn run(&mut self, sql: &str) -> Result<ScriptStats, DatabaseError> {
        let dialect = GenericDialect {};
        let mut parser = Parser::new(&dialect).try_with_sql(sql)?;

        loop {
            while parser.consume_token(&Token::SemiColon) {}
            if parser.peek_token().token == Token::EOF {
                break;
            }
            if parser.parse_keyword(Keyword::INSERT) {
                self.insert(&mut parser)?;
            } else {
                let statement = parser.parse_statement()?;
                self.apply(statement)?;
            }
        }

        info!(
            tables = self.stats.tables,
            indexes = self.stats.indexes,
            rows = self.stats.rows,
            "script replayed"
        );
        Ok(self.stats)
    }

    fn apply(&mut self, statement: Statement) -> Result<(), DatabaseError> {
        match statement {
            Statement::CreateTable(create) => self.create_table(create),
            Statement::CreateIndex(create) => self.create_index(create),
            other => Err(DatabaseError::UnsupportedStatement {
                details: other.to_string(),
            }),
        }
    }

    fn create_table(&mut self, create: CreateTable) -> Result<(), DatabaseError> {
        let table = object_name(&create.name);
        let primary_columns: Vec<String> = create
            .constraints
            .iter()
            .filter_map(|constraint| match constraint {
                TableConstraint::PrimaryKey { columns, .. } => Some(columns),
                _ => None,
            })
            .flatten()
            .map(|ident| ident.value.clone())
            .collect();

        let mut builder = TableSchemaBuilder::new(table.clone());
        let mut unique_columns = Vec::new();
        for column in &create.columns {
            let data_type = DataType::from_string(&column.data_type.to_string())?;
            let mut schema = ColumnSchema::new(column.name.value.clone(), data_type);
            for option in &column.options {
                match &option.option {
                    ColumnOption::NotNull => schema = schema.not_null(),
                    ColumnOption::Null => {}
                    ColumnOption::Unique {
                        is_primary: true, ..
                    } => schema = schema.primary_key(),
                    ColumnOption::Unique { .. } => unique_columns.push(column.name.value.clone()),
                    ColumnOption::Default(expr) => {
                        schema = schema.with_default(literal(expr)?.coerce_to(&data_type)?)
                    }
                    other => {
                        return Err(DatabaseError::UnsupportedStatement {
                            details: format!("column option {}", other),
                        });
                    }
                }
            }
            if primary_columns.contains(&column.name.value) {
                schema = schema.primary_key();
            }
            builder = builder.column(schema);
        }

        self.db.create_table(builder.build()?)?;
        self.stats.tables += 1;
        for column in unique_columns {
            let name = format!("{}_{}_unique", table, column);
            self.db.create_index(&table, &name, &[column.as_str()], true)?;
            self.stats.indexes += 1;
        }
        debug!(table = %table, "table replayed");
        Ok(())
    }

    fn create_index(&mut self, create: CreateIndex) -> Result<(), DatabaseError> {
        let table = object_name(&create.table_name);
        let name = create
            .name
            .as_ref()
            .map(object_name)
            .ok_or_else(|| DatabaseError::UnsupportedStatement {
                details: format!("unnamed index on {}", table),
            })?;
        let columns = create
            .columns
            .iter()
            .map(|column| match &column.expr {
                Expr::Identifier(ident) => Ok(ident.value.clone()),
                other => Err(DatabaseError::UnsupportedStatement {
                    details: format!("index expression {}", other),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let columns: Vec<&str> = columns.iter().map(String::as_str).collect();

        self.db.create_index(&table, &name, &columns, create.unique)?;
        self.stats.indexes += 1;
        Ok(())
    }

    // `INSERT` has been consumed; parse `INTO t [(cols)] VALUES (...), ...`.
    fn insert(&mut self, parser: &mut Parser) -> Result<(), DatabaseError> {
        parser.expect_keyword(Keyword::INTO)?;
        let table = object_name(&parser.parse_object_name(false)?);
        let listed = parser.parse_parenthesized_column_list(IsOptional::Optional, false)?;
        parser.expect_keyword(Keyword::VALUES)?;

        let schema = self.db.table(&table)?;
        let positions = listed
            .iter()
            .map(|ident| {
                schema
                    .get_column_index(&ident.value)
                    .ok_or_else(|| DatabaseError::ColumnNotFound {
                        name: ident.value.clone(),
                        table: table.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        loop {
            parser.expect_token(&Token::LParen)?;
            let exprs = parser.parse_comma_separated(|p| p.parse_expr())?;
            parser.expect_token(&Token::RParen)?;

            let literals = exprs.iter().map(literal).collect::<Result<Vec<_>, _>>()?;
            let values = if positions.is_empty() {
                literals
            } else {
                if positions.len() != literals.len() {
                    return Err(DatabaseError::ConstraintViolation {
                        details: format!(
                            "{} columns listed but {} values given",
                            positions.len(),
                            literals.len()
                        ),
                    });
                }
                let mut values = vec![Value::Null; schema.columns.len()];
                for (&position, value) in positions.iter().zip(literals) {
                    values[position] = value;
                }
                values
            };
            self.db.insert(&table, values)?;
            self.stats.rows += 1;

            if !parser.consume_token(&Token::Comma) {
                break;
            }
        }
        Ok(())
    }
}
