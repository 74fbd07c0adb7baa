// sitesnap/src/backup/db_dump.rs
use anyhow::{Context, Result};
use sqlx::{Connection, PgConnection, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

use crate::database::DumpSummary;

const BATCH_SIZE: i64 = 500;

struct Column {
    name: String,
    data_type: String,
    not_null: bool,
    default: Option<String>,
}

impl Column {
    fn is_binary(&self) -> bool {
        self.data_type == "bytea"
    }
}

struct SequenceDef {
    name: String,
    data_type: String,
    start: i64,
    min: i64,
    max: i64,
    increment: i64,
    cache: i64,
    cycle: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct ViewDef {
    oid: i64,
    name: String,
    definition: String,
}

/// Dumps the `public` schema through one repeatable-read, read-only
/// transaction so the file is consistent while the site stays online.
///
/// Layout: drops, sequences, tables, data, sequence positions, constraints,
/// indexes, views. Each statement ends with `;` at the end of its last line
/// and never contains a raw newline inside a literal.
pub async fn dump_database(conn: &mut PgConnection, dest: &Path) -> Result<DumpSummary> {
    let file = File::create(dest)
        .with_context(|| format!("Failed to create dump file: {}", dest.display()))?;
    let mut out = BufWriter::new(file);

    let mut tx = conn.begin().await.context("Failed to open dump transaction")?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
        .execute(&mut *tx)
        .await
        .context("Failed to set dump transaction isolation")?;

    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT table_name::text FROM information_schema.tables
         WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
         ORDER BY table_name",
    )
    .fetch_all(&mut *tx)
    .await
    .context("Failed to fetch tables")?;

    let sequences: Vec<SequenceDef> = sqlx::query(
        "SELECT sequencename::text AS name, data_type::text AS data_type,
                start_value, min_value, max_value, increment_by, cache_size, cycle
         FROM pg_sequences
         WHERE schemaname = 'public'
         ORDER BY sequencename",
    )
    .fetch_all(&mut *tx)
    .await
    .context("Failed to fetch sequences")?
    .iter()
    .map(|row| {
        Ok(SequenceDef {
            name: row.try_get("name")?,
            data_type: row.try_get("data_type")?,
            start: row.try_get("start_value")?,
            min: row.try_get("min_value")?,
            max: row.try_get("max_value")?,
            increment: row.try_get("increment_by")?,
            cache: row.try_get("cache_size")?,
            cycle: row.try_get("cycle")?,
        })
    })
    .collect::<Result<_, sqlx::Error>>()
    .context("Failed to read sequence definitions")?;

    // Serial columns: sequence -> (table, column).
    let ownership: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT s.relname::text, t.relname::text, a.attname::text
         FROM pg_class s
         JOIN pg_namespace n ON n.oid = s.relnamespace
         JOIN pg_depend d ON d.objid = s.oid
              AND d.classid = 'pg_class'::regclass
              AND d.refclassid = 'pg_class'::regclass
              AND d.deptype = 'a'
         JOIN pg_class t ON t.oid = d.refobjid
         JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = d.refobjsubid
         WHERE s.relkind = 'S' AND n.nspname = 'public'
         ORDER BY s.relname",
    )
    .fetch_all(&mut *tx)
    .await
    .context("Failed to fetch sequence ownership")?;

    let views: Vec<ViewDef> = sqlx::query_as::<_, (i64, String, String)>(
        "SELECT c.oid::int8, c.relname::text, pg_get_viewdef(c.oid)
         FROM pg_class c
         JOIN pg_namespace n ON n.oid = c.relnamespace
         WHERE n.nspname = 'public' AND c.relkind = 'v'
         ORDER BY c.relname",
    )
    .fetch_all(&mut *tx)
    .await
    .context("Failed to fetch views")?
    .into_iter()
    .map(|(oid, name, definition)| ViewDef { oid, name, definition })
    .collect();

    // (view, relation it reads from), through the view's rewrite rule.
    let view_deps: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT DISTINCT r.ev_class::int8, d.refobjid::int8
         FROM pg_rewrite r
         JOIN pg_depend d ON d.objid = r.oid
              AND d.classid = 'pg_rewrite'::regclass
              AND d.refclassid = 'pg_class'::regclass
         WHERE d.refobjid <> r.ev_class",
    )
    .fetch_all(&mut *tx)
    .await
    .context("Failed to fetch view dependencies")?;
    let views = order_views(views, &view_deps);

    writeln!(out, "-- sitesnap database dump")?;
    writeln!(out, "-- Created: {}", chrono::Utc::now().to_rfc3339())?;
    writeln!(out)?;

    for view in views.iter().rev() {
        writeln!(out, "DROP VIEW IF EXISTS {} CASCADE;", quote_ident(&view.name))?;
    }
    for table in &tables {
        writeln!(out, "DROP TABLE IF EXISTS {} CASCADE;", quote_ident(table))?;
    }
    for seq in &sequences {
        writeln!(out, "DROP SEQUENCE IF EXISTS {} CASCADE;", quote_ident(&seq.name))?;
    }

    writeln!(out, "\n-- Sequences")?;
    for seq in &sequences {
        writeln!(out, "{}", create_sequence_statement(seq))?;
    }

    writeln!(out, "\n-- Tables")?;
    let mut table_columns = Vec::with_capacity(tables.len());
    for table in &tables {
        let columns = fetch_columns(&mut *tx, table).await?;
        writeln!(out, "{}", create_table_statement(table, &columns))?;
        table_columns.push(columns);
    }

    writeln!(out, "\n-- Sequence ownership")?;
    for (seq, table, column) in &ownership {
        writeln!(
            out,
            "ALTER SEQUENCE {} OWNED BY {}.{};",
            quote_ident(seq),
            quote_ident(table),
            quote_ident(column)
        )?;
    }

    writeln!(out, "\n-- Data")?;
    let mut total_rows = 0u64;
    for (table, columns) in tables.iter().zip(&table_columns) {
        let rows = dump_table_rows(&mut *tx, &mut out, table, columns).await?;
        debug!(table = %table, rows, "Table dumped");
        total_rows += rows;
    }

    writeln!(out, "\n-- Sequence positions")?;
    for seq in sequences.iter().map(|s| &s.name) {
        let (last_value, is_called): (i64, bool) =
            sqlx::query_as(&format!("SELECT last_value, is_called FROM {}", quote_ident(seq)))
                .fetch_one(&mut *tx)
                .await
                .with_context(|| format!("Failed to read sequence {}", seq))?;
        writeln!(
            out,
            "SELECT setval({}, {}, {});",
            quote_literal(&quote_ident(seq)),
            last_value,
            is_called
        )?;
    }

    writeln!(out, "\n-- Constraints")?;
    // Foreign keys last so every referenced key exists.
    for foreign in [false, true] {
        for table in &tables {
            let defs: Vec<(String, String)> = sqlx::query_as(
                "SELECT conname::text, pg_get_constraintdef(oid) FROM pg_constraint
                 WHERE conrelid = $1::text::regclass AND contype IN ('p', 'u', 'c', 'f')
                   AND (contype = 'f') = $2
                 ORDER BY CASE contype WHEN 'p' THEN 0 WHEN 'u' THEN 1 ELSE 2 END, conname",
            )
            .bind(quote_ident(table))
            .bind(foreign)
            .fetch_all(&mut *tx)
            .await
            .with_context(|| format!("Failed to fetch constraints for {}", table))?;
            for (name, def) in defs {
                writeln!(
                    out,
                    "ALTER TABLE {} ADD CONSTRAINT {} {};",
                    quote_ident(table),
                    quote_ident(&name),
                    flatten_sql(&def)
                )?;
            }
        }
    }

    writeln!(out, "\n-- Indexes")?;
    for table in &tables {
        let defs: Vec<String> = sqlx::query_scalar(
            "SELECT indexdef FROM pg_indexes
             WHERE schemaname = 'public' AND tablename = $1
               AND indexname NOT IN (SELECT conname FROM pg_constraint WHERE conrelid = $2::text::regclass)
             ORDER BY indexname",
        )
        .bind(table)
        .bind(quote_ident(table))
        .fetch_all(&mut *tx)
        .await
        .with_context(|| format!("Failed to fetch indexes for {}", table))?;
        for def in defs {
            writeln!(out, "{};", flatten_sql(&def))?;
        }
    }

    writeln!(out, "\n-- Views")?;
    for view in &views {
        let body = flatten_sql(&view.definition);
        writeln!(
            out,
            "CREATE OR REPLACE VIEW {} AS {};",
            quote_ident(&view.name),
            body.trim().trim_end_matches(';').trim_end()
        )?;
    }

    tx.commit().await.context("Failed to close dump transaction")?;
    out.flush()
        .with_context(|| format!("Failed to write dump file: {}", dest.display()))?;

    info!(tables = tables.len(), rows = total_rows, path = %dest.display(), "Database dumped");
    Ok(DumpSummary {
        tables: tables.len(),
        rows: total_rows,
    })
}

async fn fetch_columns(conn: &mut PgConnection, table: &str) -> Result<Vec<Column>> {
    let rows = sqlx::query(
        "SELECT a.attname::text AS column_name,
                format_type(a.atttypid, a.atttypmod) AS data_type,
                a.attnotnull AS not_null,
                pg_get_expr(d.adbin, d.adrelid) AS column_default
         FROM pg_attribute a
         LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
         WHERE a.attrelid = $1::text::regclass AND a.attnum > 0 AND NOT a.attisdropped
         ORDER BY a.attnum",
    )
    .bind(quote_ident(table))
    .fetch_all(&mut *conn)
    .await
    .with_context(|| format!("Failed to fetch columns for table {}", table))?;

    rows.iter()
        .map(|row| {
            Ok(Column {
                name: row.try_get("column_name")?,
                data_type: row.try_get("data_type")?,
                not_null: row.try_get("not_null")?,
                default: row.try_get("column_default")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .with_context(|| format!("Failed to read column definitions for table {}", table))
}

fn create_table_statement(table: &str, columns: &[Column]) -> String {
    let defs: Vec<String> = columns
        .iter()
        .map(|col| {
            let mut def = format!("  {} {}", quote_ident(&col.name), col.data_type);
            if let Some(default) = &col.default {
                def.push_str(" DEFAULT ");
                def.push_str(&flatten_sql(default));
            }
            if col.not_null {
                def.push_str(" NOT NULL");
            }
            def
        })
        .collect();
    format!("CREATE TABLE {} (\n{}\n);", quote_ident(table), defs.join(",\n"))
}

fn create_sequence_statement(seq: &SequenceDef) -> String {
    format!(
        "CREATE SEQUENCE {} AS {} INCREMENT BY {} MINVALUE {} MAXVALUE {} START WITH {} CACHE {} {};",
        quote_ident(&seq.name),
        seq.data_type,
        seq.increment,
        seq.min,
        seq.max,
        seq.start,
        seq.cache,
        if seq.cycle { "CYCLE" } else { "NO CYCLE" }
    )
}

/// Orders views so each one comes after every view it selects from.
/// Independent views keep their name order.
fn order_views(views: Vec<ViewDef>, deps: &[(i64, i64)]) -> Vec<ViewDef> {
    let known: BTreeSet<i64> = views.iter().map(|v| v.oid).collect();
    let mut waiting_on: BTreeMap<i64, BTreeSet<i64>> = views
        .iter()
        .map(|v| {
            let needs = deps
                .iter()
                .filter(|(view, used)| *view == v.oid && known.contains(used))
                .map(|(_, used)| *used)
                .collect();
            (v.oid, needs)
        })
        .collect();

    let mut pending = views;
    let mut ordered = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let ready = pending
            .iter()
            .position(|v| waiting_on.get(&v.oid).is_none_or(BTreeSet::is_empty))
            .unwrap_or(0);
        let view = pending.remove(ready);
        for needs in waiting_on.values_mut() {
            needs.remove(&view.oid);
        }
        ordered.push(view);
    }
    ordered
}

async fn dump_table_rows(
    conn: &mut PgConnection,
    out: &mut impl Write,
    table: &str,
    columns: &[Column],
) -> Result<u64> {
    if columns.is_empty() {
        return Ok(0);
    }
    let select_list: Vec<String> = columns
        .iter()
        .map(|col| {
            if col.is_binary() {
                quote_ident(&col.name)
            } else {
                format!("{}::text", quote_ident(&col.name))
            }
        })
        .collect();
    let column_list: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
    let insert_prefix = format!(
        "INSERT INTO {} ({}) VALUES (",
        quote_ident(table),
        column_list.join(", ")
    );

    let mut offset = 0i64;
    let mut total = 0u64;
    loop {
        let query = format!(
            "SELECT {} FROM {} ORDER BY ctid LIMIT {} OFFSET {}",
            select_list.join(", "),
            quote_ident(table),
            BATCH_SIZE,
            offset
        );
        let rows = sqlx::query(&query)
            .fetch_all(&mut *conn)
            .await
            .with_context(|| format!("Failed to fetch rows from table {}", table))?;
        if rows.is_empty() {
            break;
        }

        for row in &rows {
            let mut values = Vec::with_capacity(columns.len());
            for (i, col) in columns.iter().enumerate() {
                let value = if col.is_binary() {
                    row.try_get::<Option<Vec<u8>>, _>(i)?
                        .map(|bytes| format!("'\\x{}'", hex::encode(bytes)))
                } else {
                    row.try_get::<Option<String>, _>(i)?.map(|s| quote_literal(&s))
                };
                values.push(value.unwrap_or_else(|| "NULL".to_string()));
            }
            writeln!(out, "{}{});", insert_prefix, values.join(", "))?;
        }

        total += rows.len() as u64;
        if (rows.len() as i64) < BATCH_SIZE {
            break;
        }
        offset += BATCH_SIZE;
    }
    Ok(total)
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// SQL string literal that always fits on one line.
pub fn quote_literal(value: &str) -> String {
    if value.contains(['\n', '\r', '\\']) {
        let escaped = value
            .replace('\\', "\\\\")
            .replace('\'', "''")
            .replace('\n', "\\n")
            .replace('\r', "\\r");
        format!("E'{}'", escaped)
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}

/// Puts a catalog definition on one line without touching what it means:
/// line breaks between tokens become spaces, and a string literal that spans
/// lines is rewritten as the equivalent `E'...'` literal. Everything else,
/// including whitespace inside literals, is kept as is.
pub fn flatten_sql(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\'' => {
                let escape_string = starts_escape_string(&out);
                let (body, closed, next) = scan_quoted(&chars, i + 1, '\'', escape_string);
                push_literal(&mut out, &body, closed, escape_string);
                i = next;
            }
            '"' => {
                let (body, closed, next) = scan_quoted(&chars, i + 1, '"', false);
                out.push('"');
                out.push_str(&body);
                if closed {
                    out.push('"');
                }
                i = next;
            }
            '\r' | '\n' => {
                out.push(' ');
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// `E'` or `e'`, but not the tail of an identifier such as `name'`.
fn starts_escape_string(before: &str) -> bool {
    let mut rev = before.chars().rev();
    matches!(rev.next(), Some('E' | 'e'))
        && !rev.next().is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '"')
}

/// Raw text up to the closing `quote` (doubled quotes stay doubled), whether
/// it was closed, and the index after it.
fn scan_quoted(chars: &[char], start: usize, quote: char, backslash_escapes: bool) -> (String, bool, usize) {
    let mut body = String::new();
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        if backslash_escapes && c == '\\' && i + 1 < chars.len() {
            body.push(c);
            body.push(chars[i + 1]);
            i += 2;
        } else if c == quote && chars.get(i + 1) == Some(&quote) {
            body.push(c);
            body.push(c);
            i += 2;
        } else if c == quote {
            return (body, true, i + 1);
        } else {
            body.push(c);
            i += 1;
        }
    }
    (body, false, i)
}

fn push_literal(out: &mut String, body: &str, closed: bool, escape_string: bool) {
    if body.contains(['\n', '\r']) {
        let body = if escape_string {
            body.to_string()
        } else {
            out.push('E');
            body.replace('\\', "\\\\")
        };
        out.push('\'');
        out.push_str(&body.replace('\n', "\\n").replace('\r', "\\r"));
    } else {
        out.push('\'');
        out.push_str(body);
    }
    if closed {
        out.push('\'');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("plain"), "'plain'");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal("a\nb"), "E'a\\nb'");
        assert_eq!(quote_literal("C:\\tmp 'x'"), "E'C:\\\\tmp ''x'''");
        assert!(!quote_literal("line1\r\nline2;\n").contains('\n'));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }

    #[test]
    fn test_create_table_ends_with_terminator_line() {
        let columns = vec![
            Column {
                name: "id".to_string(),
                data_type: "bigint".to_string(),
                not_null: true,
                default: Some("nextval('users_id_seq'::regclass)".to_string()),
            },
            Column {
                name: "avatar".to_string(),
                data_type: "bytea".to_string(),
                not_null: false,
                default: None,
            },
        ];
        let ddl = create_table_statement("users", &columns);
        let lines: Vec<&str> = ddl.lines().collect();
        assert_eq!(lines[0], "CREATE TABLE \"users\" (");
        assert_eq!(
            lines[1],
            "  \"id\" bigint DEFAULT nextval('users_id_seq'::regclass) NOT NULL,"
        );
        assert_eq!(lines.last(), Some(&");"));
        assert!(lines[..lines.len() - 1].iter().all(|l| !l.trim_end().ends_with(';')));
        assert!(columns[1].is_binary());
    }

    #[test]
    fn test_flatten_keeps_literal_whitespace() {
        assert_eq!(flatten_sql("'a  b'::text"), "'a  b'::text");
        assert_eq!(flatten_sql("CHECK ((s <> 'x  y'::text))"), "CHECK ((s <> 'x  y'::text))");
        assert_eq!(
            flatten_sql(" SELECT t.id,\n    'it''s  here'::text AS note\n   FROM t;"),
            " SELECT t.id,     'it''s  here'::text AS note    FROM t;"
        );
        assert_eq!(flatten_sql("\"odd\n name\""), "\"odd\n name\"");
    }

    #[test]
    fn test_flatten_rewrites_multiline_literals() {
        assert_eq!(flatten_sql("'a\nb;'::text"), "E'a\\nb;'::text");
        assert_eq!(flatten_sql("'C:\\tmp\n'"), "E'C:\\\\tmp\\n'");
        assert_eq!(flatten_sql("E'x\\'y'"), "E'x\\'y'");

        let statement = format!("ALTER TABLE \"t\" ADD CONSTRAINT \"c\" {};", flatten_sql("CHECK (s <> 'one\n-- two;\n\nthree')"));
        let reader = crate::restore::db_restore::StatementReader::new(std::io::Cursor::new(statement.clone()));
        let read: Vec<String> = reader.collect::<std::io::Result<_>>().unwrap();
        assert_eq!(read, vec![statement]);
    }

    #[test]
    fn test_views_follow_their_dependencies() {
        let view = |oid: i64, name: &str| ViewDef {
            oid,
            name: name.to_string(),
            definition: String::new(),
        };
        // a_top reads b_base, which reads table 1; c_free stands alone.
        let views = vec![view(30, "a_top"), view(20, "b_base"), view(40, "c_free")];
        let deps = [(30, 20), (20, 1), (40, 1)];

        let names: Vec<String> = order_views(views, &deps).into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["b_base", "a_top", "c_free"]);
    }

    #[test]
    fn test_create_sequence_keeps_options() {
        let seq = SequenceDef {
            name: "orders_no_seq".to_string(),
            data_type: "integer".to_string(),
            start: 1000,
            min: 1000,
            max: 9999,
            increment: 5,
            cache: 1,
            cycle: true,
        };
        assert_eq!(
            create_sequence_statement(&seq),
            "CREATE SEQUENCE \"orders_no_seq\" AS integer INCREMENT BY 5 MINVALUE 1000 MAXVALUE 9999 START WITH 1000 CACHE 1 CYCLE;"
        );
    }

    /// Dumps and replays a live schema. Drops and recreates everything in the
    /// `public` schema of the target, so it only runs against a scratch
    /// database named in `SITESNAP_TEST_DATABASE_URL`:
    /// `cargo test -- --ignored`.
    #[tokio::test]
    #[ignore]
    async fn test_postgres_dump_round_trip() -> Result<()> {
        let Ok(url) = std::env::var("SITESNAP_TEST_DATABASE_URL") else {
            return Ok(());
        };
        let mut conn = PgConnection::connect(&url).await?;
        for statement in [
            "DROP VIEW IF EXISTS a_top, b_base CASCADE",
            "DROP TABLE IF EXISTS t CASCADE",
            "CREATE TABLE t (
                id serial PRIMARY KEY,
                s text NOT NULL DEFAULT 'a  b' CHECK (s <> 'x  y'),
                note text,
                blob bytea
            )",
            "CREATE VIEW b_base AS SELECT id, s FROM t",
            "CREATE VIEW a_top AS SELECT id FROM b_base WHERE s <> 'q  r'",
            "INSERT INTO t (note, blob) VALUES (E'line1\\nline2;\\n-- kept\\n\\nend', '\\x00ff10')",
            "INSERT INTO t (s) VALUES ('it''s')",
        ] {
            sqlx::query(statement).execute(&mut conn).await?;
        }

        let catalog = "SELECT pg_get_expr(d.adbin, d.adrelid) FROM pg_attrdef d
                       JOIN pg_attribute a ON a.attrelid = d.adrelid AND a.attnum = d.adnum
                       WHERE d.adrelid = 't'::regclass AND a.attname = 's'";
        let check = "SELECT pg_get_constraintdef(oid) FROM pg_constraint
                     WHERE conrelid = 't'::regclass AND contype = 'c'";
        let rows = "SELECT id, s, note, blob FROM t ORDER BY id";
        let before_default: String = sqlx::query_scalar(catalog).fetch_one(&mut conn).await?;
        let before_check: String = sqlx::query_scalar(check).fetch_one(&mut conn).await?;
        let before_rows: Vec<(i32, String, Option<String>, Option<Vec<u8>>)> =
            sqlx::query_as(rows).fetch_all(&mut conn).await?;

        let dir = tempfile::TempDir::new()?;
        let dump = dir.path().join("dump.sql");
        dump_database(&mut conn, &dump).await?;

        sqlx::query("DROP VIEW a_top, b_base").execute(&mut conn).await?;
        sqlx::query("DROP TABLE t CASCADE").execute(&mut conn).await?;
        crate::restore::db_restore::replay_sql_file(&mut conn, &dump).await?;

        let after_default: String = sqlx::query_scalar(catalog).fetch_one(&mut conn).await?;
        let after_check: String = sqlx::query_scalar(check).fetch_one(&mut conn).await?;
        let after_rows: Vec<(i32, String, Option<String>, Option<Vec<u8>>)> =
            sqlx::query_as(rows).fetch_all(&mut conn).await?;
        assert_eq!(after_default, before_default);
        assert_eq!(after_check, before_check);
        assert_eq!(after_rows, before_rows);

        let top: Vec<i32> = sqlx::query_scalar("SELECT id FROM a_top ORDER BY id").fetch_all(&mut conn).await?;
        assert_eq!(top, vec![1, 2]);
        let next: i32 = sqlx::query_scalar("INSERT INTO t (s) VALUES ('new') RETURNING id")
            .fetch_one(&mut conn)
            .await?;
        assert_eq!(next, 3);
        let owner: Option<String> = sqlx::query_scalar("SELECT pg_get_serial_sequence('t', 'id')")
            .fetch_one(&mut conn)
            .await?;
        assert_eq!(owner.as_deref(), Some("public.t_id_seq"));

        sqlx::query("DROP TABLE t CASCADE").execute(&mut conn).await?;
        Ok(())
    }
}
