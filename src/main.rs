use anyhow::{Context, Result};
use query_extender::config::SchemaConfig;
use query_extender::{Expr, Outcome, ParseError, Pipeline, QueryContext, SqlCompiler};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const HELP: &str = r#"输入一个查询管道, 例如:
  Book.Where(x => x.Author == "Scott" && x.IsAvailable).OrderBy(x => x.Id).Take(5)
  Book.Where(x => ids.Contains(x.Id)).Count()
命令:
  :let <name> = <expr>   绑定一个变量, 例如 :let ids = [1, 2, 3]
  :types                 列出可查询的类型
  :help                  显示帮助
  :quit                  退出"#;

/// 优先使用JSON配置，失败时使用默认配置
fn load_config() -> SchemaConfig {
    match SchemaConfig::from_json_file("schema.json") {
        Ok(config) => {
            info!(types = config.types.len(), "loaded schema.json");
            config
        }
        Err(e) => {
            warn!(error = %e, "schema.json unavailable, using built-in schema");
            SchemaConfig::default()
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("--- Query Extender: 查询管道到 SQL 编译器 ---");

    let config = load_config();
    let schema = config.schema().context("invalid schema configuration")?;
    let mut ctx = QueryContext::new(schema, SqlCompiler::from_config(&config));

    println!("\n[配置信息]:");
    for (entity, table) in config.tables() {
        println!("  {} -> {}", entity, table);
    }
    println!("\n{}\n", HELP);

    let mut editor = DefaultEditor::new().context("failed to start line editor")?;
    loop {
        match editor.readline("query> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                editor.add_history_entry(line)?;

                match line {
                    ":quit" | ":q" | "exit" => break,
                    ":help" => println!("{}", HELP),
                    ":types" => {
                        for def in ctx.schema().types() {
                            println!("  {} ({} properties)", def.effective_name(), def.properties.len());
                        }
                    }
                    _ if line.starts_with(":let ") => {
                        if let Err(e) = bind(&mut ctx, &line[5..]) {
                            println!("✗ {:#}", e);
                        }
                    }
                    _ => {
                        if let Err(e) = evaluate(&mut ctx, line) {
                            println!("✗ {:#}", e);
                        }
                    }
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// `:let name = expr`
fn bind(ctx: &mut QueryContext<SqlCompiler>, input: &str) -> Result<()> {
    let (name, expr) = input
        .split_once('=')
        .context("expected `:let <name> = <expr>`")?;
    let expr: Expr = expr.trim().parse().map_err(|e: ParseError| describe(e, expr.trim()))?;
    let value = ctx.environment().evaluate(&expr, None)?;
    println!("✓ {} = {}", name.trim(), value);
    ctx.environment_mut().bind(name.trim(), value);
    Ok(())
}

fn evaluate(ctx: &mut QueryContext<SqlCompiler>, input: &str) -> Result<()> {
    let pipeline: Pipeline = input.parse().map_err(|e: ParseError| describe(e, input))?;
    let outcome = ctx.run(&pipeline)?;

    if let Some(bucket) = ctx.bucket(&pipeline.source) {
        if !bucket.tree().is_empty() {
            println!("\n[条件树]:\n{}", bucket.tree());
        }
    }
    if let Some(ast) = ctx.ast(&pipeline.source) {
        println!("\n[AST]:\n{:#?}", ast);
    }

    match outcome {
        Outcome::Items(statements) => {
            println!("\n[生成的 SQL]:");
            for sql in statements {
                println!("{}", sql);
            }
        }
        Outcome::Item(Some(sql)) => println!("\n[生成的 SQL]:\n{}", sql),
        Outcome::Item(None) => println!("\n(no result)"),
        Outcome::Count(n) => println!("\ncount = {}", n),
        Outcome::Any(any) => println!("\nany = {}", any),
    }
    println!();
    Ok(())
}

/// 把解析错误位置标记在输入下方
fn describe(error: ParseError, input: &str) -> anyhow::Error {
    match error.span {
        Some(span) => {
            let marker = format!("{}{}", " ".repeat(span.start), "^".repeat((span.end - span.start).max(1)));
            anyhow::anyhow!("{}\n  {}\n  {}", error.message, input, marker)
        }
        None => anyhow::Error::new(error),
    }
}
