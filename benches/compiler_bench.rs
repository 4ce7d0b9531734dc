use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use query_extender::compiler::render;
use query_extender::config::SchemaConfig;
use query_extender::lexer::Lexer;
use query_extender::parser::Parser;
use query_extender::{Environment, Lambda, Pipeline, QueryContext, SqlCompiler};
use std::hint::black_box;

const PREDICATES: [(&str, &str); 3] = [
    ("simple", r#"x => x.Author == "Scott""#),
    ("medium", r#"x => (x.Id == 1 && x.Author == "Charlie") || x.Id == 10"#),
    (
        "complex",
        r#"x => (x.Author == "Scott" || x.Author == "Tom") && x.IsAvailable && ids.Contains(x.Id) && x.Shelf.Geo.Lat > 59.5"#,
    ),
];

const PIPELINE: &str =
    r#"Book.Where(x => x.Author == "Scott").Where(x => x.Id > 2 || !x.IsAvailable).OrderBy(x => x.Title).ThenByDescending(x => x.Id).Skip(10).Take(5)"#;

fn context() -> QueryContext<SqlCompiler> {
    let config = SchemaConfig::default();
    let schema = config.schema().expect("默认 schema 应该有效");
    QueryContext::new(schema, SqlCompiler::from_config(&config))
        .with_environment(Environment::new().with_variable("ids", vec![1, 2, 3, 5, 8, 13]))
}

// 基准测试：词法分析性能
fn benchmark_lexer(c: &mut Criterion) {
    let mut group = c.benchmark_group("lexer_performance");
    for (name, input) in PREDICATES {
        group.bench_with_input(BenchmarkId::new("tokenize", name), &input, |b, &input| {
            b.iter(|| {
                let tokens: Vec<_> = Lexer::new(black_box(input)).collect();
                black_box(tokens)
            })
        });
    }
    group.finish();
}

// 基准测试：语法分析性能
fn benchmark_parser(c: &mut Criterion) {
    let mut group = c.benchmark_group("parser_performance");
    for (name, input) in PREDICATES {
        // 预先词法分析
        let tokens: Vec<_> = Lexer::new(input).collect();
        group.bench_with_input(BenchmarkId::new("parse", name), &tokens, |b, tokens| {
            b.iter(|| {
                let mut parser = Parser::new(black_box(tokens));
                black_box(parser.parse_lambda().expect("解析应该成功"))
            })
        });
    }
    group.finish();
}

// 基准测试：条件树构建与 AST 渲染
fn benchmark_condition_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("condition_tree_performance");
    for (name, input) in PREDICATES {
        let lambda: Lambda = input.parse().expect("解析应该成功");
        group.bench_with_input(BenchmarkId::new("filter", name), &lambda, |b, lambda| {
            let mut ctx = context();
            b.iter(|| {
                let query = ctx.from("Book").expect("Book 已声明");
                let query = query.filter(black_box(lambda)).expect("编译应该成功");
                black_box(query.bucket().map(render))
            })
        });
    }
    group.finish();
}

// 基准测试：完整的端到端处理
fn benchmark_end_to_end(c: &mut Criterion) {
    let mut group = c.benchmark_group("end_to_end_performance");
    group.bench_function("pipeline_to_sql", |b| {
        let mut ctx = context();
        b.iter(|| {
            let pipeline: Pipeline = black_box(PIPELINE).parse().expect("解析应该成功");
            black_box(ctx.run(&pipeline).expect("编译应该成功"))
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_lexer,
    benchmark_parser,
    benchmark_condition_tree,
    benchmark_end_to_end
);
criterion_main!(benches);
