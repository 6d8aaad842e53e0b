//! Template compilation and rendering.
//!
//! The generator only depends on [`TemplateEngine`]; [`MiniJinjaEngine`] is
//! the implementation used by the daemon. Templates see three helpers:
//!
//! * `containers(query)`: records from the snapshot store. `query` is a
//!   URL-encoded query string (see [`crate::store::filter`]) or a
//!   document-style map; omitted means all containers.
//! * `inspect(id)`: the daemon's raw inspect document for a container.
//! * `json`: pretty-printed JSON of a value, as a filter or a function.
//!
//! Rendering is synchronous, so it must run on a blocking thread
//! (`spawn_blocking`); the helpers bridge back to async code through the
//! runtime handle captured in [`RenderContext`].

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use minijinja::value::Value;
use minijinja::{context, AutoEscape, Environment, ErrorKind};
use tokio::runtime::Handle;

use crate::error::{Error, Result};
use crate::store::Filter;
use crate::types::ContainerRecord;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("compile error: {0}")]
    Compile(String),

    #[error("render error: {0}")]
    Render(String),
}

/// Queries a template may run while rendering.
#[async_trait]
pub trait TemplateQueries: Send + Sync {
    async fn containers(&self, filter: Filter) -> Result<Vec<ContainerRecord>>;

    async fn inspect(&self, id: &str) -> Result<serde_json::Value>;
}

/// Per-render context. Failures inside helpers that do not abort the render
/// (a malformed query string, for instance) are collected and reported by
/// the generator afterwards.
pub struct RenderContext {
    queries: Arc<dyn TemplateQueries>,
    handle: Handle,
    errors: Mutex<Vec<Error>>,
}

impl RenderContext {
    pub fn new(queries: Arc<dyn TemplateQueries>, handle: Handle) -> Self {
        Self {
            queries,
            handle,
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Runs a container query. A malformed query is reported and treated as
    /// an empty filter.
    pub fn containers_by_query(&self, query: &str) -> Result<Vec<ContainerRecord>> {
        let filter = Filter::from_query(query).unwrap_or_else(|e| {
            self.report(Error::Parse(format!("query '{}': {}", query, e)));
            Filter::all()
        });
        self.containers(filter)
    }

    pub fn containers(&self, filter: Filter) -> Result<Vec<ContainerRecord>> {
        self.handle.block_on(self.queries.containers(filter))
    }

    pub fn inspect(&self, id: &str) -> Result<serde_json::Value> {
        self.handle.block_on(self.queries.inspect(id))
    }

    pub fn report(&self, error: Error) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error);
    }

    pub fn take_errors(&self) -> Vec<Error> {
        std::mem::take(&mut *self.errors.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

pub trait TemplateEngine: Send + Sync + 'static {
    type Compiled: Clone + Send + Sync + 'static;

    fn compile(&self, name: &str, source: &str) -> Result<Self::Compiled, TemplateError>;

    fn render(
        &self,
        compiled: &Self::Compiled,
        context: Arc<RenderContext>,
    ) -> Result<String, TemplateError>;
}

#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    name: String,
    env: Arc<Environment<'static>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MiniJinjaEngine;

impl TemplateEngine for MiniJinjaEngine {
    type Compiled = CompiledTemplate;

    fn compile(&self, name: &str, source: &str) -> Result<CompiledTemplate, TemplateError> {
        let mut env = Environment::new();
        // Generated files are configs, never HTML.
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.set_keep_trailing_newline(true);
        env.add_filter("json", to_json);
        env.add_function("json", to_json);
        env.add_template_owned(name.to_string(), source.to_string())
            .map_err(|e| TemplateError::Compile(e.to_string()))?;

        Ok(CompiledTemplate {
            name: name.to_string(),
            env: Arc::new(env),
        })
    }

    fn render(
        &self,
        compiled: &CompiledTemplate,
        context: Arc<RenderContext>,
    ) -> Result<String, TemplateError> {
        let tmpl = compiled
            .env
            .get_template(&compiled.name)
            .map_err(|e| TemplateError::Compile(e.to_string()))?;

        let ctx = Arc::clone(&context);
        let containers = Value::from_function(move |query: Option<Value>| {
            let records = match query {
                Some(q) if q.as_str().is_some() => {
                    ctx.containers_by_query(q.as_str().unwrap_or_default())
                }
                Some(q) if !q.is_undefined() && !q.is_none() => {
                    let doc = serde_json::to_value(&q).map_err(invalid_op)?;
                    let filter = Filter::from_json(&doc).map_err(invalid_op)?;
                    ctx.containers(filter)
                }
                _ => ctx.containers(Filter::all()),
            };
            records
                .map(|r| Value::from_serialize(&r))
                .map_err(invalid_op)
        });

        let ctx = Arc::clone(&context);
        let inspect = Value::from_function(move |id: String| {
            ctx.inspect(&id)
                .map(|doc| Value::from_serialize(&doc))
                .map_err(invalid_op)
        });

        tmpl.render(context! { containers => containers, inspect => inspect })
            .map_err(|e| TemplateError::Render(format!("{:#}", e)))
    }
}

fn to_json(value: Value) -> Result<String, minijinja::Error> {
    serde_json::to_string_pretty(&value).map_err(invalid_op)
}

fn invalid_op(err: impl std::fmt::Display) -> minijinja::Error {
    minijinja::Error::new(ErrorKind::InvalidOperation, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{parse_env, NetworkInfo};
    use serde_json::json;

    struct FixedQueries(Vec<ContainerRecord>);

    #[async_trait]
    impl TemplateQueries for FixedQueries {
        async fn containers(&self, filter: Filter) -> Result<Vec<ContainerRecord>> {
            Ok(self
                .0
                .iter()
                .filter(|r| filter.matches(&serde_json::to_value(r).unwrap()))
                .cloned()
                .collect())
        }

        async fn inspect(&self, id: &str) -> Result<serde_json::Value> {
            Ok(json!({ "Id": id, "State": { "Running": true } }))
        }
    }

    fn records() -> Vec<ContainerRecord> {
        vec![
            ContainerRecord::new(
                "a".repeat(64),
                "/api",
                Some(NetworkInfo {
                    address: "10.0.0.2".into(),
                    ports: vec!["8080".into()],
                }),
                parse_env(&["VIRTUAL_HOST=api.example.org"]),
            ),
            ContainerRecord::new("b".repeat(64), "/db", None, parse_env(&["PGDATA=/data"])),
        ]
    }

    async fn render(source: &'static str) -> (Result<String, TemplateError>, Vec<Error>) {
        let context = Arc::new(RenderContext::new(
            Arc::new(FixedQueries(records())),
            Handle::current(),
        ));
        let engine = MiniJinjaEngine;
        let compiled = engine.compile("test.tmpl", source).unwrap();
        let ctx = Arc::clone(&context);
        let out = tokio::task::spawn_blocking(move || engine.render(&compiled, ctx))
            .await
            .unwrap();
        (out, context.take_errors())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn renders_containers_query() {
        let (out, errors) = render(
            "{% for c in containers('env.VIRTUAL_HOST') %}\
             server {{ c.env.VIRTUAL_HOST }} {{ c.network.address }}:{{ c.network.ports[0] }};\
             {% endfor %}",
        )
        .await;
        assert_eq!(out.unwrap(), "server api.example.org 10.0.0.2:8080;");
        assert!(errors.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn accepts_document_filters_and_json_helper() {
        let (out, _) = render(
            "{% for c in containers({'name': '/db'}) %}{{ c.env | json }}{% endfor %}",
        )
        .await;
        assert_eq!(out.unwrap(), "{\n  \"PGDATA\": \"/data\"\n}");

        let (out, _) = render("{{ json(inspect('abc').State) }}").await;
        assert_eq!(out.unwrap(), "{\n  \"Running\": true\n}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_query_is_reported_and_matches_all() {
        let (out, errors) = render("{{ containers('name[$bogus]=1') | length }}").await;
        assert_eq!(out.unwrap(), "2");
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], Error::Parse(_)));
    }

    #[test]
    fn compile_errors_surface() {
        let err = MiniJinjaEngine.compile("bad.tmpl", "{% for %}").unwrap_err();
        assert!(matches!(err, TemplateError::Compile(_)));
    }
}
