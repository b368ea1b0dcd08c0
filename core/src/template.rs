//! Template Engine (C3): renders Jinja-style templates against a per-call
//! JSON context to materialize mock configuration.
//!
//! Grounded on `templates.py` (`AccessibleVariable`, `AnyPathFSLoader`,
//! `get_file_content`, `get_relative_path`, `run_shell_script`,
//! `create_base_environment`), reimplemented on top of `minijinja` since no
//! corpus Rust repo carries its own template engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use minijinja::value::{Object, Value};
use minijinja::{Environment, State};

use crate::error::{MockServerError, Result};

const CALL_STATE_KEY: &str = "__call_state__";

/// Per-method-processor state slot shared across every call to one method,
/// distinct from the per-call `ResponseMock` data (§5). Wraps the same
/// `Arc<Mutex<Value>>` the caller holds, so mutations made by `set_state`
/// during render are visible after `render()` returns.
#[derive(Debug)]
struct CallState(Arc<Mutex<Value>>);

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0.lock().unwrap())
    }
}

impl Object for CallState {}

/// Holds one method's persistent state slot, handed to the template engine
/// on every render for that method.
#[derive(Clone)]
pub struct MethodState {
    inner: Arc<Mutex<serde_json::Value>>,
}

impl Default for MethodState {
    fn default() -> Self {
        // Falsy in Jinja/minijinja, so the documented `get_state() or 0` idiom
        // evaluates to `0` on a method's first call.
        MethodState {
            inner: Arc::new(Mutex::new(serde_json::Value::Null)),
        }
    }
}

impl MethodState {
    pub fn get(&self) -> serde_json::Value {
        self.inner.lock().unwrap().clone()
    }

    pub fn set(&self, value: serde_json::Value) {
        *self.inner.lock().unwrap() = value;
    }
}

/// Decodes raw file bytes per `encoding` (case-insensitive; defaults to
/// UTF-8). Unknown encoding names are rejected rather than silently
/// falling back.
fn decode_bytes(bytes: Vec<u8>, encoding: Option<&str>) -> std::io::Result<String> {
    match encoding.map(str::to_ascii_lowercase).as_deref() {
        None | Some("utf-8") | Some("utf8") => String::from_utf8(bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        Some("latin-1") | Some("latin1") | Some("iso-8859-1") => {
            Ok(bytes.into_iter().map(|b| b as char).collect())
        }
        Some(other) => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsupported encoding '{other}'"),
        )),
    }
}

fn read_file_to_string(path: &Path, encoding: Option<&str>) -> std::io::Result<String> {
    decode_bytes(std::fs::read(path)?, encoding)
}

fn relative_abs_path(base_dir: &Path, file_path: &str) -> PathBuf {
    let p = Path::new(file_path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

struct EngineState {
    base_dir: PathBuf,
    file_cache: Mutex<HashMap<(PathBuf, String), String>>,
}

/// One template engine per server, rooted at the server's proto base
/// directory (used to resolve relative paths passed to `insert`/`relative`).
pub struct TemplateEngine {
    env: Environment<'static>,
    state: Arc<EngineState>,
}

impl TemplateEngine {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let state = Arc::new(EngineState {
            base_dir: base_dir.into(),
            file_cache: Mutex::new(HashMap::new()),
        });

        let mut env = Environment::new();

        {
            let state = state.clone();
            env.add_function(
                "insert",
                move |path: String, encoding: Option<String>, use_cache: Option<bool>| {
                    insert_file(&state, &path, encoding.as_deref(), use_cache.unwrap_or(true))
                },
            );
        }
        {
            let state = state.clone();
            env.add_function("relative", move |file_name: String| {
                relative_abs_path(&state.base_dir, &file_name)
                    .to_string_lossy()
                    .to_string()
            });
        }
        env.add_function("shell", shell);
        env.add_function("set_state", set_state);
        env.add_function("get_state", get_state);

        TemplateEngine { env, state }
    }

    /// Render `template_src` against `context`, scoped to `method_state`'s
    /// persistent slot. Blocking (file IO, subprocess); callers should run
    /// this inside `tokio::task::spawn_blocking`.
    pub fn render(
        &self,
        template_src: &str,
        context: &serde_json::Value,
        method_state: &MethodState,
    ) -> Result<String> {
        let template = self
            .env
            .template_from_str(template_src)
            .map_err(|e| MockServerError::Other(Box::new(e)))?;

        let shared_state = Arc::new(Mutex::new(json_to_minijinja(&method_state.get())));

        let mut map: HashMap<String, Value> = context
            .as_object()
            .map(|obj| {
                obj.iter()
                    .map(|(k, v)| (k.clone(), json_to_minijinja(v)))
                    .collect()
            })
            .unwrap_or_default();
        map.insert(
            CALL_STATE_KEY.to_string(),
            Value::from_object(CallState(shared_state.clone())),
        );

        let rendered = template
            .render(map)
            .map_err(|e| MockServerError::Other(Box::new(e)))?;

        let final_state = shared_state.lock().unwrap().clone();
        if let Ok(json_state) = serde_json::to_value(&final_state) {
            method_state.set(json_state);
        }

        Ok(rendered)
    }

    /// Recursively renders every string found in `value` (object values,
    /// array items, or a bare string), leaving other scalars untouched.
    /// Mirrors `render_dict`/`render_list`.
    pub fn render_json(
        &self,
        value: &serde_json::Value,
        context: &serde_json::Value,
        method_state: &MethodState,
    ) -> Result<serde_json::Value> {
        match value {
            serde_json::Value::String(s) => {
                Ok(serde_json::Value::String(self.render(s, context, method_state)?))
            }
            serde_json::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.render_json(item, context, method_state)?);
                }
                Ok(serde_json::Value::Array(out))
            }
            serde_json::Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.render_json(v, context, method_state)?);
                }
                Ok(serde_json::Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Renders a bare scalar template string and parses the result back to
    /// the same JSON type family (e.g. a rendered `"{{ count }}"` becomes a
    /// number if it parses as one). Mirrors `render_simple_type`.
    pub fn render_scalar_str(
        &self,
        template_src: &str,
        context: &serde_json::Value,
        method_state: &MethodState,
    ) -> Result<String> {
        self.render(template_src, context, method_state)
    }

    /// Renders a template string, then parses the rendered text as YAML.
    /// Mirrors `render_model_from_str`.
    pub fn render_yaml_str(
        &self,
        template_src: &str,
        context: &serde_json::Value,
        method_state: &MethodState,
    ) -> Result<serde_json::Value> {
        let rendered = self.render(template_src, context, method_state)?;
        serde_yaml::from_str(&rendered)
            .map_err(|e| MockServerError::Other(Box::new(e)))
    }
}

fn insert_file(
    state: &Arc<EngineState>,
    path: &str,
    encoding: Option<&str>,
    use_cache: bool,
) -> Option<String> {
    let file_path = relative_abs_path(&state.base_dir, path);
    let encoding_key = encoding.unwrap_or("utf-8").to_ascii_lowercase();
    if use_cache {
        let cache_key = (file_path.clone(), encoding_key);
        let mut cache = state.file_cache.lock().unwrap();
        if let Some(existing) = cache.get(&cache_key) {
            return Some(existing.clone());
        }
        match read_file_to_string(&file_path, encoding) {
            Ok(content) => {
                cache.insert(cache_key, content.clone());
                Some(content)
            }
            Err(_) => None,
        }
    } else {
        read_file_to_string(&file_path, encoding).ok()
    }
}

fn shell(program: String, args: Vec<String>, stdin: Option<String>) -> Value {
    use std::io::Write;

    let mut command = Command::new(&program);
    command.args(&args);
    command.stdin(std::process::Stdio::piped());
    command.stdout(std::process::Stdio::piped());
    command.stderr(std::process::Stdio::piped());

    let result = (|| -> std::io::Result<(i32, String, String)> {
        let mut child = command.spawn()?;
        if let Some(input) = &stdin {
            child
                .stdin
                .as_mut()
                .expect("stdin piped")
                .write_all(input.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ))
    })();

    match result {
        Ok((code, stdout, stderr)) => {
            let mut map = std::collections::BTreeMap::new();
            map.insert("code".to_string(), Value::from(code));
            map.insert("stdout".to_string(), Value::from(stdout));
            map.insert("stderr".to_string(), Value::from(stderr));
            Value::from(map)
        }
        Err(_) => Value::from(()),
    }
}

fn set_state(state: &State, value: Value) -> Value {
    if let Some(call_state) = state
        .lookup(CALL_STATE_KEY)
        .and_then(|v| v.downcast_object::<CallState>())
    {
        *call_state.0.lock().unwrap() = value;
    }
    Value::from(())
}

fn get_state(state: &State) -> Value {
    state
        .lookup(CALL_STATE_KEY)
        .and_then(|v| v.downcast_object::<CallState>())
        .map(|call_state| call_state.0.lock().unwrap().clone())
        .unwrap_or(Value::from(()))
}

fn json_to_minijinja(value: &serde_json::Value) -> Value {
    minijinja::Value::from_serialize(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_simple_expression_with_state() {
        let engine = TemplateEngine::new(".");
        let method_state = MethodState::default();
        let ctx = serde_json::json!({"name": "book"});
        let out = engine
            .render("hello {{ name }}", &ctx, &method_state)
            .unwrap();
        assert_eq!(out, "hello book");
    }

    #[test]
    fn set_and_get_state_round_trip() {
        let engine = TemplateEngine::new(".");
        let method_state = MethodState::default();
        let ctx = serde_json::json!({});
        engine
            .render("{{ set_state(42) }}", &ctx, &method_state)
            .unwrap();
        assert_eq!(method_state.get(), serde_json::json!(42));

        let out = engine
            .render("{{ get_state() }}", &ctx, &method_state)
            .unwrap();
        assert_eq!(out, "42");
    }
}
