//! Built-in node processors
//!
//! - `dataInput`: emits `config.data`
//! - `dataOutput`: collects upstream inputs, optionally narrowed by a JSONPath `select`
//! - `luaScript`: sandboxed Lua over the node's inputs
//! - `httpRequest`: outbound HTTP call

use crate::runtime::plan::ExecutionContext;
use crate::runtime::processor::{NodeProcessor, ProcessorRegistry, RunView};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use mlua::LuaSerdeExt;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};

impl ProcessorRegistry {
    /// Registry with every built-in processor and the pass-through fallback
    pub fn with_builtins() -> Self {
        ProcessorRegistry::new()
            .with("dataInput", DataInputProcessor)
            .with("dataOutput", DataOutputProcessor)
            .with("luaScript", LuaScriptProcessor)
            .with("httpRequest", HttpRequestProcessor::default())
    }
}

/// Collapse inputs into one value: a lone input as-is, several as an object
fn merged_inputs(inputs: &BTreeMap<String, Value>) -> Value {
    if inputs.len() == 1 {
        return inputs.values().next().cloned().unwrap_or(Value::Null);
    }
    Value::Object(
        inputs
            .iter()
            .map(|(id, value)| (id.clone(), value.clone()))
            .collect::<Map<String, Value>>(),
    )
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DataInputProcessor;

#[async_trait]
impl NodeProcessor for DataInputProcessor {
    async fn process(&self, ctx: &ExecutionContext, _run: &RunView) -> Result<Value> {
        tracing::debug!("📥 Emitting input data for '{}'", ctx.node_id);
        Ok(ctx.config.get("data").cloned().unwrap_or(Value::Null))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DataOutputProcessor;

#[async_trait]
impl NodeProcessor for DataOutputProcessor {
    async fn process(&self, ctx: &ExecutionContext, _run: &RunView) -> Result<Value> {
        let collected = merged_inputs(&ctx.inputs);
        let Some(selector) = ctx.config.get("select").and_then(Value::as_str) else {
            return Ok(collected);
        };

        tracing::debug!("🔎 Selecting '{}' from output of '{}'", selector, ctx.node_id);
        let mut selected = jsonpath_lib::select(&collected, selector)
            .map_err(|e| anyhow!("Invalid JSONPath '{}' on node '{}': {:?}", selector, ctx.node_id, e))?;
        Ok(match selected.len() {
            0 => Value::Null,
            1 => selected.remove(0).clone(),
            _ => Value::Array(selected.into_iter().cloned().collect()),
        })
    }
}

/// Runs `config.script` in a fresh, sandboxed Lua state
///
/// Globals: `inputs` (upstream outputs keyed by node id), `data` (the same
/// outputs as an array), `config`, and the helpers `date(fmt)`, `time()` and
/// `now()`. `os`, `io`, `debug`, `package`, `require`, `dofile` and
/// `loadfile` are removed.
#[derive(Debug, Default, Clone, Copy)]
pub struct LuaScriptProcessor;

#[async_trait]
impl NodeProcessor for LuaScriptProcessor {
    async fn process(&self, ctx: &ExecutionContext, _run: &RunView) -> Result<Value> {
        let script = ctx
            .config
            .get("script")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("luaScript node '{}' is missing the 'script' parameter", ctx.node_id))?
            .to_string();
        let inputs = ctx.inputs.clone();
        let config = ctx.config.clone();
        let node_id = ctx.node_id.clone();

        tracing::debug!("📝 Lua script for '{}': {}", node_id, script);
        tokio::task::spawn_blocking(move || run_lua(&script, &inputs, &config))
            .await
            .map_err(|e| anyhow!("Lua worker for '{}' stopped: {}", node_id, e))?
    }
}

fn run_lua(script: &str, inputs: &BTreeMap<String, Value>, config: &Value) -> Result<Value> {
    let lua = mlua::Lua::new();
    let globals = lua.globals();

    for name in ["os", "io", "debug", "package", "require", "dofile", "loadfile"] {
        globals
            .set(name, mlua::Nil)
            .map_err(|e| anyhow!("Failed to sandbox Lua global '{}': {}", name, e))?;
    }

    let date = lua
        .create_function(|_, format: String| Ok(chrono::Utc::now().format(&format).to_string()))
        .map_err(|e| anyhow!("Failed to create date function: {}", e))?;
    let time = lua
        .create_function(|_, ()| Ok(chrono::Utc::now().timestamp()))
        .map_err(|e| anyhow!("Failed to create time function: {}", e))?;
    let now = lua
        .create_function(|_, ()| Ok(chrono::Utc::now().to_rfc3339()))
        .map_err(|e| anyhow!("Failed to create now function: {}", e))?;

    let inputs_object: Map<String, Value> = inputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let data: Vec<Value> = inputs.values().cloned().collect();
    let bindings = [
        ("inputs", lua.to_value(&Value::Object(inputs_object))),
        ("data", lua.to_value(&Value::Array(data))),
        ("config", lua.to_value(config)),
    ];
    for (name, value) in bindings {
        let value = value.map_err(|e| anyhow!("Failed to convert '{}' for Lua: {}", name, e))?;
        globals
            .set(name, value)
            .map_err(|e| anyhow!("Failed to set Lua global '{}': {}", name, e))?;
    }
    for (name, function) in [("date", date), ("time", time), ("now", now)] {
        globals
            .set(name, function)
            .map_err(|e| anyhow!("Failed to set Lua function '{}': {}", name, e))?;
    }

    let result: mlua::Value = lua
        .load(script)
        .eval()
        .map_err(|e| anyhow!("Lua script execution failed: {}", e))?;
    lua_to_json(result)
}

/// Convert a Lua value to JSON; sequence tables become arrays
fn lua_to_json(value: mlua::Value) -> Result<Value> {
    match value {
        mlua::Value::Nil => Ok(Value::Null),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(i) => Ok(json!(i)),
        mlua::Value::Number(f) => Ok(serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)),
        mlua::Value::String(s) => {
            let text = s.to_str().map_err(|e| anyhow!("Invalid UTF-8 in Lua string: {}", e))?;
            Ok(Value::String(text.to_string()))
        }
        mlua::Value::Table(table) => {
            let mut count = 0usize;
            let mut max_index = 0usize;
            let mut sequence = true;
            for pair in table.pairs::<mlua::Value, mlua::Value>() {
                let (key, _) = pair.map_err(|e| anyhow!("Failed to iterate Lua table: {}", e))?;
                count += 1;
                match key {
                    mlua::Value::Integer(i) if i > 0 => max_index = max_index.max(i as usize),
                    _ => sequence = false,
                }
            }

            if sequence && count > 0 && count == max_index {
                let mut items = Vec::with_capacity(count);
                for i in 1..=max_index {
                    let item: mlua::Value = table
                        .get(i)
                        .map_err(|e| anyhow!("Failed to read Lua table value: {}", e))?;
                    items.push(lua_to_json(item)?);
                }
                return Ok(Value::Array(items));
            }

            let mut object = Map::new();
            for pair in table.pairs::<mlua::Value, mlua::Value>() {
                let (key, item) = pair.map_err(|e| anyhow!("Failed to iterate Lua table: {}", e))?;
                let key = match key {
                    mlua::Value::String(s) => s
                        .to_str()
                        .map_err(|e| anyhow!("Invalid UTF-8 in Lua key: {}", e))?
                        .to_string(),
                    mlua::Value::Integer(i) => i.to_string(),
                    mlua::Value::Number(f) => f.to_string(),
                    _ => continue,
                };
                object.insert(key, lua_to_json(item)?);
            }
            Ok(Value::Object(object))
        }
        _ => Ok(Value::Null),
    }
}

/// Outbound HTTP call
///
/// Params: `url` (required), `method` (default GET), `headers` object and
/// `body`. Without `body`, write methods send the node's merged inputs.
/// Non-2xx responses fail the attempt so the retry policy applies.
#[derive(Debug, Clone, Default)]
pub struct HttpRequestProcessor {
    client: reqwest::Client,
}

#[async_trait]
impl NodeProcessor for HttpRequestProcessor {
    async fn process(&self, ctx: &ExecutionContext, _run: &RunView) -> Result<Value> {
        let url = ctx
            .config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("httpRequest node '{}' is missing the 'url' parameter", ctx.node_id))?;
        let method = ctx
            .config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();

        let mut request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "DELETE" => self.client.delete(url),
            "PATCH" => self.client.patch(url),
            other => return Err(anyhow!("Unsupported HTTP method '{}' on node '{}'", other, ctx.node_id)),
        };

        if let Some(headers) = ctx.config.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }

        let body = match ctx.config.get("body") {
            Some(body) => Some(body.clone()),
            None if matches!(method.as_str(), "POST" | "PUT" | "PATCH") && !ctx.inputs.is_empty() => {
                Some(merged_inputs(&ctx.inputs))
            }
            None => None,
        };
        match body {
            Some(Value::String(text)) => request = request.header("Content-Type", "text/plain").body(text),
            Some(payload) => request = request.json(&payload),
            None => {}
        }

        tracing::debug!("🌍 HTTP {} {} for '{}'", method, url, ctx.node_id);
        let response = request
            .send()
            .await
            .map_err(|e| anyhow!("HTTP request failed: {}", e))?;

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| anyhow!("Failed to read response body: {}", e))?;
        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        if !status.is_success() {
            return Err(anyhow!("{} {} returned status {}", method, url, status));
        }

        tracing::info!("✅ HTTP request completed: {} {} (status: {})", method, url, status);
        Ok(json!({
            "status": status.as_u16(),
            "headers": headers,
            "data": data,
            "success": true
        }))
    }
}
