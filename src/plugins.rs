//! Built-in plugin types available to every graph.
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::NodeError;
use crate::logger::LogLevel;
use crate::message::is_empty_payload;
use crate::node::{Plugin, PluginRegistry, RunContext};

pub fn register_builtins(registry: &mut PluginRegistry) {
    registry.register("static", || Box::new(StaticPlugin::default()));
    registry.register("passthrough", || Box::new(PassthroughPlugin));
    registry.register("split", || Box::new(SplitPlugin::default()));
    registry.register("log", || Box::new(LogPlugin::default()));
    registry.register("guard", || Box::new(GuardPlugin::default()));
}

fn config_or_default<T>(config: &Value) -> anyhow::Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if config.is_null() {
        Ok(T::default())
    } else {
        Ok(serde_json::from_value(config.clone())?)
    }
}

/// Source that emits a fixed value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StaticPlugin {
    pub value: Value,
}

#[async_trait]
impl Plugin for StaticPlugin {
    fn init(&mut self, config: &Value) -> anyhow::Result<()> {
        *self = config_or_default(config)?;
        if is_empty_payload(&self.value) {
            anyhow::bail!("`value` is required and must not be empty");
        }
        Ok(())
    }

    async fn run(&self, ctx: &mut RunContext<'_>) -> Result<(), NodeError> {
        ctx.emit(self.value.clone()).await?;
        Ok(())
    }
}

/// Forwards its input. As a start node it forwards the invocation request.
#[derive(Debug, Clone, Default)]
pub struct PassthroughPlugin;

#[async_trait]
impl Plugin for PassthroughPlugin {
    fn init(&mut self, _config: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, ctx: &mut RunContext<'_>) -> Result<(), NodeError> {
        let data = if ctx.message().has_payload() {
            ctx.data().clone()
        } else {
            ctx.request().clone()
        };
        ctx.emit(data).await?;
        Ok(())
    }
}

/// Fans an array out one element per message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SplitPlugin {
    /// JSON pointer to the array inside the payload; the payload itself when absent.
    #[serde(default)]
    pub pointer: Option<String>,
}

#[async_trait]
impl Plugin for SplitPlugin {
    fn init(&mut self, config: &Value) -> anyhow::Result<()> {
        *self = config_or_default(config)?;
        if let Some(pointer) = &self.pointer {
            if !pointer.is_empty() && !pointer.starts_with('/') {
                anyhow::bail!("`pointer` must be empty or start with `/`");
            }
        }
        Ok(())
    }

    async fn run(&self, ctx: &mut RunContext<'_>) -> Result<(), NodeError> {
        let target = match &self.pointer {
            Some(pointer) => ctx.data().pointer(pointer),
            None => Some(ctx.data()),
        };
        let rows = match target {
            Some(Value::Array(rows)) => rows.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(NodeError::run(format!(
                    "split expects an array, got {}",
                    type_name(other)
                )));
            }
        };
        if rows.is_empty() {
            warn!(node = %ctx.node().key(), "nothing to split");
            return Ok(());
        }
        ctx.emit_each(rows).await?;
        Ok(())
    }
}

/// Logs what reaches it, then forwards it or, with no outputs, keeps it as
/// the final payload. As a start node it logs the invocation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LogPlugin {
    #[serde(default)]
    pub level: LogLevel,
}

#[async_trait]
impl Plugin for LogPlugin {
    fn init(&mut self, config: &Value) -> anyhow::Result<()> {
        *self = config_or_default(config)?;
        Ok(())
    }

    async fn run(&self, ctx: &mut RunContext<'_>) -> Result<(), NodeError> {
        let context = format!("{}/{}", ctx.node().task_name(), ctx.message().task_id());
        let data = if ctx.message().has_payload() {
            ctx.data().clone()
        } else {
            ctx.request().clone()
        };
        self.level.log(&context, &data.to_string());
        if ctx.node().is_sink() {
            ctx.sink(data);
        } else {
            ctx.emit(data).await?;
        }
        Ok(())
    }
}

/// Lets a message through only while it holds a lock.
///
/// On contention the message is dropped, not failed. As a start node it
/// forwards the invocation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GuardPlugin {
    /// Lock key; the invocation's task id when absent.
    #[serde(default)]
    pub key: Option<String>,
    /// Release the lock once every output returned.
    #[serde(default)]
    pub release: bool,
}

#[async_trait]
impl Plugin for GuardPlugin {
    fn init(&mut self, config: &Value) -> anyhow::Result<()> {
        *self = config_or_default(config)?;
        if self.key.as_deref() == Some("") {
            anyhow::bail!("`key` must not be empty");
        }
        Ok(())
    }

    async fn run(&self, ctx: &mut RunContext<'_>) -> Result<(), NodeError> {
        if !ctx.acquire_lock(self.key.as_deref()).await? {
            warn!(
                node = %ctx.node().key(),
                task_id = %ctx.message().task_id(),
                key = ?self.key,
                "resource busy, message dropped"
            );
            return Ok(());
        }
        let data = if ctx.message().has_payload() {
            ctx.data().clone()
        } else {
            ctx.request().clone()
        };
        ctx.emit(data).await?;
        if self.release {
            let key = self
                .key
                .clone()
                .unwrap_or_else(|| ctx.message().task_id().to_string());
            ctx.release_lock(&key).await?;
        }
        Ok(())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_types() {
        let registry = PluginRegistry::with_builtins();
        for kind in ["static", "passthrough", "split", "log", "guard"] {
            assert!(registry.contains(kind), "{kind} missing");
        }
    }

    #[test]
    fn test_static_requires_value() {
        let mut plugin = StaticPlugin::default();
        assert!(plugin.init(&Value::Null).is_err());
        assert!(plugin.init(&json!({"value": []})).is_err());
        assert!(plugin.init(&json!({"value": [1, 2]})).is_ok());
        assert_eq!(plugin.value, json!([1, 2]));
    }

    #[test]
    fn test_split_pointer_validation() {
        let mut plugin = SplitPlugin::default();
        assert!(plugin.init(&json!({"pointer": "rows"})).is_err());
        assert!(plugin.init(&json!({"pointer": "/rows"})).is_ok());
    }

    #[test]
    fn test_log_level_config() {
        let mut plugin = LogPlugin::default();
        plugin.init(&json!({"level": "warn"})).unwrap();
        assert_eq!(plugin.level, LogLevel::Warn);
        assert!(plugin.init(&json!({"colour": "red"})).is_err());
    }

    #[test]
    fn test_guard_rejects_empty_key() {
        let mut plugin = GuardPlugin::default();
        assert!(plugin.init(&json!({"key": ""})).is_err());
        plugin.init(&json!({"key": "job:42", "release": true})).unwrap();
        assert_eq!(plugin.key.as_deref(), Some("job:42"));
    }
}
