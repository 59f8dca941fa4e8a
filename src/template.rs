// src/template.rs

use handlebars::Handlebars;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TemplateError {
    #[error("template render failed: {0}")]
    Render(String),
}

/// Renders `{{trigger.*}}` / `{{nodes.<id>.*}}` placeholders inside node
/// params. Only string leaves are rendered; structure is preserved.
pub fn render_params(params: &Value, ctx: &Value) -> Result<Value, TemplateError> {
    let hb = Handlebars::new();
    render_value(&hb, params, ctx)
}

fn render_value(hb: &Handlebars, value: &Value, ctx: &Value) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) if s.contains("{{") => {
            let rendered = hb
                .render_template(s, ctx)
                .map_err(|e| TemplateError::Render(e.to_string()))?;
            Ok(Value::String(rendered))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(render_value(hb, item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_value(hb, v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Look up a dotted path (`trigger.post.panel`) inside a JSON value.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_trigger_placeholders() {
        let ctx = json!({ "trigger": { "post": { "id": "p1", "text": "hello" } } });
        let params = json!({
            "post_id": "{{trigger.post.id}}",
            "text": "re: {{trigger.post.text}}",
            "count": 3
        });

        let rendered = render_params(&params, &ctx).unwrap();
        assert_eq!(rendered["post_id"], "p1");
        assert_eq!(rendered["text"], "re: hello");
        assert_eq!(rendered["count"], 3);
    }

    #[test]
    fn renders_upstream_node_outputs() {
        let ctx = json!({
            "trigger": {},
            "nodes": { "n1": { "output": { "result_ref": "res/42" } } }
        });
        let params = json!({ "text": "see {{nodes.n1.output.result_ref}}" });

        let rendered = render_params(&params, &ctx).unwrap();
        assert_eq!(rendered["text"], "see res/42");
    }

    #[test]
    fn leaves_plain_strings_untouched() {
        let ctx = json!({});
        let params = json!({ "text": "no placeholders here", "nested": ["a", { "b": "c" }] });
        assert_eq!(render_params(&params, &ctx).unwrap(), params);
    }

    #[test]
    fn missing_placeholder_renders_empty() {
        let ctx = json!({ "trigger": {} });
        let params = json!({ "text": "[{{trigger.post.id}}]" });
        let rendered = render_params(&params, &ctx).unwrap();
        assert_eq!(rendered["text"], "[]");
    }

    #[test]
    fn lookup_path_walks_objects() {
        let root = json!({ "post": { "panel": "user", "n": 1 } });
        assert_eq!(lookup_path(&root, "post.panel"), Some(&json!("user")));
        assert_eq!(lookup_path(&root, "post.missing"), None);
        assert_eq!(lookup_path(&root, "post"), Some(&json!({ "panel": "user", "n": 1 })));
    }
}
