use std::sync::{Arc, RwLock};

use minijinja::{Environment, UndefinedBehavior};
use once_cell::sync::Lazy;
use serde::Serialize;

static GLOBAL_ENV: Lazy<Arc<RwLock<Environment<'static>>>> = Lazy::new(|| {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Lenient);
    env.set_trim_blocks(true);

    let templates: [(&'static str, &'static str); 3] = [
        ("tool_preamble.md", include_str!("prompts/tool_preamble.md")),
        ("arch_router.md", include_str!("prompts/arch_router.md")),
        ("summarize_reasoning.md", include_str!("prompts/summarize_reasoning.md")),
    ];
    for (name, source) in templates {
        if let Err(e) = env.add_template(name, source) {
            tracing::error!(template = name, "failed to load prompt template: {}", e);
        }
    }

    Arc::new(RwLock::new(env))
});

/// Render one of the bundled prompt templates.
pub fn render_global_file<T: Serialize>(
    template_name: &str,
    context: &T,
) -> Result<String, minijinja::Error> {
    let env = GLOBAL_ENV.read().unwrap_or_else(|e| e.into_inner());
    let template = env.get_template(template_name)?;
    let rendered = template.render(context)?;
    Ok(rendered.trim().to_string())
}

/// Render an ad-hoc template string with the same settings as the bundled ones.
pub fn render_inline<T: Serialize>(template_str: &str, context: &T) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Lenient);
    env.set_trim_blocks(true);
    env.add_template("inline", template_str)?;
    let rendered = env.get_template("inline")?.render(context)?;
    Ok(rendered.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_inline() {
        let rendered = render_inline("Hello {{ name }}{% if missing %}!{% endif %}", &json!({"name": "there"})).unwrap();
        assert_eq!(rendered, "Hello there");
    }

    #[test]
    fn test_bundled_templates_render() {
        let rendered = render_global_file(
            "summarize_reasoning.md",
            &json!({"reasoning": "I considered A and B, then chose B."}),
        )
        .unwrap();
        assert!(rendered.contains("I considered A and B"));
        assert!(render_global_file("nope.md", &json!({})).is_err());
    }
}
