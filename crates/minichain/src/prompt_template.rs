use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tera::{Context, Error as TeraError, Tera};

/// The template used when an agent is not given one: the task, verbatim
pub const DEFAULT_PROMPT_TEMPLATE: &str = "{{ task }}";

pub fn load_prompt<T: Serialize>(template: &str, context_data: &T) -> Result<String, TeraError> {
    let mut tera = Tera::default();
    // Prompts are plain text, html escaping would mangle code and quotes
    tera.autoescape_on(vec![]);
    tera.add_raw_template("inline_template", template)?;
    let context = Context::from_serialize(context_data)?;
    let rendered = tera.render("inline_template", &context)?;
    Ok(rendered)
}

pub fn load_prompt_file<T: Serialize>(
    template_file: impl Into<PathBuf>,
    context_data: &T,
) -> Result<String, TeraError> {
    let template_path = template_file.into();
    let template_content = fs::read_to_string(&template_path).map_err(|e| {
        TeraError::chain(
            format!("Failed to read template file {}", template_path.display()),
            e,
        )
    })?;
    load_prompt(&template_content, context_data)
}
