use console::style;
use minichain::models::message::Message;

const MAX_OBSERVATION_LINES: usize = 40;

/// Print a message of the transcript as soon as it is appended
pub fn print_message(message: &Message) {
    if let Some(text) = format_message(message) {
        println!("{}\n", text);
    }
}

pub fn format_message(message: &Message) -> Option<String> {
    match message {
        Message::System { .. } | Message::User { .. } => None,
        Message::Assistant {
            function_call: Some(call),
            ..
        } => Some(format!(
            "{} {}",
            style(format!("─── {} ───", call.name)).magenta().bold(),
            style(pretty_arguments(&call.arguments)).dim()
        )),
        Message::Assistant { content, .. } => content.clone(),
        Message::Function { content, .. } => Some(style(truncate(content)).dim().to_string()),
    }
}

fn pretty_arguments(arguments: &str) -> String {
    serde_json::from_str::<serde_json::Value>(arguments)
        .and_then(|value| serde_json::to_string_pretty(&value))
        .unwrap_or_else(|_| arguments.to_string())
}

/// Long tool output is cut so the transcript stays readable
fn truncate(content: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    if lines.len() <= MAX_OBSERVATION_LINES {
        return content.trim_end().to_string();
    }
    format!(
        "{}\n... {} more lines",
        lines[..MAX_OBSERVATION_LINES].join("\n"),
        lines.len() - MAX_OBSERVATION_LINES
    )
}
