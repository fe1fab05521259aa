use serde_json::Value;

use crate::{fields::Fields, phase::PhaseDef, schema::FormSchema, session::Session};

/// "Ваши данные" block listing what has been collected so far
pub fn summary(schema: &FormSchema, session: &Session) -> Option<String> {
    let mut lines = Vec::new();
    for (field, label) in &schema.summary_labels {
        if let Some(value) = session.fields.get_value(field).and_then(display_value) {
            lines.push(format!("• {label}: {value}"));
        }
    }

    let items: Vec<&Fields> = session.items.iter().chain(&session.pending_group).collect();
    if !items.is_empty() {
        let label = session
            .active_group
            .as_deref()
            .and_then(|g| schema.group(g).ok())
            .map(|g| g.label.clone())
            .or_else(|| {
                schema
                    .phases()
                    .find_map(|p| p.group.as_deref())
                    .and_then(|g| schema.group(g).ok())
                    .map(|g| g.label.clone())
            })
            .unwrap_or_else(|| "Записи".to_string());
        let rendered: Vec<String> = items.iter().map(|item| describe_item(schema, item)).collect();
        lines.push(format!("• {label}: {}", rendered.join("; ")));
    }

    if lines.is_empty() {
        None
    } else {
        Some(format!("Ваши данные:\n{}", lines.join("\n")))
    }
}

fn describe_item(schema: &FormSchema, item: &Fields) -> String {
    let parts: Vec<String> = schema
        .summary_labels
        .iter()
        .filter_map(|(field, _)| item.get_value(field).and_then(display_value))
        .collect();
    if parts.is_empty() {
        item.iter()
            .filter_map(|(_, v)| display_value(v))
            .collect::<Vec<_>>()
            .join(", ")
    } else {
        parts.join(", ")
    }
}

fn display_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(items) if items.is_empty() => None,
        Value::Array(items) => Some(format!("{} файл(ов)", items.len())),
        Value::Object(map) => map
            .get("display_name")
            .or_else(|| map.get("label"))
            .and_then(Value::as_str)
            .map(str::to_string),
        other => Some(other.to_string()),
    }
}

/// Replaces `{field}` placeholders with collected values
pub fn fill_template(template: &str, fields: &Fields) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match fields.get_value(key).and_then(display_value) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Full prompt text for a phase: summary, step marker, then the phase's own question
pub fn phase_text(schema: &FormSchema, session: &Session, phase: &PhaseDef, repeat: bool) -> String {
    let visible = session.visible_fields();
    let question = match (&phase.repeat_prompt, repeat) {
        (Some(again), true) => again.as_str(),
        _ => phase.prompt.as_str(),
    };
    let question = fill_template(question, &visible);

    let mut blocks = Vec::new();
    if let Some(summary) = summary(schema, session) {
        blocks.push(summary);
    }
    if let (Some(step), Some(total)) = (phase.step, schema.total_steps) {
        blocks.push(format!("Шаг {step}/{total}"));
    }
    blocks.push(question);
    blocks.join("\n\n")
}
