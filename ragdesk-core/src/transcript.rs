//! Plain-text transcript export.

use crate::chat::ChatSettings;
use crate::provider::{Role, Turn};
use chrono::{DateTime, Local, TimeZone};
use std::fmt::Write;

/// Suggested file name for an export made at `now`.
pub fn default_file_name<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("ragdesk_report_{}.txt", now.format("%Y%m%d_%H%M"))
}

/// Renders the conversation with a header describing how it was produced.
pub fn render(settings: &ChatSettings, conversation: &[Turn]) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Model: {}", settings.model);
    let _ = writeln!(
        out,
        "Prompt mode: {}",
        settings.prompt_mode.as_deref().unwrap_or("custom")
    );
    if let Some(effort) = settings.reasoning_effort {
        let _ = writeln!(out, "Reasoning effort: {effort}");
    }
    let _ = writeln!(
        out,
        "Tools: {}",
        match &settings.file_search {
            Some(id) => format!("file_search ({id})"),
            None => "none".to_string(),
        }
    );
    out.push_str(&"=".repeat(60));
    out.push('\n');

    for turn in conversation {
        let speaker = match turn.role {
            Role::User => "You",
            Role::Assistant => turn.model.as_deref().unwrap_or("Assistant"),
            Role::System => "System",
        };
        let at = turn.at.with_timezone(&Local).format("%H:%M");
        let _ = writeln!(out, "\n[{at}] {speaker}:");
        out.push_str(turn.content.trim_end());
        out.push('\n');
    }

    out
}
