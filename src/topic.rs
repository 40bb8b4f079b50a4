pub const NEW_CHAT_TOPIC: &str = "New Chat";
pub const ERROR_TOPIC: &str = "Error";
pub const DEFAULT_TOPIC: &str = "Financial Analysis";

/// Checked in order; the first keyword found wins.
const RULES: [(&str, &str); 3] = [
    ("cogs", "COGS Analysis"),
    ("revenue", "Revenue Analysis"),
    ("benchmark", "Benchmarking"),
];

/// Derive a display topic from the opening message of a chat.
pub fn detect_topic(message: Option<&str>) -> &'static str {
    let message = match message {
        Some(m) if !m.is_empty() => m.to_lowercase(),
        _ => return NEW_CHAT_TOPIC,
    };

    RULES
        .iter()
        .find(|(keyword, _)| message.contains(keyword))
        .map(|(_, topic)| *topic)
        .unwrap_or(DEFAULT_TOPIC)
}
