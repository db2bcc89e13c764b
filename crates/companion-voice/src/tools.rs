//! Named side-effect tools the generator can invoke mid-turn.
//!
//! The broker owns a registry of tools, exposes their schemas in
//! chat-completion function format, and executes them under a hard
//! deadline. Execution never fails outward: timeouts and errors come back
//! as localized strings the generator weaves into its reply. Tools have no
//! access to gateway state.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use rand::seq::SliceRandom;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

/// Spoken while a tool is being executed, so the caller hears continuous
/// speech across the fetch latency.
pub const HOLDING_PHRASES: [&str; 4] = [
    "Lass mich das kurz für dich herausfinden...",
    "Moment, ich schau mal nach...",
    "Einen Augenblick, ich hole die Infos...",
    "Kurz warten, ich schaue nach...",
];

/// Pick a holding phrase at random.
pub fn holding_phrase() -> &'static str {
    HOLDING_PHRASES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(HOLDING_PHRASES[0])
}

/// A callable tool: a schema the model sees and an executor.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    /// Chat-completion function schema.
    fn definition(&self) -> serde_json::Value;
    async fn execute(&self, args: &serde_json::Value) -> VoiceResult<String>;
}

/// Registry of tools with a hard per-call timeout.
pub struct ToolBroker {
    tools: Vec<Box<dyn Tool>>,
    timeout: Duration,
    call_id: String,
}

impl ToolBroker {
    pub fn new(timeout_ms: u64, call_id: impl Into<String>) -> Self {
        Self {
            tools: Vec::new(),
            timeout: Duration::from_millis(timeout_ms),
            call_id: call_id.into(),
        }
    }

    pub fn with_tool(mut self, tool: Box<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Schemas for every registered tool, for the generator's request.
    pub fn definitions(&self) -> Vec<serde_json::Value> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// Run a tool by name. Always returns a string the generator can speak:
    /// failures and timeouts become localized apologies.
    pub async fn execute(&self, name: &str, args: &serde_json::Value) -> String {
        let Some(tool) = self.tools.iter().find(|t| t.name() == name) else {
            warn!(target: "companion::tools", call_id = %self.call_id, tool = name, "unknown tool requested");
            return format!("Unbekanntes Werkzeug: {name}");
        };

        info!(target: "companion::tools", call_id = %self.call_id, tool = name, "executing tool");
        let outcome = match tokio::time::timeout(self.timeout, tool.execute(args)).await {
            Ok(result) => result,
            Err(_) => Err(VoiceError::ToolTimeout(self.timeout.as_millis() as u64)),
        };
        match outcome {
            Ok(result) => result,
            Err(e @ VoiceError::ToolTimeout(_)) => {
                warn!(target: "companion::tools", call_id = %self.call_id, tool = name, error = %e, "tool timed out");
                "Entschuldigung, das hat zu lange gedauert.".to_string()
            }
            Err(e) => {
                warn!(target: "companion::tools", call_id = %self.call_id, tool = name, error = %e, "tool failed");
                "Entschuldigung, beim Abrufen der Informationen ist ein Fehler aufgetreten."
                    .to_string()
            }
        }
    }
}

/// News categories mapped to tagesschau RSS endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewsCategory {
    All,
    Inland,
    Ausland,
    Wirtschaft,
    Sport,
}

impl NewsCategory {
    /// Parse the tool argument; anything unrecognized means all news.
    pub fn from_arg(arg: &str) -> Self {
        match arg {
            "inland" => Self::Inland,
            "ausland" => Self::Ausland,
            "wirtschaft" => Self::Wirtschaft,
            "sport" => Self::Sport,
            _ => Self::All,
        }
    }

    pub fn feed_url(self) -> &'static str {
        match self {
            Self::All => "https://www.tagesschau.de/infoservices/alle-meldungen-100~rss2.xml",
            Self::Inland => "https://www.tagesschau.de/inland/index~rss2.xml",
            Self::Ausland => "https://www.tagesschau.de/ausland/index~rss2.xml",
            Self::Wirtschaft => "https://www.tagesschau.de/wirtschaft/index~rss2.xml",
            Self::Sport => "https://www.tagesschau.de/sport/index~rss2.xml",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::All => "Aktuelle",
            Self::Inland => "Deutschland",
            Self::Ausland => "Internationale",
            Self::Wirtschaft => "Wirtschafts",
            Self::Sport => "Sport",
        }
    }
}

#[derive(Debug, Default, Clone)]
struct NewsItem {
    title: String,
    description: String,
}

/// Parse RSS items from feed XML, capped at `count`.
fn parse_rss_items(xml: &str, count: usize) -> VoiceResult<Vec<NewsItem>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut items = Vec::new();
    let mut in_item = false;
    let mut current_tag: Option<String> = None;
    let mut item = NewsItem::default();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if tag == "item" {
                    in_item = true;
                    item = NewsItem::default();
                } else if in_item {
                    current_tag = Some(tag);
                }
            }
            Ok(Event::Text(t)) => {
                if in_item {
                    let text = t.unescape().unwrap_or_default().into_owned();
                    append_field(&mut item, current_tag.as_deref(), &text);
                }
            }
            Ok(Event::CData(t)) => {
                if in_item {
                    let text = String::from_utf8_lossy(&t.into_inner()).into_owned();
                    append_field(&mut item, current_tag.as_deref(), &text);
                }
            }
            Ok(Event::End(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if tag == "item" {
                    in_item = false;
                    if !item.title.is_empty() {
                        items.push(item.clone());
                        if items.len() >= count {
                            break;
                        }
                    }
                } else {
                    current_tag = None;
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(VoiceError::Tool(format!("feed parse error: {e}"))),
        }
    }
    Ok(items)
}

fn append_field(item: &mut NewsItem, tag: Option<&str>, text: &str) {
    match tag {
        Some("title") => item.title.push_str(text.trim()),
        Some("description") => item.description.push_str(text.trim()),
        _ => {}
    }
}

const DESCRIPTION_MAX_CHARS: usize = 150;

fn format_news(category: NewsCategory, items: &[NewsItem]) -> String {
    if items.is_empty() {
        return "Es gibt gerade keine aktuellen Nachrichten.".to_string();
    }
    let mut lines = vec![format!(
        "=== {} Nachrichten von tagesschau.de ===\n",
        category.display_name()
    )];
    for (i, item) in items.iter().enumerate() {
        lines.push(format!("{}. {}", i + 1, item.title));
        if !item.description.is_empty() {
            let description: String = if item.description.chars().count() > DESCRIPTION_MAX_CHARS {
                let truncated: String =
                    item.description.chars().take(DESCRIPTION_MAX_CHARS).collect();
                format!("{truncated}...")
            } else {
                item.description.clone()
            };
            lines.push(format!("   {description}"));
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

/// Current headlines from an RSS feed, formatted for the generator.
pub struct NewsTool {
    client: reqwest::Client,
}

impl NewsTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for NewsTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for NewsTool {
    fn name(&self) -> &str {
        "get_news"
    }

    fn definition(&self) -> serde_json::Value {
        json!({
            "type": "function",
            "function": {
                "name": "get_news",
                "description": "Ruft aktuelle Nachrichten und Schlagzeilen von tagesschau.de ab. \
                                Nutze dieses Tool, wenn der Nutzer nach aktuellen Nachrichten, \
                                Neuigkeiten oder dem Weltgeschehen fragt.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "category": {
                            "type": "string",
                            "description": "Optionale Kategorie. Leer lassen für alle Nachrichten.",
                            "enum": ["", "inland", "ausland", "wirtschaft", "sport"]
                        },
                        "count": {
                            "type": "integer",
                            "description": "Anzahl der Nachrichten (1-5). Standard: 3",
                            "default": 3
                        }
                    },
                    "required": []
                }
            }
        })
    }

    async fn execute(&self, args: &serde_json::Value) -> VoiceResult<String> {
        let category =
            NewsCategory::from_arg(args.get("category").and_then(|v| v.as_str()).unwrap_or(""));
        let count = args
            .get("count")
            .and_then(|v| v.as_i64())
            .unwrap_or(3)
            .clamp(1, 5) as usize;

        let response = self
            .client
            .get(category.feed_url())
            .send()
            .await
            .map_err(|e| VoiceError::Tool(format!("feed fetch failed: {e}")))?;
        if !response.status().is_success() {
            return Ok(
                "Entschuldigung, ich konnte die Nachrichten gerade nicht abrufen.".to_string(),
            );
        }
        let xml = response
            .text()
            .await
            .map_err(|e| VoiceError::Tool(format!("feed read failed: {e}")))?;

        match parse_rss_items(&xml, count) {
            Ok(items) => Ok(format_news(category, &items)),
            Err(_) => Ok(
                "Entschuldigung, ich konnte die Nachrichten gerade nicht verarbeiten.".to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>tagesschau.de</title>
    <item>
      <title>Erste Meldung</title>
      <description><![CDATA[Kurze Beschreibung der ersten Meldung.]]></description>
      <pubDate>Sat, 01 Aug 2026 10:00:00 +0200</pubDate>
    </item>
    <item>
      <title>Zweite Meldung</title>
      <description>Zweite Beschreibung.</description>
    </item>
    <item>
      <title>Dritte Meldung</title>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn parses_items_up_to_count() {
        let items = parse_rss_items(FEED, 2).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Erste Meldung");
        assert_eq!(items[0].description, "Kurze Beschreibung der ersten Meldung.");
        assert_eq!(items[1].title, "Zweite Meldung");
    }

    #[test]
    fn item_without_description_is_kept() {
        let items = parse_rss_items(FEED, 5).unwrap();
        assert_eq!(items.len(), 3);
        assert!(items[2].description.is_empty());
    }

    #[test]
    fn formats_numbered_summary() {
        let items = parse_rss_items(FEED, 3).unwrap();
        let text = format_news(NewsCategory::All, &items);
        assert!(text.starts_with("=== Aktuelle Nachrichten von tagesschau.de ==="));
        assert!(text.contains("1. Erste Meldung"));
        assert!(text.contains("3. Dritte Meldung"));
    }

    #[test]
    fn long_descriptions_are_truncated() {
        let items = vec![NewsItem {
            title: "T".into(),
            description: "x".repeat(200),
        }];
        let text = format_news(NewsCategory::Sport, &items);
        assert!(text.contains(&format!("{}...", "x".repeat(150))));
        assert!(!text.contains(&"x".repeat(151)));
    }

    #[test]
    fn empty_feed_yields_no_news_message() {
        assert_eq!(
            format_news(NewsCategory::All, &[]),
            "Es gibt gerade keine aktuellen Nachrichten."
        );
    }

    #[test]
    fn category_parsing_defaults_to_all() {
        assert_eq!(NewsCategory::from_arg("sport"), NewsCategory::Sport);
        assert_eq!(NewsCategory::from_arg(""), NewsCategory::All);
        assert_eq!(NewsCategory::from_arg("unsinn"), NewsCategory::All);
    }

    #[tokio::test]
    async fn broker_reports_unknown_tool() {
        let broker = ToolBroker::new(5000, "CA1");
        let result = broker.execute("get_weather", &json!({})).await;
        assert!(result.contains("Unbekanntes Werkzeug"));
    }

    #[tokio::test]
    async fn broker_enforces_deadline() {
        struct SlowTool;
        #[async_trait]
        impl Tool for SlowTool {
            fn name(&self) -> &str {
                "slow"
            }
            fn definition(&self) -> serde_json::Value {
                json!({"type": "function", "function": {"name": "slow"}})
            }
            async fn execute(&self, _args: &serde_json::Value) -> VoiceResult<String> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok("done".into())
            }
        }

        let broker = ToolBroker::new(20, "CA1").with_tool(Box::new(SlowTool));
        let result = broker.execute("slow", &json!({})).await;
        assert!(result.contains("zu lange gedauert"));
    }

    #[tokio::test]
    async fn broker_wraps_tool_errors() {
        struct FailingTool;
        #[async_trait]
        impl Tool for FailingTool {
            fn name(&self) -> &str {
                "broken"
            }
            fn definition(&self) -> serde_json::Value {
                json!({"type": "function", "function": {"name": "broken"}})
            }
            async fn execute(&self, _args: &serde_json::Value) -> VoiceResult<String> {
                Err(VoiceError::Tool("boom".into()))
            }
        }

        let broker = ToolBroker::new(1000, "CA1").with_tool(Box::new(FailingTool));
        let result = broker.execute("broken", &json!({})).await;
        assert!(result.contains("Fehler aufgetreten"));
    }
}
