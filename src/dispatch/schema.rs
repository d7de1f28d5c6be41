//! Tool schema table.
//!
//! The built-in table covers the AtlasTrinity tool servers. An optional YAML
//! file can add tools, synonyms and keyword rules or replace built-in entries
//! of the same name.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::mcp_client::types::McpToolDefinition;
use crate::settings::SettingsError;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Coarse argument type used for validation and coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    #[default]
    Any,
}

impl ArgType {
    /// Map a JSON Schema `type` keyword.
    pub fn from_json_type(ty: &str) -> Self {
        match ty {
            "string" => Self::String,
            "number" => Self::Number,
            "integer" => Self::Integer,
            "boolean" => Self::Boolean,
            "array" => Self::Array,
            "object" => Self::Object,
            _ => Self::Any,
        }
    }
}

/// Argument schema of one tool, keyed by its canonical name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub server: String,
    /// Tool name on the server, when it differs from the canonical name.
    #[serde(default)]
    pub remote_name: Option<String>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
    #[serde(default)]
    pub types: BTreeMap<String, ArgType>,
    #[serde(default)]
    pub description: String,
}

impl ToolSchema {
    /// Name to send in `tools/call`.
    pub fn remote(&self) -> &str {
        self.remote_name.as_deref().unwrap_or(&self.name)
    }

    pub fn arg_type(&self, arg: &str) -> ArgType {
        self.types.get(arg).copied().unwrap_or_default()
    }

    /// Whether `arg` is a required or optional argument of this tool.
    pub fn expects(&self, arg: &str) -> bool {
        self.required.iter().any(|a| a == arg) || self.optional.iter().any(|a| a == arg)
    }

    /// Build a permissive schema from a server-advertised tool definition.
    pub fn from_advertised(server: &str, canonical: &str, def: &McpToolDefinition) -> Self {
        let required: Vec<String> = def
            .input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let mut optional = Vec::new();
        let mut types = BTreeMap::new();
        if let Some(props) = def.input_schema.get("properties").and_then(|p| p.as_object()) {
            for (key, prop) in props {
                if let Some(ty) = prop.get("type").and_then(|t| t.as_str()) {
                    types.insert(key.clone(), ArgType::from_json_type(ty));
                }
                if !required.contains(key) {
                    optional.push(key.clone());
                }
            }
        }

        Self {
            name: canonical.to_string(),
            server: server.to_string(),
            remote_name: (canonical != def.name).then(|| def.name.clone()),
            required,
            optional,
            types,
            description: def.description.clone(),
        }
    }
}

/// Routes hints containing `keyword` as a `_`-separated token to `tool`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub keyword: String,
    pub tool: String,
    /// Build a `command` argument from the hint, starting at the keyword
    /// (`run_git_status` → `git status`).
    #[serde(default)]
    pub command_from_hint: bool,
}

/// Tool schemas, synonyms and keyword rules, in registration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolTable {
    pub tools: Vec<ToolSchema>,
    /// `synonym → canonical tool name`.
    pub synonyms: BTreeMap<String, String>,
    pub keywords: Vec<KeywordRule>,
}

impl ToolTable {
    /// Merge `other` over `self`.
    ///
    /// Tools and keyword rules with an existing name/keyword replace it in
    /// place, new ones are appended; synonyms are overwritten.
    pub fn merge(&mut self, other: ToolTable) {
        for tool in other.tools {
            match self.tools.iter_mut().find(|t| t.name == tool.name) {
                Some(existing) => *existing = tool,
                None => self.tools.push(tool),
            }
        }
        self.synonyms.extend(other.synonyms);
        for rule in other.keywords {
            match self.keywords.iter_mut().find(|r| r.keyword == rule.keyword) {
                Some(existing) => *existing = rule,
                None => self.keywords.push(rule),
            }
        }
    }
}

/// Load the built-in table, merging a YAML tool table file over it.
pub fn load_tool_table(path: Option<&Path>) -> Result<ToolTable, SettingsError> {
    let mut table = default_tool_table();
    let Some(path) = path else {
        return Ok(table);
    };

    let raw = std::fs::read_to_string(path).map_err(|e| SettingsError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let overrides: ToolTable = serde_yaml::from_str(&raw).map_err(|e| SettingsError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    tracing::info!(
        path = %path.display(),
        tools = overrides.tools.len(),
        synonyms = overrides.synonyms.len(),
        keywords = overrides.keywords.len(),
        "merged tool table overrides"
    );
    table.merge(overrides);
    Ok(table)
}

// ─── Built-in Table ──────────────────────────────────────────────────────────

struct Def {
    name: &'static str,
    server: &'static str,
    remote: Option<&'static str>,
    required: &'static [(&'static str, ArgType)],
    optional: &'static [(&'static str, ArgType)],
    description: &'static str,
}

impl Def {
    fn to_schema(&self) -> ToolSchema {
        let types = self
            .required
            .iter()
            .chain(self.optional.iter())
            .map(|(arg, ty)| (arg.to_string(), *ty))
            .collect();
        ToolSchema {
            name: self.name.to_string(),
            server: self.server.to_string(),
            remote_name: self.remote.map(String::from),
            required: self.required.iter().map(|(a, _)| a.to_string()).collect(),
            optional: self.optional.iter().map(|(a, _)| a.to_string()).collect(),
            types,
            description: self.description.to_string(),
        }
    }
}

use ArgType::{Array, Boolean, Integer, Number, Object, String as Str};

const BUILTIN_TOOLS: &[Def] = &[
    // macos-use: native automation binary
    Def {
        name: "execute_command",
        server: "macos-use",
        remote: None,
        required: &[("command", Str)],
        optional: &[("cwd", Str), ("timeout", Integer)],
        description: "Run a shell command and return its output",
    },
    Def {
        name: "open_app",
        server: "macos-use",
        remote: Some("macos-use_open_application_and_traverse"),
        required: &[("identifier", Str)],
        optional: &[],
        description: "Open or activate an application by name, bundle id or path",
    },
    Def {
        name: "take_screenshot",
        server: "macos-use",
        remote: Some("macos-use_take_screenshot"),
        required: &[],
        optional: &[],
        description: "Capture the main screen",
    },
    Def {
        name: "click",
        server: "macos-use",
        remote: Some("macos-use_click_and_traverse"),
        required: &[("x", Number), ("y", Number)],
        optional: &[("pid", Integer)],
        description: "Click at screen coordinates",
    },
    Def {
        name: "type_text",
        server: "macos-use",
        remote: Some("macos-use_type_and_traverse"),
        required: &[("text", Str)],
        optional: &[("pid", Integer)],
        description: "Type text into the focused element",
    },
    Def {
        name: "press_key",
        server: "macos-use",
        remote: Some("macos-use_press_key_and_traverse"),
        required: &[("key_name", Str)],
        optional: &[("modifier_flags", Array), ("pid", Integer)],
        description: "Press a key, optionally with modifiers",
    },
    Def {
        name: "get_clipboard",
        server: "macos-use",
        remote: Some("macos-use_get_clipboard"),
        required: &[],
        optional: &[],
        description: "Read the clipboard contents",
    },
    Def {
        name: "set_clipboard",
        server: "macos-use",
        remote: Some("macos-use_set_clipboard"),
        required: &[("text", Str)],
        optional: &[],
        description: "Replace the clipboard contents",
    },
    Def {
        name: "send_notification",
        server: "macos-use",
        remote: Some("macos-use_send_notification"),
        required: &[("title", Str), ("message", Str)],
        optional: &[],
        description: "Show a system notification",
    },
    Def {
        name: "list_calendar_events",
        server: "macos-use",
        remote: Some("macos-use_calendar_events"),
        required: &[],
        optional: &[("start_date", Str), ("end_date", Str)],
        description: "List calendar events in a date range",
    },
    Def {
        name: "create_note",
        server: "macos-use",
        remote: Some("macos-use_notes_create_note"),
        required: &[("title", Str), ("body", Str)],
        optional: &[("folder", Str)],
        description: "Create a note in Notes",
    },
    Def {
        name: "send_mail",
        server: "macos-use",
        remote: Some("macos-use_mail_send"),
        required: &[("to", Str), ("subject", Str), ("body", Str)],
        optional: &[("cc", Array)],
        description: "Send an email through Mail",
    },
    // filesystem
    Def {
        name: "read_file",
        server: "filesystem",
        remote: None,
        required: &[("path", Str)],
        optional: &[],
        description: "Read a text file",
    },
    Def {
        name: "write_file",
        server: "filesystem",
        remote: None,
        required: &[("path", Str), ("content", Str)],
        optional: &[],
        description: "Create or overwrite a file",
    },
    Def {
        name: "list_directory",
        server: "filesystem",
        remote: None,
        required: &[("path", Str)],
        optional: &[],
        description: "List entries of a directory",
    },
    Def {
        name: "search_files",
        server: "filesystem",
        remote: None,
        required: &[("path", Str), ("pattern", Str)],
        optional: &[("excludePatterns", Array)],
        description: "Recursively search for files matching a pattern",
    },
    Def {
        name: "create_directory",
        server: "filesystem",
        remote: None,
        required: &[("path", Str)],
        optional: &[],
        description: "Create a directory (and parents)",
    },
    Def {
        name: "get_file_info",
        server: "filesystem",
        remote: None,
        required: &[("path", Str)],
        optional: &[],
        description: "File metadata: size, times, permissions",
    },
    Def {
        name: "move_file",
        server: "filesystem",
        remote: None,
        required: &[("source", Str), ("destination", Str)],
        optional: &[],
        description: "Move or rename a file",
    },
    // fetch
    Def {
        name: "fetch",
        server: "fetch",
        remote: None,
        required: &[("url", Str)],
        optional: &[("max_length", Integer), ("raw", Boolean)],
        description: "Fetch a URL and return its content as markdown",
    },
    // puppeteer
    Def {
        name: "puppeteer_navigate",
        server: "puppeteer",
        remote: None,
        required: &[("url", Str)],
        optional: &[],
        description: "Navigate the browser to a URL",
    },
    Def {
        name: "puppeteer_screenshot",
        server: "puppeteer",
        remote: None,
        required: &[("name", Str)],
        optional: &[("selector", Str), ("width", Integer), ("height", Integer)],
        description: "Screenshot the current page or an element",
    },
    Def {
        name: "puppeteer_click",
        server: "puppeteer",
        remote: None,
        required: &[("selector", Str)],
        optional: &[],
        description: "Click an element on the page",
    },
    Def {
        name: "puppeteer_fill",
        server: "puppeteer",
        remote: None,
        required: &[("selector", Str), ("value", Str)],
        optional: &[],
        description: "Fill an input field",
    },
    Def {
        name: "puppeteer_evaluate",
        server: "puppeteer",
        remote: None,
        required: &[("script", Str)],
        optional: &[],
        description: "Run JavaScript in the page",
    },
    // memory
    Def {
        name: "create_entities",
        server: "memory",
        remote: None,
        required: &[("entities", Array)],
        optional: &[],
        description: "Store entities in the knowledge graph",
    },
    Def {
        name: "search_nodes",
        server: "memory",
        remote: None,
        required: &[("query", Str)],
        optional: &[],
        description: "Search the knowledge graph",
    },
    Def {
        name: "read_graph",
        server: "memory",
        remote: None,
        required: &[],
        optional: &[],
        description: "Read the whole knowledge graph",
    },
    // github
    Def {
        name: "search_repositories",
        server: "github",
        remote: None,
        required: &[("query", Str)],
        optional: &[("page", Integer), ("perPage", Integer)],
        description: "Search GitHub repositories",
    },
    Def {
        name: "get_file_contents",
        server: "github",
        remote: None,
        required: &[("owner", Str), ("repo", Str), ("path", Str)],
        optional: &[("branch", Str)],
        description: "Read a file from a GitHub repository",
    },
    Def {
        name: "create_issue",
        server: "github",
        remote: None,
        required: &[("owner", Str), ("repo", Str), ("title", Str)],
        optional: &[("body", Str), ("labels", Array)],
        description: "Open a GitHub issue",
    },
    // sequential-thinking
    Def {
        name: "sequentialthinking",
        server: "sequential-thinking",
        remote: None,
        required: &[("thought", Str)],
        optional: &[
            ("nextThoughtNeeded", Boolean),
            ("thoughtNumber", Integer),
            ("totalThoughts", Integer),
            ("context", Object),
        ],
        description: "Record one step of structured reasoning",
    },
];

const BUILTIN_SYNONYMS: &[(&str, &[&str])] = &[
    (
        "execute_command",
        &["terminal", "shell", "bash", "zsh", "sh", "run_command", "run_shell", "execute", "cmd"],
    ),
    ("open_app", &["open_application", "launch_app", "launch", "start_app"]),
    ("take_screenshot", &["screenshot", "capture_screen", "screen_capture"]),
    ("type_text", &["type", "keyboard_type", "input_text"]),
    ("press_key", &["press", "hotkey", "key_press"]),
    ("get_clipboard", &["read_clipboard", "clipboard_read"]),
    ("set_clipboard", &["copy_to_clipboard", "write_clipboard", "clipboard_write"]),
    ("send_notification", &["notify"]),
    ("list_calendar_events", &["calendar", "calendar_events", "list_events"]),
    ("create_note", &["add_note", "new_note"]),
    ("send_mail", &["send_email", "compose_email"]),
    ("read_file", &["cat", "read", "open_file", "file_read", "view_file"]),
    ("write_file", &["write", "save_file", "file_write", "create_file"]),
    ("list_directory", &["ls", "list_dir", "list_files", "dir"]),
    ("search_files", &["find_files", "glob", "search_file"]),
    ("create_directory", &["mkdir", "make_directory"]),
    ("get_file_info", &["stat", "file_info"]),
    ("move_file", &["mv", "rename", "rename_file", "move"]),
    (
        "fetch",
        &["web_fetch", "fetch_url", "http_get", "curl", "get_url", "read_url", "download_page"],
    ),
    ("puppeteer_navigate", &["browse", "navigate", "open_url", "goto", "open_website"]),
    ("puppeteer_screenshot", &["browser_screenshot", "page_screenshot"]),
    ("puppeteer_click", &["browser_click", "click_element"]),
    ("puppeteer_fill", &["fill_form", "browser_fill"]),
    ("puppeteer_evaluate", &["run_js", "evaluate_js", "execute_javascript"]),
    ("create_entities", &["remember", "memorize", "store_memory", "add_entities"]),
    ("search_nodes", &["recall", "search_memory", "query_memory"]),
    ("search_repositories", &["github_search", "search_repos", "find_repo"]),
    ("get_file_contents", &["github_file", "read_github_file"]),
    ("create_issue", &["open_issue"]),
    ("sequentialthinking", &["think", "sequential_thinking", "reasoning"]),
];

/// Shell tools whose hint doubles as the command line.
const SHELL_KEYWORDS: &[&str] = &[
    "git", "npm", "npx", "pip", "pip3", "brew", "docker", "python3", "make", "cargo", "kubectl",
];

/// Noun keywords. Targets are read-only tools: a noun says nothing about
/// whether the caller wants to read, write or delete.
const ROUTING_KEYWORDS: &[(&str, &str)] = &[
    ("screenshot", "take_screenshot"),
    ("clipboard", "get_clipboard"),
    ("calendar", "list_calendar_events"),
    ("memory", "search_nodes"),
];

/// The built-in AtlasTrinity tool table.
pub fn default_tool_table() -> ToolTable {
    let tools = BUILTIN_TOOLS.iter().map(Def::to_schema).collect();

    let synonyms = BUILTIN_SYNONYMS
        .iter()
        .flat_map(|(tool, words)| words.iter().map(move |w| (w.to_string(), tool.to_string())))
        .collect();

    let keywords = SHELL_KEYWORDS
        .iter()
        .map(|kw| KeywordRule {
            keyword: kw.to_string(),
            tool: "execute_command".to_string(),
            command_from_hint: true,
        })
        .chain(ROUTING_KEYWORDS.iter().map(|(kw, tool)| KeywordRule {
            keyword: kw.to_string(),
            tool: tool.to_string(),
            command_from_hint: false,
        }))
        .collect();

    ToolTable {
        tools,
        synonyms,
        keywords,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_default_table_names_are_unique() {
        let table = default_tool_table();
        let names: HashSet<&str> = table.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names.len(), table.tools.len());
    }

    #[test]
    fn test_default_synonyms_target_known_tools() {
        let table = default_tool_table();
        let names: HashSet<&str> = table.tools.iter().map(|t| t.name.as_str()).collect();
        for (synonym, target) in &table.synonyms {
            assert!(names.contains(target.as_str()), "{synonym} → unknown {target}");
            assert!(!names.contains(synonym.as_str()), "{synonym} shadows a tool");
        }
        for rule in &table.keywords {
            assert!(names.contains(rule.tool.as_str()), "keyword {} → unknown", rule.keyword);
        }
    }

    #[test]
    fn test_fetch_schema() {
        let table = default_tool_table();
        let fetch = table.tools.iter().find(|t| t.name == "fetch").unwrap();
        assert_eq!(fetch.server, "fetch");
        assert_eq!(fetch.required, vec!["url"]);
        assert_eq!(fetch.arg_type("url"), ArgType::String);
        assert_eq!(fetch.arg_type("max_length"), ArgType::Integer);
        assert_eq!(fetch.arg_type("unknown"), ArgType::Any);
        assert!(fetch.expects("raw"));
        assert_eq!(fetch.remote(), "fetch");
    }

    #[test]
    fn test_remote_name() {
        let table = default_tool_table();
        let open = table.tools.iter().find(|t| t.name == "open_app").unwrap();
        assert_eq!(open.remote(), "macos-use_open_application_and_traverse");
    }

    #[test]
    fn test_from_advertised() {
        let def = McpToolDefinition {
            name: "list_reminders".into(),
            description: "List reminders".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "list": {"type": "string"},
                    "limit": {"type": "integer"}
                },
                "required": ["list"]
            }),
        };
        let schema = ToolSchema::from_advertised("reminders", "list_reminders", &def);
        assert_eq!(schema.required, vec!["list"]);
        assert_eq!(schema.optional, vec!["limit"]);
        assert_eq!(schema.arg_type("limit"), ArgType::Integer);
        assert!(schema.remote_name.is_none());

        let qualified = ToolSchema::from_advertised("reminders", "reminders.list_reminders", &def);
        assert_eq!(qualified.remote(), "list_reminders");
    }

    #[test]
    fn test_merge_replaces_in_place_and_appends() {
        let mut table = default_tool_table();
        let position = table.tools.iter().position(|t| t.name == "fetch").unwrap();
        let before = table.tools.len();

        let overrides: ToolTable = serde_yaml::from_str(
            r#"
tools:
  - name: fetch
    server: macos-use
    remote_name: fetch_url
    required: [url]
    types: {url: string}
  - name: list_reminders
    server: reminders
    required: [list]
synonyms:
  reminders: list_reminders
keywords:
  - keyword: git
    tool: execute_command
    command_from_hint: false
"#,
        )
        .unwrap();
        table.merge(overrides);

        assert_eq!(table.tools.len(), before + 1);
        assert_eq!(table.tools[position].server, "macos-use");
        assert_eq!(table.tools[position].remote(), "fetch_url");
        assert_eq!(table.synonyms["reminders"], "list_reminders");
        let git = table.keywords.iter().find(|r| r.keyword == "git").unwrap();
        assert!(!git.command_from_hint);
    }

    #[test]
    fn test_load_tool_table_without_file() {
        let table = load_tool_table(None).unwrap();
        assert_eq!(table.tools.len(), BUILTIN_TOOLS.len());
    }

    #[test]
    fn test_load_tool_table_bad_yaml() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("tools.yaml");
        std::fs::write(&path, "tools: {not: a list}\n").unwrap();
        assert!(matches!(
            load_tool_table(Some(path.as_path())),
            Err(SettingsError::Parse { .. })
        ));
    }
}
