use serde::{Deserialize, Serialize};

/// Marker that opens a normal action call in the model's reply.
pub const DO_MARKER: &str = "do(action=";
/// Marker that terminates the task with success.
pub const FINISH_MARKER: &str = "finish(message=";
/// Marker that requests human takeover.
pub const CALL_USER_MARKER: &str = "call_user(message=";

const MARKERS: [&str; 3] = [DO_MARKER, FINISH_MARKER, CALL_USER_MARKER];

/// Length of the longest action marker. The streaming splitter may hold back
/// at most `LONGEST_MARKER_LEN - 1` bytes before a chunk is provably thinking.
pub const LONGEST_MARKER_LEN: usize = CALL_USER_MARKER.len();

/// A single device action decided by the model.
///
/// Closed sum type: new verbs are additive schema changes, every consumer
/// matches exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Tap {
        x: i32,
        y: i32,
    },
    /// Tap a logical accessibility element by index instead of coordinates.
    TapElement {
        index: u32,
    },
    LongPress {
        x: i32,
        y: i32,
        duration_ms: u64,
    },
    Swipe {
        start: (i32, i32),
        end: (i32, i32),
        duration_ms: u64,
    },
    SwipeDirection {
        direction: Direction,
        magnitude: u32,
    },
    Type {
        text: String,
        clear_first: bool,
    },
    Back,
    Home,
    OpenApp {
        name: String,
    },
    OpenDeepLink {
        uri: String,
    },
    Wait {
        duration_ms: u64,
    },
    Finish {
        message: String,
    },
    CallUser {
        message: String,
    },
    /// The reply contained no recognizable action. Counts against the
    /// consecutive-parse-error budget instead of failing the run outright.
    ParseError {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(Direction::Up),
            "down" => Some(Direction::Down),
            "left" => Some(Direction::Left),
            "right" => Some(Direction::Right),
            _ => None,
        }
    }
}

impl Action {
    /// Canonical marker form. Parsing the result yields the same action back,
    /// and re-serializing a parsed canonical string is byte-identical.
    pub fn to_wire(&self) -> String {
        match self {
            Action::Tap { x, y } => format!("do(action=\"tap\", coordinate=[{},{}])", x, y),
            Action::TapElement { index } => format!("do(action=\"tap\", element={})", index),
            Action::LongPress { x, y, duration_ms } => format!(
                "do(action=\"long_press\", coordinate=[{},{}], duration={})",
                x, y, duration_ms
            ),
            Action::Swipe {
                start,
                end,
                duration_ms,
            } => format!(
                "do(action=\"swipe\", start=[{},{}], end=[{},{}], duration={})",
                start.0, start.1, end.0, end.1, duration_ms
            ),
            Action::SwipeDirection {
                direction,
                magnitude,
            } => format!(
                "do(action=\"swipe\", direction=\"{}\", magnitude={})",
                direction.as_str(),
                magnitude
            ),
            Action::Type { text, clear_first } => format!(
                "do(action=\"type\", text=\"{}\", clear={})",
                escape(text),
                clear_first
            ),
            Action::Back => "do(action=\"back\")".to_string(),
            Action::Home => "do(action=\"home\")".to_string(),
            Action::OpenApp { name } => format!("do(action=\"open\", app=\"{}\")", escape(name)),
            Action::OpenDeepLink { uri } => {
                format!("do(action=\"deep_link\", uri=\"{}\")", escape(uri))
            }
            Action::Wait { duration_ms } => format!("do(action=\"wait\", duration={})", duration_ms),
            Action::Finish { message } => format!("finish(message=\"{}\")", escape(message)),
            Action::CallUser { message } => format!("call_user(message=\"{}\")", escape(message)),
            // No wire form; the verb is unknown to models by construction.
            Action::ParseError { .. } => "do(action=\"parse_error\")".to_string(),
        }
    }

    /// Compact human-readable form for memory placeholders and verification
    /// context ("tap(540,1200)", "type(\"burger\")").
    pub fn summary(&self) -> String {
        match self {
            Action::Tap { x, y } => format!("tap({},{})", x, y),
            Action::TapElement { index } => format!("tap(element {})", index),
            Action::LongPress { x, y, .. } => format!("long_press({},{})", x, y),
            Action::Swipe { start, end, .. } => format!(
                "swipe({},{} -> {},{})",
                start.0, start.1, end.0, end.1
            ),
            Action::SwipeDirection {
                direction,
                magnitude,
            } => format!("swipe({} {})", direction.as_str(), magnitude),
            Action::Type { text, .. } => format!("type(\"{}\")", truncate(text, 30)),
            Action::Back => "back".to_string(),
            Action::Home => "home".to_string(),
            Action::OpenApp { name } => format!("open({})", name),
            Action::OpenDeepLink { uri } => format!("deep_link({})", truncate(uri, 40)),
            Action::Wait { duration_ms } => format!("wait({}ms)", duration_ms),
            Action::Finish { .. } => "finish".to_string(),
            Action::CallUser { .. } => "call_user".to_string(),
            Action::ParseError { .. } => "parse_error".to_string(),
        }
    }
}

/// Result of the authoritative whole-text parse of a model reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReply {
    /// Everything before the first action marker.
    pub thinking: String,
    pub action: Action,
    /// Confirmation message when the model flagged the action sensitive
    /// via a `confirm="…"` parameter.
    pub confirm: Option<String>,
    pub warnings: Vec<String>,
}

/// True when `tail` is a proper prefix of at least one action marker.
pub(crate) fn marker_starts_with(tail: &[u8]) -> bool {
    MARKERS
        .iter()
        .any(|m| m.len() > tail.len() && m.as_bytes().starts_with(tail))
}

/// Find the earliest action marker in `text`. Returns (byte offset, marker).
pub fn find_marker(text: &str) -> Option<(usize, &'static str)> {
    MARKERS
        .iter()
        .filter_map(|m| text.find(m).map(|pos| (pos, *m)))
        .min_by_key(|(pos, _)| *pos)
}

/// Parse a complete model reply into thinking + action.
///
/// The first marker wins; a second complete marker later in the reply is
/// ignored with a warning. A reply with no marker, an unknown verb, or
/// missing required parameters yields `Action::ParseError`.
pub fn parse_reply(text: &str) -> ParsedReply {
    let Some((pos, marker)) = find_marker(text) else {
        return ParsedReply {
            thinking: text.trim().to_string(),
            action: Action::ParseError {
                reason: "no action marker in reply".to_string(),
            },
            confirm: None,
            warnings: Vec::new(),
        };
    };

    let thinking = text[..pos].to_string();
    let mut warnings = Vec::new();

    // The opening paren sits right before the first `=` of the marker.
    let open = pos + marker.find('(').unwrap_or(0);
    let Some((args_str, end)) = balanced_args(text, open) else {
        return ParsedReply {
            thinking,
            action: Action::ParseError {
                reason: "unterminated action call".to_string(),
            },
            confirm: None,
            warnings,
        };
    };

    if find_marker(&text[end..]).is_some() {
        warnings.push("trailing action marker ignored (first marker wins)".to_string());
    }

    let mut params = Vec::new();
    for raw in split_top_level(args_str) {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        match parse_param(raw) {
            Some(kv) => params.push(kv),
            None => warnings.push(format!("unparseable parameter ignored: {}", raw)),
        }
    }

    let confirm = take_str(&mut params, "confirm");

    let action = match marker {
        FINISH_MARKER => match take_str(&mut params, "message") {
            Some(message) => Action::Finish { message },
            None => Action::ParseError {
                reason: "finish() without a message".to_string(),
            },
        },
        CALL_USER_MARKER => match take_str(&mut params, "message") {
            Some(message) => Action::CallUser { message },
            None => Action::ParseError {
                reason: "call_user() without a message".to_string(),
            },
        },
        _ => {
            let verb = take_str(&mut params, "action").unwrap_or_default();
            match build_do_action(&verb, &mut params) {
                Ok(action) => action,
                Err(reason) => Action::ParseError { reason },
            }
        }
    };

    ParsedReply {
        thinking,
        action,
        confirm,
        warnings,
    }
}

/// Build a `do(...)` action from its verb and remaining parameters.
fn build_do_action(verb: &str, params: &mut Vec<(String, ParamValue)>) -> Result<Action, String> {
    match verb {
        "tap" => {
            if let Some((x, y)) = take_pair(params, "coordinate") {
                Ok(Action::Tap {
                    x: x as i32,
                    y: y as i32,
                })
            } else if let Some(index) = take_int(params, "element") {
                Ok(Action::TapElement {
                    index: index as u32,
                })
            } else {
                Err("tap without coordinate or element".to_string())
            }
        }
        "long_press" => {
            let (x, y) =
                take_pair(params, "coordinate").ok_or("long_press without coordinate")?;
            let duration_ms = take_int(params, "duration").unwrap_or(800) as u64;
            Ok(Action::LongPress {
                x: x as i32,
                y: y as i32,
                duration_ms,
            })
        }
        "swipe" => {
            if let (Some(start), Some(end)) =
                (take_pair(params, "start"), take_pair(params, "end"))
            {
                let duration_ms = take_int(params, "duration").unwrap_or(300) as u64;
                Ok(Action::Swipe {
                    start: (start.0 as i32, start.1 as i32),
                    end: (end.0 as i32, end.1 as i32),
                    duration_ms,
                })
            } else if let Some(dir) = take_str(params, "direction") {
                let direction = Direction::parse(&dir)
                    .ok_or_else(|| format!("unknown swipe direction: {}", dir))?;
                let magnitude = take_int(params, "magnitude").unwrap_or(300) as u32;
                Ok(Action::SwipeDirection {
                    direction,
                    magnitude,
                })
            } else {
                Err("swipe without start/end or direction".to_string())
            }
        }
        "type" => {
            let text = take_str(params, "text").ok_or("type without text")?;
            let clear_first = take_bool(params, "clear").unwrap_or(false);
            Ok(Action::Type { text, clear_first })
        }
        "back" => Ok(Action::Back),
        "home" => Ok(Action::Home),
        "open" => {
            let name = take_str(params, "app").ok_or("open without app")?;
            Ok(Action::OpenApp { name })
        }
        "deep_link" => {
            let uri = take_str(params, "uri").ok_or("deep_link without uri")?;
            Ok(Action::OpenDeepLink { uri })
        }
        "wait" => {
            let duration_ms = take_int(params, "duration").unwrap_or(1000) as u64;
            Ok(Action::Wait { duration_ms })
        }
        "" => Err("do() without an action verb".to_string()),
        other => Err(format!("unknown action verb: {}", other)),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ParamValue {
    Int(i64),
    Str(String),
    Bool(bool),
    Pair(i64, i64),
}

fn take(params: &mut Vec<(String, ParamValue)>, key: &str) -> Option<ParamValue> {
    let idx = params.iter().position(|(k, _)| k == key)?;
    Some(params.remove(idx).1)
}

fn take_str(params: &mut Vec<(String, ParamValue)>, key: &str) -> Option<String> {
    match take(params, key)? {
        ParamValue::Str(s) => Some(s),
        _ => None,
    }
}

fn take_int(params: &mut Vec<(String, ParamValue)>, key: &str) -> Option<i64> {
    match take(params, key)? {
        ParamValue::Int(i) => Some(i),
        _ => None,
    }
}

fn take_bool(params: &mut Vec<(String, ParamValue)>, key: &str) -> Option<bool> {
    match take(params, key)? {
        ParamValue::Bool(b) => Some(b),
        _ => None,
    }
}

fn take_pair(params: &mut Vec<(String, ParamValue)>, key: &str) -> Option<(i64, i64)> {
    match take(params, key)? {
        ParamValue::Pair(a, b) => Some((a, b)),
        _ => None,
    }
}

/// Slice out the argument list of a call, given the byte offset of its
/// opening paren. Returns the inner slice and the offset just past the
/// closing paren. Quoted strings shield their contents from bracket counting.
fn balanced_args(text: &str, open: usize) -> Option<(&str, usize)> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_str = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_str {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_str = false;
            }
            continue;
        }
        match b {
            b'"' => in_str = true,
            b'(' | b'[' => depth += 1,
            b')' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some((&text[open + 1..i], i + 1));
                }
            }
            _ => {}
        }
    }
    None
}

/// Split an argument list on top-level commas (commas inside quotes or
/// `[..]` pairs do not split).
fn split_top_level(args: &str) -> Vec<&str> {
    let bytes = args.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0usize;
    let mut depth = 0usize;
    let mut in_str = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_str {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_str = false;
            }
            continue;
        }
        match b {
            b'"' => in_str = true,
            b'[' | b'(' => depth += 1,
            b']' | b')' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                parts.push(&args[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&args[start..]);
    parts
}

fn parse_param(raw: &str) -> Option<(String, ParamValue)> {
    let eq = raw.find('=')?;
    let key = raw[..eq].trim();
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return None;
    }
    let value = parse_value(raw[eq + 1..].trim())?;
    Some((key.to_string(), value))
}

fn parse_value(raw: &str) -> Option<ParamValue> {
    if let Some(inner) = raw.strip_prefix('"') {
        let inner = inner.strip_suffix('"')?;
        return Some(ParamValue::Str(unescape(inner)));
    }
    if raw == "true" {
        return Some(ParamValue::Bool(true));
    }
    if raw == "false" {
        return Some(ParamValue::Bool(false));
    }
    if let Some(inner) = raw.strip_prefix('[') {
        let inner = inner.strip_suffix(']')?;
        let mut it = inner.splitn(2, ',');
        let a = it.next()?.trim().parse().ok()?;
        let b = it.next()?.trim().parse().ok()?;
        return Some(ParamValue::Pair(a, b));
    }
    raw.parse().ok().map(ParamValue::Int)
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    format!("{}...", s.chars().take(max).collect::<String>())
}
