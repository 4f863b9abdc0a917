//! Tolerant parsing of streaming/incomplete JSON.
//!
//! Tool-call arguments arrive as string fragments. Consumers want a live
//! structured snapshot long before the JSON is complete, so the parser
//! here accepts any prefix of a well-formed document: it tracks nesting
//! and string/escape state, trims a dangling partial token, and closes
//! whatever remains open. Strictness is enforced by callers only at
//! block end.

use serde_json::Value;

/// Parse potentially incomplete JSON from a streaming response.
///
/// Tries strict parsing first, then repairs the prefix. Returns an empty
/// object when nothing sensible can be recovered.
pub fn parse_streaming_json(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Value::Object(serde_json::Map::new());
    }

    if let Ok(value) = serde_json::from_str(trimmed) {
        return value;
    }

    if let Some(repaired) = repair_prefix(trimmed) {
        if let Ok(value) = serde_json::from_str(&repaired) {
            return value;
        }
    }

    Value::Object(serde_json::Map::new())
}

/// Close an incomplete JSON prefix into a parseable document.
///
/// One pass over the input maintains the open-container stack (with a
/// key/value flag per object frame), string/escape state, and the last
/// position at which the document was structurally whole. A trailing
/// partial scalar is cut at that position; a partial string is kept and
/// closed; dangling `,`/`:`/bare keys are patched; open containers are
/// closed innermost-first.
fn repair_prefix(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    // (opening bracket, saw-colon-since-last-comma) per frame.
    let mut stack: Vec<(u8, bool)> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut string_is_key = false;
    // Byte index just past the last structurally-whole point.
    let mut boundary = 0usize;
    // Set when the input ends right after a closed key string.
    let mut pending_key_close: Option<usize> = None;

    for (i, &c) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == b'\\' {
                escaped = true;
            } else if c == b'"' {
                in_string = false;
                boundary = i + 1;
                if string_is_key {
                    pending_key_close = Some(i + 1);
                }
            }
            continue;
        }

        match c {
            b'"' => {
                in_string = true;
                string_is_key = matches!(stack.last(), Some((b'{', false)));
            }
            b'{' | b'[' => {
                stack.push((c, false));
                boundary = i + 1;
                pending_key_close = None;
            }
            b'}' | b']' => {
                stack.pop()?;
                boundary = i + 1;
                pending_key_close = None;
            }
            b':' => {
                if let Some(top) = stack.last_mut() {
                    top.1 = true;
                }
                boundary = i + 1;
                pending_key_close = None;
            }
            b',' => {
                if let Some(top) = stack.last_mut() {
                    top.1 = false;
                }
                boundary = i + 1;
                pending_key_close = None;
            }
            _ => {}
        }
    }

    if stack.is_empty() && !in_string {
        // Nesting is balanced; strict parsing failed for another reason.
        return None;
    }

    let mut repaired = if in_string {
        let mut s = text.to_string();
        if escaped {
            s.pop();
        }
        s.push('"');
        if string_is_key {
            s.push_str(": null");
        }
        s
    } else {
        // Everything past the boundary is a partial scalar; cut it.
        let mut s = text[..boundary].to_string();
        loop {
            let t = s.trim_end().to_string();
            if let Some(stripped) = t.strip_suffix(',') {
                s = stripped.to_string();
            } else if let Some(stripped) = t.strip_suffix(':') {
                s = format!("{stripped}: null");
                break;
            } else {
                s = t;
                break;
            }
        }
        if pending_key_close == Some(boundary) {
            s.push_str(": null");
        }
        s
    };

    for &(open, _) in stack.iter().rev() {
        repaired.push(if open == b'{' { '}' } else { ']' });
    }
    Some(repaired)
}
