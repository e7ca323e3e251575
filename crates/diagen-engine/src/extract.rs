use std::sync::OnceLock;

use regex::{NoExpand, Regex};

/// Line marker used when the model answers without a fenced block.
pub const CODE_MARKER: &str = "from diagrams";

/// Identifier spellings models tend to get wrong, and what the diagrams
/// package actually exports. Applied in order.
pub const IDENTIFIER_CORRECTIONS: &[(&str, &str)] =
    &[("DynamoDB", "Dynamodb"), ("ApiGateway", "APIGateway")];

pub const DEFAULT_DIAGRAM_CODE: &str = r#"from diagrams import Diagram
from diagrams.aws.compute import EC2
from diagrams.aws.database import RDS
from diagrams.aws.network import ELB

with Diagram("Grouped Workers", show=False, outformat="png"):
    ELB("lb") >> EC2("web") >> RDS("userdb")
"#;

fn fence_regex() -> &'static Regex {
    static FENCE_RE: OnceLock<Regex> = OnceLock::new();
    FENCE_RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:python)?\n(.*?)```").expect("fence pattern is valid")
    })
}

fn title_regex() -> &'static Regex {
    static TITLE_RE: OnceLock<Regex> = OnceLock::new();
    TITLE_RE.get_or_init(|| {
        Regex::new(r#"with Diagram\(".*?""#).expect("title pattern is valid")
    })
}

/// Pulls the program text out of a model reply.
///
/// The first fenced block wins. Without one, everything from the first line
/// containing [`CODE_MARKER`] onwards is kept. Otherwise the result is empty.
pub fn filter_generated_code(generated: &str) -> String {
    if let Some(body) = fence_regex()
        .captures(generated)
        .and_then(|captures| captures.get(1))
    {
        return body.as_str().trim().to_string();
    }

    let normalized = generated.replace("\r\n", "\n");
    let mut kept = Vec::new();
    let mut started = false;
    for line in normalized.split(is_line_break) {
        if !started && line.contains(CODE_MARKER) {
            started = true;
        }
        if started {
            kept.push(line);
        }
    }
    kept.join("\n").trim().to_string()
}

/// Any line boundary, including a bare `\r` and the Unicode separators.
/// Expects `\r\n` to be folded into `\n` already.
fn is_line_break(ch: char) -> bool {
    matches!(
        ch,
        '\n' | '\r' | '\x0b' | '\x0c' | '\x1c' | '\x1d' | '\x1e' | '\u{85}' | '\u{2028}' | '\u{2029}'
    )
}

pub fn apply_identifier_corrections(code: &str) -> String {
    IDENTIFIER_CORRECTIONS
        .iter()
        .fold(code.to_string(), |acc, &(from, to)| acc.replace(from, to))
}

/// Extraction followed by identifier corrections.
pub fn extract_diagram_code(generated: &str) -> String {
    apply_identifier_corrections(&filter_generated_code(generated))
}

/// Points every `with Diagram("...")` title at `title`.
///
/// The diagrams package names its output after the title (lowercased, spaces
/// to underscores), so this is what pins the PNG file name.
pub fn rewrite_diagram_title(code: &str, title: &str) -> String {
    let replacement = format!("with Diagram(\"{title}\"");
    title_regex()
        .replace_all(code, NoExpand(&replacement))
        .into_owned()
}
