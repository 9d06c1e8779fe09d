//! Splitting a multi-code-object dump into named segments.

const HEADER_PREFIX: &str = "Disassembly of ";

/// Disassembly of one code object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment<'a> {
    pub name: String,
    pub body: &'a str,
}

/// Drops `#` comment lines and surrounding whitespace.
pub fn strip_comments(dump: &str) -> String {
    dump.lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Splits on `Disassembly of X:` headers. Text before the first header is
/// the module body and is named `main`; it is skipped when blank.
pub fn split_segments(dump: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut name = "main".to_string();
    let mut start = 0;
    let mut pos = 0;

    for line in dump.split_inclusive('\n') {
        if let Some(header) = parse_header(line) {
            push_segment(&mut segments, name, &dump[start..pos]);
            name = header;
            start = pos + line.len();
        }
        pos += line.len();
    }
    push_segment(&mut segments, name, &dump[start..]);
    segments
}

fn push_segment<'a>(segments: &mut Vec<Segment<'a>>, name: String, body: &'a str) {
    if segments.is_empty() && name == "main" && body.trim().is_empty() {
        return;
    }
    segments.push(Segment { name, body });
}

fn parse_header(line: &str) -> Option<String> {
    let described = line.trim().strip_prefix(HEADER_PREFIX)?.strip_suffix(':')?;
    if described.starts_with('<') {
        Some(code_object_name(described).unwrap_or_else(|| sanitize_ident(described)))
    } else {
        Some(described.to_string())
    }
}

/// Stable name for `<code object NAME at 0xADDR, file ..., line N>`:
/// `NAME_0xADDR`, with the angle brackets of `<lambda>`-style names removed.
pub fn code_object_name(descriptor: &str) -> Option<String> {
    let rest = descriptor.trim().strip_prefix("<code object ")?;
    let (name, rest) = rest.split_once(" at ")?;
    let address = rest.split([',', '>', ' ']).next().filter(|a| !a.is_empty())?;
    let name = name.trim_start_matches('<').trim_end_matches('>');
    Some(format!("{name}_{address}"))
}

fn sanitize_ident(s: &str) -> String {
    let out: String = s
        .chars()
        .enumerate()
        .map(|(i, ch)| {
            let ok = if i == 0 {
                ch == '_' || ch.is_ascii_alphabetic()
            } else {
                ch == '_' || ch.is_ascii_alphanumeric()
            };
            if ok { ch } else { '_' }
        })
        .collect();
    let out = out.trim_matches('_');
    if out.is_empty() { "_".into() } else { out.to_string() }
}
